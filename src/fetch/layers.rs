// src/fetch/layers.rs
// =============================================================================
// The four concrete retrieval layers.
//
// Each layer owns its own reqwest Client so it can carry its own timeout:
// rendering proxies execute JavaScript and need far longer than a plain GET.
// Clients are cheap to clone and pool connections internally.
// =============================================================================

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, USER_AGENT};
use reqwest::{Client, Response};
use std::time::Duration;

use super::{FetchLayer, Retrieved, Retriever};
use crate::config::{FetchConfig, ReaderFormat};
use crate::error::{Result, RetrievalError, ScoutError};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

fn build_client(timeout_secs: u64, headers: HeaderMap) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .redirect(reqwest::redirect::Policy::limited(5))
        .default_headers(headers)
        .build()
        .map_err(|e| ScoutError::Config(format!("cannot build HTTP client: {}", e)))
}

// Turns a response into its body, treating any non-2xx status as a failure
async fn read_body(response: Response) -> std::result::Result<String, RetrievalError> {
    let status = response.status();
    if !status.is_success() {
        return Err(RetrievalError::Status(status.as_u16()));
    }
    Ok(response.text().await?)
}

/// Layer 1: plain GET with a generic user agent.
pub struct DirectRetriever {
    client: Client,
    user_agent: String,
}

impl DirectRetriever {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.direct_timeout_secs, HeaderMap::new())?,
            user_agent: config.user_agent.clone(),
        })
    }
}

#[async_trait]
impl Retriever for DirectRetriever {
    fn layer(&self) -> FetchLayer {
        FetchLayer::Direct
    }

    async fn retrieve(&self, url: &str) -> std::result::Result<Retrieved, RetrievalError> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await?;
        Ok(Retrieved::html(read_body(response).await?))
    }
}

/// Layer 2: GET dressed up as a desktop browser navigation.
///
/// HTTP/2 is negotiated through ALPN whenever the server offers it.
pub struct BrowserRetriever {
    client: Client,
}

impl BrowserRetriever {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.browser_timeout_secs, browser_headers())?,
        })
    }
}

pub(crate) fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7"),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    headers.insert("upgrade-insecure-requests", HeaderValue::from_static("1"));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("none"));
    headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static("\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\""),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers
}

#[async_trait]
impl Retriever for BrowserRetriever {
    fn layer(&self) -> FetchLayer {
        FetchLayer::BrowserHeaders
    }

    async fn retrieve(&self, url: &str) -> std::result::Result<Retrieved, RetrievalError> {
        let response = self.client.get(url).send().await?;
        Ok(Retrieved::html(read_body(response).await?))
    }
}

/// Layer 3: third-party service that renders JavaScript behind premium
/// residential proxies. Skipped while no API key is configured.
pub struct RenderingProxyRetriever {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl RenderingProxyRetriever {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.render_timeout_secs, HeaderMap::new())?,
            endpoint: config.render_endpoint.clone(),
            api_key: config.render_api_key.clone(),
        })
    }
}

#[async_trait]
impl Retriever for RenderingProxyRetriever {
    fn layer(&self) -> FetchLayer {
        FetchLayer::RenderingProxy
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn retrieve(&self, url: &str) -> std::result::Result<Retrieved, RetrievalError> {
        let api_key = self.api_key.as_deref().ok_or(RetrievalError::NotConfigured)?;
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("api_key", api_key),
                ("url", url),
                ("render_js", "true"),
                ("premium_proxy", "true"),
                ("country_code", "br"),
            ])
            .send()
            .await?;
        Ok(Retrieved::html(read_body(response).await?))
    }
}

/// Layer 4: public reader proxy that strips boilerplate and gets past some
/// anti-bot walls. The target URL is appended to the endpoint.
pub struct ReaderProxyRetriever {
    client: Client,
    endpoint: String,
    format: ReaderFormat,
}

impl ReaderProxyRetriever {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.reader_timeout_secs, HeaderMap::new())?,
            endpoint: config.reader_endpoint.clone(),
            format: config.reader_format,
        })
    }

    pub(crate) fn proxied_url(&self, url: &str) -> String {
        format!("{}{}", self.endpoint, url)
    }
}

#[async_trait]
impl Retriever for ReaderProxyRetriever {
    fn layer(&self) -> FetchLayer {
        FetchLayer::ReaderProxy
    }

    async fn retrieve(&self, url: &str) -> std::result::Result<Retrieved, RetrievalError> {
        let mut request = self.client.get(self.proxied_url(url));
        if self.format == ReaderFormat::Html {
            request = request.header("X-Return-Format", "html");
        }
        let body = read_body(request.send().await?).await?;

        Ok(match self.format {
            ReaderFormat::Html => Retrieved::html(body),
            ReaderFormat::Markdown => Retrieved::markdown(body),
        })
    }
}

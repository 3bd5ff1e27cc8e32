// src/paginate/mod.rs
// =============================================================================
// Generic paginator: walks an unknown listing site page by page.
//
// How it works:
// 1. Fetch the current page through a PageSource
// 2. On the first successful page, detect the site's pagination idiom
// 3. Run the caller's extraction function and keep only items not seen
//    earlier in this session (by identity key)
// 4. Move on to the advertised "next page" link, or synthesize the next
//    page URL from the detected profile
// 5. Stop after `max_empty_pages` pages in a row without new items, after
//    `max_pages` pages, or when a URL comes round a second time
//
// Pages are fetched strictly in order: the next URL depends on the current
// page's markup. A failed fetch or a failed extraction counts as an empty
// page and never ends the session on its own, but failed fetches are
// counted: a session with any of them did not see the whole listing.
// =============================================================================

mod detect;
mod links;

pub use detect::{detect, PaginationProfile, PatternKind, QUERY_MARKERS};
pub use links::{extract_links, find_next_link, PageLink};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::PaginationConfig;
use crate::error::{Result, ScoutError};
use crate::fetch::{ContentKind, FetchResult, MultiLayerFetcher};
use crate::urlnorm::url_identity_key;

/// Anything that can turn a URL into page content.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> FetchResult;
}

#[async_trait]
impl PageSource for MultiLayerFetcher {
    async fn fetch_page(&self, url: &str) -> FetchResult {
        match self.fetch(url).await {
            Ok(result) => result,
            Err(e) => FetchResult::failed(url, e.to_string()),
        }
    }
}

#[async_trait]
impl<P: PageSource + ?Sized> PageSource for Arc<P> {
    async fn fetch_page(&self, url: &str) -> FetchResult {
        (**self).fetch_page(url).await
    }
}

/// Items collected by a session must say who they are, so repeated content
/// on overflow pages is not counted twice.
pub trait Identified {
    /// Stable identifier or URL; None means the item cannot be deduplicated
    fn identity(&self) -> Option<String>;
}

/// What the extraction function is handed for each page.
#[derive(Debug, Clone, Copy)]
pub struct Page<'a> {
    pub url: &'a str,
    pub content: &'a str,
    pub kind: ContentKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Too many consecutive pages without new items
    EmptyPages,
    /// Safety cap on pages per session reached
    PageCap,
    /// The next URL was already visited
    Cycle,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginationReport<T> {
    pub items: Vec<T>,
    pub pages_visited: usize,
    pub visited_urls: Vec<String>,
    pub profile: Option<PaginationProfile>,
    pub stop_reason: StopReason,
    /// Pages whose fetch failed on every layer (or was refused by the limiter)
    pub failed_pages: usize,
}

impl<T> PaginationReport<T> {
    /// True when the session walked the listing to its end: no page cap and
    /// no page lost to a failed fetch. Only a complete session may be used to
    /// decide that a listing disappeared.
    pub fn is_complete(&self) -> bool {
        self.stop_reason != StopReason::PageCap && self.failed_pages == 0
    }
}

pub struct GenericPaginator<S> {
    source: S,
    config: PaginationConfig,
}

impl<S: PageSource> GenericPaginator<S> {
    pub fn new(source: S, config: PaginationConfig) -> Self {
        Self { source, config }
    }

    /// Collects every new item reachable from `start_url`.
    pub async fn paginate<T, F>(&self, start_url: &str, extract: F) -> Result<Vec<T>>
    where
        T: Identified + Send,
        F: Fn(&Page<'_>) -> anyhow::Result<Vec<T>> + Send + Sync,
    {
        Ok(self.paginate_with_report(start_url, extract).await?.items)
    }

    pub async fn paginate_with_report<T, F>(
        &self,
        start_url: &str,
        extract: F,
    ) -> Result<PaginationReport<T>>
    where
        T: Identified + Send,
        F: Fn(&Page<'_>) -> anyhow::Result<Vec<T>> + Send + Sync,
    {
        let start = Url::parse(start_url).map_err(|e| ScoutError::invalid_url(start_url, e))?;
        let default_ipp = self.config.default_items_per_page;

        let mut profile = detect::detect_from_url(&start, default_ipp);
        let mut page_number = profile.as_ref().map_or(1, |p| p.page_number);
        let mut current = start.to_string();

        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut seen_items: HashSet<String> = HashSet::new();
        let mut visited_urls = Vec::new();
        let mut items: Vec<T> = Vec::new();
        let mut empty_streak = 0;
        let mut failed_pages = 0;

        info!(url = %start_url, "pagination session started");

        let stop_reason = loop {
            if visited_urls.len() >= self.config.max_pages {
                break StopReason::PageCap;
            }

            let key = url_identity_key(&current).unwrap_or_else(|| current.clone());
            if !seen_urls.insert(key) {
                debug!(url = %current, "page already visited");
                break StopReason::Cycle;
            }

            if !visited_urls.is_empty() && !self.config.page_delay().is_zero() {
                tokio::time::sleep(self.config.page_delay()).await;
            }

            let result = self.source.fetch_page(&current).await;
            visited_urls.push(current.clone());
            // `current` always comes from Url::to_string or a resolved link
            let current_url = Url::parse(&current).unwrap_or_else(|_| start.clone());

            let mut new_items = 0;
            let mut links = Vec::new();

            if result.success {
                let kind = result.content_kind.unwrap_or(ContentKind::Html);
                links = extract_links(&result.content, kind, &current_url);

                if profile.is_none() {
                    let hrefs: Vec<String> = links.iter().map(|l| l.url.clone()).collect();
                    let detected = detect(&current_url, &result.content, &hrefs, default_ipp);
                    info!(url = %current, kind = ?detected.kind, parameter = %detected.parameter, "pagination pattern detected");
                    profile = Some(detected);
                }

                let page = Page {
                    url: &current,
                    content: &result.content,
                    kind,
                };
                match extract(&page) {
                    Ok(page_items) => {
                        // Offsets are item-indexed: learn the page size from the first page
                        if visited_urls.len() == 1 && !page_items.is_empty() {
                            if let Some(p) = profile.as_mut().filter(|p| p.is_offset_based()) {
                                p.items_per_page = page_items.len();
                            }
                        }
                        for item in page_items {
                            let is_new = match item.identity() {
                                Some(id) => seen_items.insert(id),
                                None => true,
                            };
                            if is_new {
                                items.push(item);
                                new_items += 1;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(url = %current, error = %e, "extraction failed, treating page as empty");
                    }
                }
            } else {
                failed_pages += 1;
                warn!(
                    url = %current,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "page fetch failed, treating page as empty"
                );
            }

            debug!(url = %current, new_items, total = items.len(), "page processed");

            if new_items == 0 {
                empty_streak += 1;
                if empty_streak >= self.config.max_empty_pages {
                    break StopReason::EmptyPages;
                }
            } else {
                empty_streak = 0;
            }

            page_number += 1;
            current = match find_next_link(&links) {
                Some(next) => next,
                None => profile
                    .get_or_insert_with(|| PaginationProfile::default_profile(default_ipp))
                    .page_url(&start, page_number),
            };
        };

        info!(
            url = %start_url,
            pages = visited_urls.len(),
            items = items.len(),
            failed_pages,
            stop = ?stop_reason,
            "pagination session finished"
        );

        Ok(PaginationReport {
            items,
            pages_visited: visited_urls.len(),
            visited_urls,
            profile,
            stop_reason,
            failed_pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned pages by URL and records the order of requests.
    struct StaticSite {
        pages: HashMap<String, String>,
        requests: Mutex<Vec<String>>,
    }

    impl StaticSite {
        fn new(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(u, body)| (u.to_string(), body.to_string()))
                    .collect(),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSource for StaticSite {
        async fn fetch_page(&self, url: &str) -> FetchResult {
            self.requests.lock().unwrap().push(url.to_string());
            match self.pages.get(url) {
                Some(body) => FetchResult {
                    url: url.to_string(),
                    success: true,
                    content: body.clone(),
                    content_kind: Some(ContentKind::Html),
                    layer_used: Some(crate::fetch::FetchLayer::Direct),
                    content_length: body.len(),
                    error: None,
                    rate_limited: false,
                    attempts: Vec::new(),
                },
                None => FetchResult::failed(url, "HTTP 404"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Lot(String);

    impl Identified for Lot {
        fn identity(&self) -> Option<String> {
            Some(self.0.clone())
        }
    }

    // Items are written as <li data-lot="id"></li>
    fn lots(page: &Page<'_>) -> anyhow::Result<Vec<Lot>> {
        Ok(page
            .content
            .split("data-lot=\"")
            .skip(1)
            .filter_map(|rest| rest.split('"').next())
            .map(|id| Lot(id.to_string()))
            .collect())
    }

    fn config() -> PaginationConfig {
        PaginationConfig {
            max_pages: 50,
            page_delay_ms: 0,
            max_empty_pages: 2,
            default_items_per_page: 20,
        }
    }

    #[tokio::test]
    async fn test_repeated_overflow_pages_terminate_without_double_counting() {
        let site = StaticSite::new(&[
            ("https://s.com.br/l?page=1", r#"<li data-lot="a"></li><li data-lot="b"></li>"#),
            ("https://s.com.br/l?page=2", r#"<li data-lot="c"></li><li data-lot="d"></li>"#),
            ("https://s.com.br/l?page=3", r#"<li data-lot="c"></li><li data-lot="d"></li>"#),
            ("https://s.com.br/l?page=4", r#"<li data-lot="c"></li><li data-lot="d"></li>"#),
            ("https://s.com.br/l?page=5", r#"<li data-lot="c"></li><li data-lot="d"></li>"#),
        ]);
        let paginator = GenericPaginator::new(site, config());

        let report = paginator
            .paginate_with_report("https://s.com.br/l?page=1", lots)
            .await
            .unwrap();

        assert_eq!(report.items, vec![Lot("a".into()), Lot("b".into()), Lot("c".into()), Lot("d".into())]);
        assert_eq!(report.stop_reason, StopReason::EmptyPages);
        assert_eq!(report.pages_visited, 4);
    }

    #[tokio::test]
    async fn test_follows_next_links_in_order() {
        let site = StaticSite::new(&[
            ("https://s.com.br/imoveis", r#"<li data-lot="1"></li><a rel="next" href="/imoveis/pagina/2">2</a>"#),
            ("https://s.com.br/imoveis/pagina/2", r#"<li data-lot="2"></li><a href="/imoveis/pagina/3">Próxima</a>"#),
            ("https://s.com.br/imoveis/pagina/3", r#"<li data-lot="3"></li>"#),
        ]);
        let paginator = GenericPaginator::new(site, config());

        let report = paginator
            .paginate_with_report("https://s.com.br/imoveis", lots)
            .await
            .unwrap();

        assert_eq!(report.items.len(), 3);
        assert_eq!(
            &report.visited_urls[..3],
            &[
                "https://s.com.br/imoveis".to_string(),
                "https://s.com.br/imoveis/pagina/2".to_string(),
                "https://s.com.br/imoveis/pagina/3".to_string(),
            ]
        );
        assert_eq!(report.profile.unwrap().kind, PatternKind::PathSegment);
    }

    #[tokio::test]
    async fn test_next_link_back_to_visited_page_is_a_cycle() {
        let site = StaticSite::new(&[
            ("https://s.com.br/a", r#"<li data-lot="1"></li><a rel="next" href="/b">»</a>"#),
            ("https://s.com.br/b", r#"<li data-lot="2"></li><a rel="next" href="/a/">»</a>"#),
        ]);
        let paginator = GenericPaginator::new(site, config());

        let report = paginator.paginate_with_report("https://s.com.br/a", lots).await.unwrap();

        assert_eq!(report.stop_reason, StopReason::Cycle);
        assert_eq!(report.pages_visited, 2);
        assert_eq!(report.items.len(), 2);
    }

    #[tokio::test]
    async fn test_page_cap() {
        let pages: Vec<(String, String)> = (1..=10)
            .map(|n| (format!("https://s.com.br/l?page={}", n), format!("<li data-lot=\"{}\"></li>", n)))
            .collect();
        let refs: Vec<(&str, &str)> = pages.iter().map(|(u, b)| (u.as_str(), b.as_str())).collect();
        let site = StaticSite::new(&refs);
        let paginator = GenericPaginator::new(site, PaginationConfig { max_pages: 3, ..config() });

        let report = paginator.paginate_with_report("https://s.com.br/l?page=1", lots).await.unwrap();

        assert_eq!(report.stop_reason, StopReason::PageCap);
        assert_eq!(report.items.len(), 3);
    }

    #[tokio::test]
    async fn test_extraction_error_counts_as_empty_page() {
        let site = StaticSite::new(&[
            ("https://s.com.br/l?page=1", "quebrado"),
            ("https://s.com.br/l?page=2", r#"<li data-lot="x"></li>"#),
        ]);
        let paginator = GenericPaginator::new(site, config());

        let items = paginator
            .paginate("https://s.com.br/l?page=1", |page: &Page<'_>| {
                if page.content == "quebrado" {
                    anyhow::bail!("unexpected markup");
                }
                lots(page)
            })
            .await
            .unwrap();

        assert_eq!(items, vec![Lot("x".into())]);
    }

    #[tokio::test]
    async fn test_fallback_profile_when_nothing_detected() {
        let site = StaticSite::new(&[
            ("https://s.com.br/busca", r#"<li data-lot="1"></li>"#),
            ("https://s.com.br/busca?page=2", r#"<li data-lot="2"></li>"#),
        ]);
        let paginator = GenericPaginator::new(site, config());

        let report = paginator.paginate_with_report("https://s.com.br/busca", lots).await.unwrap();

        assert_eq!(report.items.len(), 2);
        assert_eq!(report.profile, Some(PaginationProfile::default_profile(20)));
        // page=2 served, page=3 and page=4 are 404s
        assert_eq!(report.pages_visited, 4);
        assert_eq!(report.stop_reason, StopReason::EmptyPages);
    }

    #[tokio::test]
    async fn test_offset_advances_by_items_per_page() {
        let site = StaticSite::new(&[
            ("https://s.com.br/api?offset=0", r#"<li data-lot="1"></li><li data-lot="2"></li><li data-lot="3"></li>"#),
            ("https://s.com.br/api?offset=3", r#"<li data-lot="4"></li>"#),
        ]);
        let paginator = GenericPaginator::new(site, config());

        let report = paginator.paginate_with_report("https://s.com.br/api?offset=0", lots).await.unwrap();

        assert_eq!(report.items.len(), 4);
        assert_eq!(report.visited_urls[1], "https://s.com.br/api?offset=3");
    }

    #[tokio::test]
    async fn test_offset_start_keeps_moving_forward_after_page_size_is_learned() {
        let site = StaticSite::new(&[
            (
                "https://s.com.br/api?offset=40",
                r#"<li data-lot="41"></li><li data-lot="42"></li><li data-lot="43"></li>"#,
            ),
            ("https://s.com.br/api?offset=43", r#"<li data-lot="44"></li><li data-lot="45"></li>"#),
        ]);
        let paginator = GenericPaginator::new(site, config());

        let report = paginator.paginate_with_report("https://s.com.br/api?offset=40", lots).await.unwrap();

        assert_eq!(report.items.len(), 5);
        assert_eq!(
            &report.visited_urls[..3],
            &[
                "https://s.com.br/api?offset=40".to_string(),
                "https://s.com.br/api?offset=43".to_string(),
                "https://s.com.br/api?offset=46".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_session_with_failed_fetches_is_incomplete() {
        let site = StaticSite::new(&[]);
        let paginator = GenericPaginator::new(site, config());

        let report = paginator.paginate_with_report("https://s.com.br/l?page=1", lots).await.unwrap();

        assert_eq!(report.stop_reason, StopReason::EmptyPages);
        assert!(report.items.is_empty());
        assert_eq!(report.failed_pages, 2);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_session_ending_on_served_empty_pages_is_complete() {
        let site = StaticSite::new(&[
            ("https://s.com.br/l?page=1", r#"<li data-lot="a"></li>"#),
            ("https://s.com.br/l?page=2", "<p>Nenhum imóvel</p>"),
            ("https://s.com.br/l?page=3", "<p>Nenhum imóvel</p>"),
        ]);
        let paginator = GenericPaginator::new(site, config());

        let report = paginator.paginate_with_report("https://s.com.br/l?page=1", lots).await.unwrap();

        assert_eq!(report.failed_pages, 0);
        assert!(report.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_page_delay_between_pages() {
        let site = StaticSite::new(&[
            ("https://s.com.br/l?page=1", r#"<li data-lot="a"></li>"#),
            ("https://s.com.br/l?page=2", r#"<li data-lot="b"></li>"#),
            ("https://s.com.br/l?page=3", "<p>fim</p>"),
            ("https://s.com.br/l?page=4", "<p>fim</p>"),
        ]);
        let paginator = GenericPaginator::new(site, PaginationConfig { page_delay_ms: 500, ..config() });

        let started = tokio::time::Instant::now();
        let report = paginator.paginate_with_report("https://s.com.br/l?page=1", lots).await.unwrap();

        assert_eq!(report.pages_visited, 4);
        // No wait before the first page, one per page after it
        let waited = started.elapsed();
        assert!(waited >= std::time::Duration::from_millis(1500));
        assert!(waited < std::time::Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_invalid_start_url_is_an_error() {
        let paginator = GenericPaginator::new(StaticSite::new(&[]), config());
        assert!(paginator.paginate("sem esquema", lots).await.is_err());
    }
}

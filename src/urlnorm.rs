// src/urlnorm.rs
// =============================================================================
// Normalized URL identity key.
//
// Two listing URLs that differ only by
//   - scheme/host case            (https://X.com vs https://x.com)
//   - a trailing slash            (/imovel/1/ vs /imovel/1)
//   - utm_* tracking parameters   (?utm_source=fb)
//   - a #fragment
// name the same listing. Every other query parameter is kept in its
// original order and encoding, since listing sites often put the lot id
// in the query string.
//
// The paginator uses the same key for its cycle guard.
// =============================================================================

use url::Url;

use crate::error::{Result, ScoutError};

pub fn normalize_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim()).map_err(|e| ScoutError::invalid_url(raw, e))?;

    // Url lower-cases the scheme and host and drops default ports for us
    let mut key = format!("{}://", url.scheme());
    if let Some(host) = url.host_str() {
        key.push_str(&host.to_ascii_lowercase());
    }
    if let Some(port) = url.port() {
        key.push_str(&format!(":{}", port));
    }
    key.push_str(url.path().trim_end_matches('/'));

    if let Some(query) = url.query() {
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| !pair.is_empty() && !is_tracking_param(pair))
            .collect();
        if !kept.is_empty() {
            key.push('?');
            key.push_str(&kept.join("&"));
        }
    }

    Ok(key)
}

/// Tolerant variant for scraped data: unparsable URLs fall back to their
/// trimmed, lower-cased text so they can still be compared.
pub fn url_identity_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(normalize_url(trimmed).unwrap_or_else(|_| trimmed.trim_end_matches('/').to_lowercase()))
}

fn is_tracking_param(pair: &str) -> bool {
    let name = pair.split('=').next().unwrap_or("");
    name.to_ascii_lowercase().starts_with("utm_")
}

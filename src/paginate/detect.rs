// src/paginate/detect.rs
// =============================================================================
// Pagination idiom detection and page URL synthesis.
//
// Detection order:
//   1. The start URL itself (?page=3, /page/3)
//   2. "Next page" style links found on the first page
//   3. Infinite-scroll / "load more" markers in the first page's markup
//   4. Fallback: ?page=N starting at 1
// =============================================================================

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use url::Url;

// Query parameters that carry a page (or item offset) across listing sites
pub const QUERY_MARKERS: &[&str] = &["page", "p", "pagina", "pg", "offset", "start"];

// Parameters indexed by item rather than by page
const OFFSET_MARKERS: &[&str] = &["offset", "start"];

const INFINITE_SCROLL_MARKERS: &[&str] = &[
    "infinite-scroll",
    "infinitescroll",
    "load-more",
    "loadmore",
    "data-next-page",
    "carregar mais",
    "ver mais imóveis",
    "load more",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    QueryString,
    PathSegment,
    InfiniteScroll,
}

/// How a listing site pages its results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaginationProfile {
    pub kind: PatternKind,
    /// Query parameter name, or path segment name for /page/N
    pub parameter: String,
    /// Page number of the start URL; always 1 for offset parameters
    pub page_number: usize,
    pub items_per_page: usize,
    /// Item offset of page 1 for offset parameters (?offset=40 starts at 40)
    pub start_offset: usize,
}

impl PaginationProfile {
    pub fn default_profile(items_per_page: usize) -> Self {
        Self {
            kind: PatternKind::QueryString,
            parameter: "page".to_string(),
            page_number: 1,
            items_per_page,
            start_offset: 0,
        }
    }

    pub fn is_offset_based(&self) -> bool {
        self.kind == PatternKind::QueryString && OFFSET_MARKERS.contains(&self.parameter.as_str())
    }

    /// URL of `page_number`, derived from `base`.
    pub fn page_url(&self, base: &Url, page_number: usize) -> String {
        match self.kind {
            PatternKind::PathSegment => with_path_page(base, &self.parameter, page_number),
            PatternKind::QueryString | PatternKind::InfiniteScroll => {
                let value = if self.is_offset_based() {
                    self.start_offset + page_number.saturating_sub(1) * self.items_per_page
                } else {
                    page_number
                };
                with_query_value(base, &self.parameter, value)
            }
        }
    }
}

fn path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)/(page|pagina)/(\d+)").expect("valid path pattern"))
}

/// Looks for a pagination marker in the URL itself.
pub fn detect_from_url(url: &Url, items_per_page: usize) -> Option<PaginationProfile> {
    for marker in QUERY_MARKERS {
        let value = url
            .query_pairs()
            .find(|(key, _)| key.eq_ignore_ascii_case(marker))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok());

        if let Some(value) = value {
            let mut profile = PaginationProfile {
                kind: PatternKind::QueryString,
                parameter: marker.to_string(),
                page_number: value.max(1),
                items_per_page,
                start_offset: 0,
            };
            // Offset sessions count pages from the start URL's offset
            if profile.is_offset_based() {
                profile.page_number = 1;
                profile.start_offset = value;
            }
            return Some(profile);
        }
    }

    path_pattern().captures(url.path()).map(|caps| PaginationProfile {
        kind: PatternKind::PathSegment,
        parameter: caps[1].to_lowercase(),
        page_number: caps[2].parse::<usize>().unwrap_or(1).max(1),
        items_per_page,
        start_offset: 0,
    })
}

/// Looks for a pagination marker in links discovered on the current page.
pub fn detect_from_links(
    page_url: &Url,
    links: &[String],
    items_per_page: usize,
) -> Option<PaginationProfile> {
    for link in links {
        let Ok(parsed) = Url::parse(link) else {
            continue;
        };
        if parsed.host_str() != page_url.host_str() {
            continue;
        }
        if let Some(mut profile) = detect_from_url(&parsed, items_per_page) {
            // The page we are on is the first of the session
            profile.page_number = 1;
            profile.start_offset = 0;
            return Some(profile);
        }
    }
    None
}

pub fn has_infinite_scroll(content: &str) -> bool {
    let lowered = content.to_lowercase();
    INFINITE_SCROLL_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Runs the full detection order, always producing a profile.
pub fn detect(
    page_url: &Url,
    content: &str,
    links: &[String],
    items_per_page: usize,
) -> PaginationProfile {
    if let Some(profile) = detect_from_url(page_url, items_per_page) {
        return profile;
    }
    if let Some(profile) = detect_from_links(page_url, links, items_per_page) {
        return profile;
    }
    if has_infinite_scroll(content) {
        return PaginationProfile {
            kind: PatternKind::InfiniteScroll,
            parameter: "page".to_string(),
            page_number: 1,
            items_per_page,
            start_offset: 0,
        };
    }
    PaginationProfile::default_profile(items_per_page)
}

fn with_query_value(base: &Url, parameter: &str, value: usize) -> String {
    let mut pairs: Vec<(String, String)> = base
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    match pairs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(parameter)) {
        Some(pair) => pair.1 = value.to_string(),
        None => pairs.push((parameter.to_string(), value.to_string())),
    }

    let mut url = base.clone();
    url.set_fragment(None);
    url.query_pairs_mut().clear().extend_pairs(pairs);
    url.to_string()
}

fn with_path_page(base: &Url, segment: &str, page_number: usize) -> String {
    let mut url = base.clone();
    url.set_fragment(None);

    let path = base.path();
    let new_path = if path_pattern().is_match(path) {
        path_pattern()
            .replace(path, format!("/{}/{}", segment, page_number).as_str())
            .into_owned()
    } else {
        format!("{}/{}/{}", path.trim_end_matches('/'), segment, page_number)
    };
    url.set_path(&new_path);
    url.to_string()
}

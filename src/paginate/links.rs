// src/paginate/links.rs
// =============================================================================
// Link discovery on a fetched listing page.
//
// HTML pages are parsed with `scraper`; markdown pages (from the reader
// proxy) with `pulldown-cmark`. Both produce the same PageLink list, which
// feeds pagination detection and "next page" discovery.
//
// Next-page heuristics, highest priority first:
//   1. rel="next"
//   2. a class containing "next" / "proxima"
//   3. an aria-label naming the next page
//   4. link text: "Próxima", "Próximo", "Next", "»", "›"
// =============================================================================

use pulldown_cmark::{Event, Parser, Tag};
use scraper::{Html, Selector};
use url::Url;

use crate::fetch::ContentKind;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageLink {
    /// Absolute URL
    pub url: String,
    pub text: String,
    pub rel: String,
    pub class: String,
    pub aria_label: String,
}

const NEXT_WORDS: &[&str] = &["próxima", "proxima", "próximo", "proximo", "next", "seguinte"];
const NEXT_SYMBOLS: &[&str] = &["»", "›", ">", ">>", "→"];

pub fn extract_links(content: &str, kind: ContentKind, page_url: &Url) -> Vec<PageLink> {
    match kind {
        ContentKind::Html => extract_html_links(content, page_url),
        ContentKind::Markdown => extract_markdown_links(content, page_url),
    }
}

fn extract_html_links(html: &str, page_url: &Url) -> Vec<PageLink> {
    let document = Html::parse_document(html);
    // Constant selector, known to be valid
    let selector = match Selector::parse("a[href], link[rel][href]") {
        Ok(selector) => selector,
        Err(_) => return Vec::new(),
    };

    document
        .select(&selector)
        .filter_map(|element| {
            let attrs = element.value();
            let url = resolve_link(page_url, attrs.attr("href")?)?;
            Some(PageLink {
                url,
                text: collapse_whitespace(&element.text().collect::<String>()),
                rel: attrs.attr("rel").unwrap_or("").to_lowercase(),
                class: attrs.attr("class").unwrap_or("").to_lowercase(),
                aria_label: attrs.attr("aria-label").unwrap_or("").to_lowercase(),
            })
        })
        .collect()
}

fn extract_markdown_links(markdown: &str, page_url: &Url) -> Vec<PageLink> {
    let mut links = Vec::new();
    // (destination, text collected so far) while inside a link
    let mut current: Option<(String, String)> = None;

    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Link(_link_type, dest_url, _title)) => {
                current = Some((dest_url.to_string(), String::new()));
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some((_, label)) = current.as_mut() {
                    label.push_str(&text);
                }
            }
            Event::End(Tag::Link(..)) => {
                if let Some((dest, label)) = current.take() {
                    if let Some(url) = resolve_link(page_url, &dest) {
                        links.push(PageLink {
                            url,
                            text: collapse_whitespace(&label),
                            ..Default::default()
                        });
                    }
                }
            }
            _ => {}
        }
    }

    links
}

/// Picks the "next page" link, if the page advertises one.
pub fn find_next_link(links: &[PageLink]) -> Option<String> {
    let heuristics: [fn(&PageLink) -> bool; 4] = [
        |l| l.rel.split_whitespace().any(|r| r == "next"),
        |l| l.class.contains("next") || l.class.contains("proxima") || l.class.contains("próxima"),
        |l| !l.aria_label.is_empty() && NEXT_WORDS.iter().any(|w| l.aria_label.contains(w)),
        |l| is_next_text(&l.text),
    ];

    heuristics
        .iter()
        .find_map(|matches| links.iter().find(|l| matches(l)))
        .map(|l| l.url.clone())
}

fn is_next_text(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    if lowered.is_empty() {
        return false;
    }
    NEXT_SYMBOLS.contains(&lowered.as_str())
        || NEXT_WORDS
            .iter()
            .any(|w| lowered == *w || lowered.starts_with(&format!("{} ", w)) || lowered.ends_with(&format!(" {}", w)))
        || lowered.ends_with('»')
        || lowered.ends_with('›')
}

// Resolves a possibly-relative href against the page URL, skipping anchors
// and non-navigational schemes
fn resolve_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("javascript:")
    {
        return None;
    }

    let url = base.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://leilao.com.br/imoveis?page=1").unwrap()
    }

    fn next_in_html(html: &str) -> Option<String> {
        find_next_link(&extract_links(html, ContentKind::Html, &base()))
    }

    #[test]
    fn test_rel_next_wins_over_text() {
        let html = r#"
            <a href="/imoveis?page=9">Próxima</a>
            <a rel="next" href="/imoveis?page=2">2</a>
        "#;
        assert_eq!(next_in_html(html), Some("https://leilao.com.br/imoveis?page=2".to_string()));
    }

    #[test]
    fn test_link_rel_in_head() {
        let html = r#"<html><head><link rel="next" href="?page=2"></head><body></body></html>"#;
        assert_eq!(next_in_html(html), Some("https://leilao.com.br/imoveis?page=2".to_string()));
    }

    #[test]
    fn test_class_and_aria_label() {
        let html = r#"<a class="pagination__Next" href="/p/2">→</a>"#;
        assert_eq!(next_in_html(html), Some("https://leilao.com.br/p/2".to_string()));

        let html = r#"<a aria-label="Próxima página" href="/p/3"><svg></svg></a>"#;
        assert_eq!(next_in_html(html), Some("https://leilao.com.br/p/3".to_string()));
    }

    #[test]
    fn test_localized_text_and_symbols() {
        assert_eq!(
            next_in_html(r#"<a href="/p/2"> Próxima </a>"#),
            Some("https://leilao.com.br/p/2".to_string())
        );
        assert_eq!(
            next_in_html(r#"<a href="/p/2">»</a>"#),
            Some("https://leilao.com.br/p/2".to_string())
        );
        assert_eq!(next_in_html(r#"<a href="/p/2">Nextel Telecom</a>"#), None);
    }

    #[test]
    fn test_skips_anchors_and_javascript() {
        let html = r##"<a href="#" class="next">Próxima</a><a href="javascript:void(0)">Next</a>"##;
        assert_eq!(next_in_html(html), None);
    }

    #[test]
    fn test_markdown_links() {
        let markdown = "Lotes\n\n[Casa em Santos](/lote/1) | [Próxima »](https://leilao.com.br/imoveis?page=2)";
        let links = extract_links(markdown, ContentKind::Markdown, &base());
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].url, "https://leilao.com.br/lote/1");
        assert_eq!(
            find_next_link(&links),
            Some("https://leilao.com.br/imoveis?page=2".to_string())
        );
    }
}

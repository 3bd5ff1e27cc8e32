// src/extract.rs
// =============================================================================
// Generic listing extractor driven by one CSS selector.
//
// Site scrapers normally bring their own extraction recipe. This one covers
// the common case for the CLI: every element matching `item_selector` is one
// lot, and we read what we can from it:
// - title: first heading (h1-h4) or element with "title"/"titulo" in its class,
//   otherwise the element's whole text
// - source_url: first <a href>, resolved against the page URL
// - image_url: first <img src>
// - data-* attributes: handed to RawPropertyRecord::from_fields, so
//   data-endereco="..." or data-valor-avaliacao="..." fill the record
// - the first "R$ ..." amount in the text, when no price came from attributes
//
// Markdown pages (reader proxy) are rendered to HTML with pulldown-cmark
// first, so the same selector can run over them.
// =============================================================================

use anyhow::Context;
use pulldown_cmark::{html, Parser};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use std::sync::OnceLock;
use url::Url;

use crate::error::{Result, ScoutError};
use crate::fetch::ContentKind;
use crate::paginate::Page;
use crate::record::RawPropertyRecord;

pub struct SelectorExtractor {
    item: Selector,
    title: Selector,
    link: Selector,
    image: Selector,
    source: Option<String>,
}

impl SelectorExtractor {
    // Parameters:
    //   item_selector: CSS selector matching one element per lot
    //   source: name stamped on every record (used for inactivity marking)
    //
    // Returns: ScoutError::Config if the selector does not parse
    pub fn new(item_selector: &str, source: Option<String>) -> Result<Self> {
        Ok(Self {
            item: parse_selector(item_selector)?,
            title: parse_selector("h1, h2, h3, h4, [class*=title], [class*=titulo]")?,
            link: parse_selector("a[href]")?,
            image: parse_selector("img[src]")?,
            source,
        })
    }

    /// Extracts one record per matching element.
    pub fn extract(&self, page: &Page<'_>) -> anyhow::Result<Vec<RawPropertyRecord>> {
        let base = Url::parse(page.url).with_context(|| format!("page URL {}", page.url))?;

        let markup = match page.kind {
            ContentKind::Html => page.content.to_string(),
            ContentKind::Markdown => {
                let mut rendered = String::with_capacity(page.content.len() * 3 / 2);
                html::push_html(&mut rendered, Parser::new(page.content));
                rendered
            }
        };

        let document = Html::parse_document(&markup);
        Ok(document
            .select(&self.item)
            .map(|element| self.record_from(element, &base))
            .collect())
    }

    fn record_from(&self, element: ElementRef<'_>, base: &Url) -> RawPropertyRecord {
        let mut fields = Map::new();

        // data-valor-avaliacao -> valor_avaliacao
        for (name, value) in element.value().attrs() {
            if let Some(key) = name.strip_prefix("data-") {
                fields.insert(key.replace('-', "_"), Value::String(value.to_string()));
            }
        }

        let text = collapse_whitespace(&element.text().collect::<String>());

        if !fields.contains_key("titulo") && !fields.contains_key("title") {
            let title = element
                .select(&self.title)
                .map(|t| collapse_whitespace(&t.text().collect::<String>()))
                .find(|t| !t.is_empty())
                .unwrap_or_else(|| text.clone());
            fields.insert("title".into(), Value::String(title));
        }

        if let Some(href) = element
            .select(&self.link)
            .find_map(|a| a.value().attr("href"))
            .or_else(|| element.value().attr("href"))
        {
            if let Ok(url) = base.join(href) {
                fields.entry("url").or_insert_with(|| Value::String(url.to_string()));
            }
        }

        if let Some(src) = element.select(&self.image).find_map(|img| img.value().attr("src")) {
            if let Ok(url) = base.join(src) {
                fields.entry("imagem").or_insert_with(|| Value::String(url.to_string()));
            }
        }

        let has_price = [
            "valor",
            "lance_inicial",
            "valor_primeiro_leilao",
            "first_auction_value",
        ]
        .iter()
        .any(|k| fields.contains_key(*k));
        if !has_price {
            if let Some(amount) = first_amount(&text) {
                fields.insert("lance_inicial".into(), Value::String(amount.to_string()));
            }
        }
        // A bare data-valor is the current asking price
        if let Some(value) = fields.remove("valor") {
            fields.entry("lance_inicial").or_insert(value);
        }

        let mut record = RawPropertyRecord::from_fields(&fields);
        if record.source.is_none() {
            record.source = self.source.clone();
        }
        record
    }
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| ScoutError::Config(format!("invalid CSS selector '{}': {:?}", selector, e)))
}

fn first_amount(text: &str) -> Option<&str> {
    static AMOUNT: OnceLock<Regex> = OnceLock::new();
    let pattern = AMOUNT.get_or_init(|| Regex::new(r"R\$\s*[\d.,]+").expect("valid amount pattern"));
    pattern.find(text).map(|m| m.as_str())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paginate::Identified;

    fn page<'a>(content: &'a str, kind: ContentKind) -> Page<'a> {
        Page {
            url: "https://leiloes.com.br/imoveis?page=1",
            content,
            kind,
        }
    }

    #[test]
    fn test_extracts_cards() {
        let html = r#"
            <div class="card" data-cidade="Santos" data-uf="SP" data-endereco="Rua A, 1">
              <h3 class="card-title">Apartamento 2 dorm.</h3>
              <a href="/lote/10">ver</a>
              <img src="/img/10.jpg">
              <span>Lance inicial: R$ 250.000,00</span>
            </div>
            <div class="card" data-valor="R$ 90.000,00"><a href="/lote/11">Terreno</a></div>
        "#;
        let extractor = SelectorExtractor::new("div.card", Some("leiloes".into())).unwrap();

        let records = extractor.extract(&page(html, ContentKind::Html)).unwrap();

        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.title.as_deref(), Some("Apartamento 2 dorm."));
        assert_eq!(first.source_url.as_deref(), Some("https://leiloes.com.br/lote/10"));
        assert_eq!(first.image_url.as_deref(), Some("https://leiloes.com.br/img/10.jpg"));
        assert_eq!(first.city.as_deref(), Some("Santos"));
        assert_eq!(first.address.as_deref(), Some("Rua A, 1"));
        assert_eq!(first.first_auction_value, Some(250000.0));
        assert_eq!(first.source.as_deref(), Some("leiloes"));

        assert_eq!(records[1].first_auction_value, Some(90000.0));
        assert_eq!(records[1].identity(), Some("https://leiloes.com.br/lote/11".to_string()));
    }

    #[test]
    fn test_markdown_is_rendered_before_selecting() {
        let markdown = "# Lotes\n\n- [Casa em Olinda](/lote/1) R$ 120.000\n- [Sala comercial](/lote/2)\n";
        let extractor = SelectorExtractor::new("li", None).unwrap();

        let records = extractor.extract(&page(markdown, ContentKind::Markdown)).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source_url.as_deref(), Some("https://leiloes.com.br/lote/1"));
        assert_eq!(records[0].first_auction_value, Some(120000.0));
        assert_eq!(records[1].title.as_deref(), Some("Sala comercial"));
    }

    #[test]
    fn test_invalid_selector_is_config_error() {
        assert!(matches!(
            SelectorExtractor::new("div[", None),
            Err(ScoutError::Config(_))
        ));
    }
}

// src/record.rs
// =============================================================================
// Property records flowing through the pipeline.
//
// RawPropertyRecord: what a site scraper hands over. Nearly every field is
//   optional: a record is never rejected for missing data.
// CanonicalProperty: the deduplicated catalog entity the IdentityResolver
//   creates and updates. The storage backend persists it but never decides
//   its duplicate/canonical fields.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::paginate::Identified;
use crate::urlnorm::url_identity_key;

// Prices closer than this are the same price
const VALUE_EPSILON: f64 = 0.005;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPropertyRecord {
    /// Scraper / site the record came from
    pub source: Option<String>,
    pub source_url: Option<String>,
    /// Lot id as published by the site
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub category: Option<String>,
    pub auction_type: Option<String>,
    pub evaluation_value: Option<f64>,
    pub first_auction_value: Option<f64>,
    pub second_auction_value: Option<f64>,
    pub discount_percentage: Option<f64>,
    pub first_auction_date: Option<NaiveDate>,
    pub second_auction_date: Option<NaiveDate>,
    pub area_total: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub image_url: Option<String>,
    pub auctioneer_name: Option<String>,
    pub auctioneer_url: Option<String>,
}

impl RawPropertyRecord {
    /// Builds a record from a loose, string-keyed field bag.
    ///
    /// Accepts English and Portuguese keys, Brazilian money ("R$ 1.234,56")
    /// and dates ("25/03/2025"). Unknown keys and unparsable values are
    /// ignored rather than rejected.
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        let text = |keys: &[&str]| keys.iter().find_map(|k| fields.get(*k).and_then(value_text));
        let money = |keys: &[&str]| keys.iter().find_map(|k| fields.get(*k).and_then(parse_money));
        let date = |keys: &[&str]| keys.iter().find_map(|k| fields.get(*k).and_then(parse_date));
        let coordinate = |keys: &[&str], limit: f64| {
            keys.iter()
                .find_map(|k| fields.get(*k).and_then(parse_coordinate))
                .filter(|c| c.abs() <= limit)
        };

        Self {
            source: text(&["source", "fonte"]),
            source_url: text(&["source_url", "url", "link"]),
            external_id: text(&["external_id", "id", "codigo", "lote"]),
            title: text(&["title", "titulo"]),
            description: text(&["description", "descricao"]),
            address: text(&["address", "endereco"]),
            neighborhood: text(&["neighborhood", "bairro"]),
            city: text(&["city", "cidade"]),
            state: text(&["state", "uf", "estado"]),
            category: text(&["category", "categoria", "tipo"]),
            auction_type: text(&["auction_type", "modalidade"]),
            evaluation_value: money(&["evaluation_value", "valor_avaliacao", "avaliacao"]),
            first_auction_value: money(&["first_auction_value", "valor_primeiro_leilao", "lance_inicial"]),
            second_auction_value: money(&["second_auction_value", "valor_segundo_leilao"]),
            discount_percentage: money(&["discount_percentage", "desconto"]),
            first_auction_date: date(&["first_auction_date", "primeiro_leilao", "data_primeiro_leilao"]),
            second_auction_date: date(&["second_auction_date", "segundo_leilao", "data_segundo_leilao"]),
            area_total: money(&["area_total", "area", "area_m2"]),
            latitude: coordinate(&["latitude", "lat"], 90.0),
            longitude: coordinate(&["longitude", "lng", "lon"], 180.0),
            image_url: text(&["image_url", "imagem", "foto"]),
            auctioneer_name: text(&["auctioneer_name", "leiloeiro"]),
            auctioneer_url: text(&["auctioneer_url", "site_leiloeiro"]),
        }
    }

    /// Normalized source URL, when the record has one.
    pub fn url_key(&self) -> Option<String> {
        self.source_url.as_deref().and_then(url_identity_key)
    }

    /// Discount against the evaluation, scraped or derived from the lowest
    /// auction value.
    pub fn effective_discount(&self) -> Option<f64> {
        self.discount_percentage.or_else(|| {
            derive_discount(
                self.evaluation_value,
                lowest(self.first_auction_value, self.second_auction_value),
            )
        })
    }
}

impl Identified for RawPropertyRecord {
    fn identity(&self) -> Option<String> {
        self.url_key().or_else(|| {
            self.external_id.as_ref().map(|id| match &self.source {
                Some(source) => format!("{}:{}", source, id),
                None => id.clone(),
            })
        })
    }
}

/// The single authoritative catalog entry for one real-world listing, or a
/// duplicate row pointing at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProperty {
    pub id: Uuid,
    pub source: String,
    pub source_url: Option<String>,
    /// URL identity key
    pub normalized_url: Option<String>,
    /// URL keys of other listings merged into this record
    #[serde(default)]
    pub merged_urls: Vec<String>,
    /// Address identity key (address|city|state)
    pub address_key: Option<String>,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub category: Option<String>,
    pub auction_type: Option<String>,
    pub evaluation_value: Option<f64>,
    pub first_auction_value: Option<f64>,
    pub second_auction_value: Option<f64>,
    pub discount_percentage: Option<f64>,
    pub first_auction_date: Option<NaiveDate>,
    pub second_auction_date: Option<NaiveDate>,
    pub area_total: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub image_url: Option<String>,
    pub auctioneer_name: Option<String>,
    pub auctioneer_url: Option<String>,

    pub is_duplicate: bool,
    pub original_id: Option<Uuid>,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,

    pub previous_first_auction_value: Option<f64>,
    pub previous_second_auction_value: Option<f64>,
    pub value_changed_at: Option<DateTime<Utc>>,
}

/// Whether an observation may replace values already on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Newly observed prices, dates and image win
    Overwrite,
    /// Only fill what the record is missing
    FillOnly,
}

/// What an observation changed on an existing record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservationChanges {
    pub value_changed: bool,
    pub reactivated: bool,
}

impl CanonicalProperty {
    pub fn from_raw(
        raw: &RawPropertyRecord,
        normalized_url: Option<String>,
        address_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: raw.source.clone().unwrap_or_else(|| "unknown".to_string()),
            source_url: raw.source_url.clone(),
            normalized_url,
            merged_urls: Vec::new(),
            address_key,
            external_id: raw.external_id.clone(),
            title: raw.title.clone(),
            description: raw.description.clone(),
            address: raw.address.clone(),
            neighborhood: raw.neighborhood.clone(),
            city: raw.city.clone(),
            state: raw.state.clone(),
            category: raw.category.clone(),
            auction_type: raw.auction_type.clone(),
            evaluation_value: raw.evaluation_value,
            first_auction_value: raw.first_auction_value,
            second_auction_value: raw.second_auction_value,
            discount_percentage: raw.effective_discount(),
            first_auction_date: raw.first_auction_date,
            second_auction_date: raw.second_auction_date,
            area_total: raw.area_total,
            latitude: raw.latitude,
            longitude: raw.longitude,
            image_url: raw.image_url.clone(),
            auctioneer_name: raw.auctioneer_name.clone(),
            auctioneer_url: raw.auctioneer_url.clone(),
            is_duplicate: false,
            original_id: None,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            deactivated_at: None,
            previous_first_auction_value: None,
            previous_second_auction_value: None,
            value_changed_at: None,
        }
    }

    /// Id of the canonical record this row belongs to (itself if canonical).
    pub fn canonical_id(&self) -> Uuid {
        self.original_id.filter(|_| self.is_duplicate).unwrap_or(self.id)
    }

    /// Every URL key that identifies this record.
    pub fn url_keys(&self) -> impl Iterator<Item = &str> {
        self.normalized_url
            .iter()
            .chain(self.merged_urls.iter())
            .map(String::as_str)
    }

    /// Remembers another URL key as belonging to this record.
    pub fn absorb_url(&mut self, key: &str) {
        match &self.normalized_url {
            None => self.normalized_url = Some(key.to_string()),
            Some(own) if own == key => {}
            Some(_) => {
                if !self.merged_urls.iter().any(|k| k == key) {
                    self.merged_urls.push(key.to_string());
                }
            }
        }
    }

    /// One point each for area, coordinates, image, evaluation value,
    /// first-auction date and description.
    pub fn completeness_score(&self) -> u8 {
        [
            self.area_total.is_some(),
            self.latitude.is_some() && self.longitude.is_some(),
            self.image_url.as_deref().map_or(false, |s| !s.trim().is_empty()),
            self.evaluation_value.is_some(),
            self.first_auction_date.is_some(),
            self.description.as_deref().map_or(false, |s| !s.trim().is_empty()),
        ]
        .iter()
        .filter(|present| **present)
        .count() as u8
    }

    /// Applies a re-observation of this listing.
    ///
    /// Under `Overwrite`, prices, dates, image and discount take the newly
    /// observed value when one is present and a changed auction value moves
    /// the old one into `previous_*`. Descriptive fields are only ever filled
    /// in when missing.
    pub fn apply_observation(
        &mut self,
        raw: &RawPropertyRecord,
        now: DateTime<Utc>,
        policy: MergePolicy,
    ) -> ObservationChanges {
        let mut changes = ObservationChanges::default();

        match policy {
            MergePolicy::Overwrite => {
                if let Some(old) = replace_value(&mut self.first_auction_value, raw.first_auction_value) {
                    self.previous_first_auction_value = Some(old);
                    changes.value_changed = true;
                }
                if let Some(old) = replace_value(&mut self.second_auction_value, raw.second_auction_value) {
                    self.previous_second_auction_value = Some(old);
                    changes.value_changed = true;
                }
                if changes.value_changed {
                    self.value_changed_at = Some(now);
                }

                overwrite(&mut self.evaluation_value, raw.evaluation_value);
                overwrite(&mut self.first_auction_date, raw.first_auction_date);
                overwrite(&mut self.second_auction_date, raw.second_auction_date);
                overwrite(&mut self.image_url, raw.image_url.clone());
                overwrite(&mut self.auction_type, raw.auction_type.clone());
            }
            MergePolicy::FillOnly => {
                fill_value(&mut self.first_auction_value, raw.first_auction_value);
                fill_value(&mut self.second_auction_value, raw.second_auction_value);
                fill_value(&mut self.evaluation_value, raw.evaluation_value);
                fill_value(&mut self.first_auction_date, raw.first_auction_date);
                fill_value(&mut self.second_auction_date, raw.second_auction_date);
                fill(&mut self.image_url, &raw.image_url);
                fill(&mut self.auction_type, &raw.auction_type);
            }
        }

        let observed_discount = match policy {
            MergePolicy::Overwrite => raw.discount_percentage,
            MergePolicy::FillOnly => self.discount_percentage.or(raw.discount_percentage),
        };
        self.discount_percentage = observed_discount.or_else(|| {
            derive_discount(
                self.evaluation_value,
                lowest(self.first_auction_value, self.second_auction_value),
            )
            .or(self.discount_percentage)
        });

        fill(&mut self.title, &raw.title);
        fill(&mut self.description, &raw.description);
        fill(&mut self.address, &raw.address);
        fill(&mut self.neighborhood, &raw.neighborhood);
        fill(&mut self.city, &raw.city);
        fill(&mut self.state, &raw.state);
        fill(&mut self.category, &raw.category);
        fill(&mut self.external_id, &raw.external_id);
        fill(&mut self.auctioneer_name, &raw.auctioneer_name);
        fill(&mut self.auctioneer_url, &raw.auctioneer_url);
        fill_value(&mut self.area_total, raw.area_total);
        if self.latitude.is_none() || self.longitude.is_none() {
            if let (Some(lat), Some(lng)) = (raw.latitude, raw.longitude) {
                self.latitude = Some(lat);
                self.longitude = Some(lng);
            }
        }

        if !self.is_active {
            changes.reactivated = true;
        }
        self.is_active = true;
        self.deactivated_at = None;
        self.last_seen_at = self.last_seen_at.max(now);
        self.updated_at = now;

        changes
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.deactivated_at = Some(now);
        self.updated_at = now;
    }
}

// Stores `new` if present; returns the old value when it differs
fn replace_value(slot: &mut Option<f64>, new: Option<f64>) -> Option<f64> {
    let new = new?;
    let old = slot.replace(new)?;
    ((old - new).abs() > VALUE_EPSILON).then_some(old)
}

fn overwrite<T>(slot: &mut Option<T>, new: Option<T>) {
    if new.is_some() {
        *slot = new;
    }
}

fn fill_value<T>(slot: &mut Option<T>, new: Option<T>) {
    if slot.is_none() {
        *slot = new;
    }
}

fn fill(slot: &mut Option<String>, new: &Option<String>) {
    if slot.as_deref().map_or(true, |s| s.trim().is_empty()) {
        if let Some(value) = new.as_ref().filter(|v| !v.trim().is_empty()) {
            *slot = Some(value.clone());
        }
    }
}

fn lowest(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn derive_discount(evaluation: Option<f64>, price: Option<f64>) -> Option<f64> {
    let (evaluation, price) = (evaluation?, price?);
    if evaluation <= 0.0 || price <= 0.0 || price >= evaluation {
        return None;
    }
    Some(((1.0 - price / evaluation) * 10000.0).round() / 100.0)
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Parses Brazilian and plain money/number formats.
///
/// "R$ 1.234.567,89" -> 1234567.89, "350.000" -> 350000.0, "99.5" -> 99.5
pub fn parse_money(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_money_text(s),
        _ => None,
    }
}

fn parse_money_text(text: &str) -> Option<f64> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let pattern = NUMBER.get_or_init(|| Regex::new(r"-?\d[\d.,]*").expect("valid number pattern"));
    let raw = pattern.find(text)?.as_str().trim_end_matches(['.', ',']);

    let normalized = if raw.contains(',') {
        // Brazilian: dots group thousands, comma marks decimals
        raw.replace('.', "").replace(',', ".")
    } else {
        let dots = raw.matches('.').count();
        let decimals = raw.rsplit('.').next().map_or(0, str::len);
        if dots > 1 || (dots == 1 && decimals == 3) {
            raw.replace('.', "")
        } else {
            raw.to_string()
        }
    };
    normalized.parse().ok()
}

/// Parses a decimal coordinate. A comma is read as the decimal point and
/// dots never group thousands: "-23.550" -> -23.55, "-46,633" -> -46.633.
pub fn parse_coordinate(value: &Value) -> Option<f64> {
    static DECIMAL: OnceLock<Regex> = OnceLock::new();

    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let pattern = DECIMAL.get_or_init(|| Regex::new(r"-?\d+(?:[.,]\d+)?").expect("valid decimal pattern"));
            pattern.find(s)?.as_str().replace(',', ".").parse().ok()
        }
        _ => None,
    }
}

/// Parses "dd/mm/yyyy" (with anything after it) or ISO "yyyy-mm-dd...".
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    static BR_DATE: OnceLock<Regex> = OnceLock::new();
    static ISO_DATE: OnceLock<Regex> = OnceLock::new();

    let text = value.as_str()?.trim();
    let br = BR_DATE.get_or_init(|| Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{4})").expect("valid date pattern"));
    if let Some(caps) = br.captures(text) {
        return NaiveDate::from_ymd_opt(caps[3].parse().ok()?, caps[2].parse().ok()?, caps[1].parse().ok()?);
    }
    let iso = ISO_DATE.get_or_init(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("valid date pattern"));
    let caps = iso.captures(text)?;
    NaiveDate::from_ymd_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?)
}

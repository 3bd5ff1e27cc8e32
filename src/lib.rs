// src/lib.rs
// =============================================================================
// leilao-scout: acquisition and deduplication core for Brazilian real-estate
// auction listings.
//
// Pipeline:
//   start URL -> GenericPaginator -> RateLimitedFetcher
//                                      (RateLimiter + MultiLayerFetcher)
//             -> extraction function -> RawPropertyRecord
//             -> IdentityResolver -> CatalogStore
//
// The scrapers that know each site's markup live outside this crate; they
// plug in through the paginator's extraction function. `extract` ships one
// generic, selector-driven extractor for the CLI.
// =============================================================================

pub mod catalog;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod paginate;
pub mod ratelimit;
pub mod record;
pub mod urlnorm;

pub use catalog::{CatalogStore, InMemoryStore};
pub use config::Settings;
pub use dedup::{IdentityResolver, Resolution, ResolutionStats};
pub use error::{Result, RetrievalError, ScoutError, StoreError};
pub use fetch::{FetchResult, MultiLayerFetcher, RateLimitedFetcher};
pub use paginate::{GenericPaginator, Identified, Page, PageSource, PaginationReport};
pub use ratelimit::RateLimiter;
pub use record::{CanonicalProperty, RawPropertyRecord};

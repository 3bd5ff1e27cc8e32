// src/dedup/mod.rs
// =============================================================================
// Deduplication of property records into canonical catalog entries.
//
// - normalize: address / locality identity keys
// - similarity: character-sequence ratio used for fuzzy address matches
// - resolver: IdentityResolver (resolution, merge-on-reappearance,
//   inactivity marking, batch consolidation)
//
// URL identity keys live in `crate::urlnorm`, shared with the paginator.
// =============================================================================

mod normalize;
mod resolver;
mod similarity;

pub use normalize::{address_key, address_part, fold_accents, locality_key, normalize_address, normalize_state};
pub use resolver::{
    choose_canonical, ConsolidationReport, IdentityResolver, MatchKind, Outcome, Resolution, ResolutionStats,
};
pub use similarity::sequence_ratio;

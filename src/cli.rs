// src/cli.rs
// =============================================================================
// Command-line interface, defined with clap's derive API.
//
//   scout fetch <url>                      one multi-layer fetch, shows attempts
//   scout scan <url>... --item-selector    paginate, extract, deduplicate
//   scout normalize <url|address>          print identity keys
//
// Global flags (--config, --verbose, --requests-per-second) work before or
// after the subcommand.
// =============================================================================

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "scout",
    version,
    about = "Fetch, paginate and deduplicate real-estate auction listings",
    long_about = "scout walks auction listing sites through a rate-limited, multi-layer fetcher, \
                  extracts lots with a CSS selector and folds them into a deduplicated catalog."
)]
pub struct Cli {
    /// JSON settings file (defaults are used for anything it leaves out)
    #[arg(long, global = true, env = "SCOUT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Per-origin request rate
    #[arg(long, global = true)]
    pub requests_per_second: Option<f64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch one URL through every layer until one returns usable content
    ///
    /// Example: scout fetch https://www.leilaoimovel.com.br/
    Fetch {
        url: String,

        /// Output the result and its attempts as JSON
        #[arg(long)]
        json: bool,
    },

    /// Paginate listing pages, extract lots and deduplicate them
    ///
    /// Example: scout scan https://site.com.br/imoveis --item-selector ".card" --source site
    Scan {
        /// Start URLs, one pagination session each
        #[arg(required = true)]
        urls: Vec<String>,

        /// CSS selector matching one element per lot
        #[arg(long)]
        item_selector: String,

        /// Source name stamped on every record
        ///
        /// With --catalog, listings of this source not seen in a complete
        /// run are marked inactive.
        #[arg(long)]
        source: Option<String>,

        /// JSON catalog file, loaded before and saved after the scan
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Sessions running at the same time
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Page cap per session
        #[arg(long)]
        max_pages: Option<usize>,

        /// Delay between pages of one session, in milliseconds
        #[arg(long)]
        page_delay_ms: Option<u64>,

        /// Output a JSON summary instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the identity key of a URL, or of an address
    ///
    /// Example: scout normalize "Avenida Paulista, 1000" --city "São Paulo" --state SP
    Normalize {
        input: String,

        #[arg(long)]
        city: Option<String>,

        #[arg(long)]
        state: Option<String>,
    },
}

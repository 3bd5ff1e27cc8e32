// src/main.rs
// =============================================================================
// Entry point of the `scout` CLI.
//
// What happens here:
// 1. Parse command-line arguments using clap
// 2. Initialise logging (tracing, to stderr so --json stdout stays clean)
// 3. Load settings: defaults -> --config file -> environment -> CLI flags
// 4. Dispatch to the subcommand handler
// 5. Exit with proper code (0 = success, 1 = nothing retrieved, 2 = error)
// =============================================================================

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use leilao_scout::catalog::{CatalogStore, InMemoryStore};
use leilao_scout::dedup::{address_key, normalize_address, IdentityResolver, ResolutionStats};
use leilao_scout::extract::SelectorExtractor;
use leilao_scout::fetch::{FetchResult, MultiLayerFetcher, RateLimitedFetcher};
use leilao_scout::paginate::{GenericPaginator, Page, PaginationProfile, PaginationReport, StopReason};
use leilao_scout::ratelimit::{OriginStats, RateLimiter};
use leilao_scout::record::{CanonicalProperty, RawPropertyRecord};
use leilao_scout::urlnorm::normalize_url;
use leilao_scout::Settings;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "scout failed");
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    let mut settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(rps) = cli.requests_per_second {
        settings.rate_limit.requests_per_second = rps;
    }

    match cli.command {
        Commands::Fetch { url, json } => {
            settings.validate()?;
            handle_fetch(&settings, &url, json).await
        }
        Commands::Scan {
            urls,
            item_selector,
            source,
            catalog,
            concurrency,
            max_pages,
            page_delay_ms,
            json,
        } => {
            if let Some(max_pages) = max_pages {
                settings.pagination.max_pages = max_pages;
            }
            if let Some(delay) = page_delay_ms {
                settings.pagination.page_delay_ms = delay;
            }
            settings.validate()?;

            let options = ScanOptions {
                item_selector,
                source,
                catalog: catalog.as_deref(),
                concurrency: concurrency.max(1),
                json,
            };
            handle_scan(&settings, &urls, options).await
        }
        Commands::Normalize { input, city, state } => handle_normalize(&input, city.as_deref(), state.as_deref()),
    }
}

fn gated_fetcher(settings: &Settings) -> Result<RateLimitedFetcher> {
    let fetcher = MultiLayerFetcher::from_config(&settings.fetch).context("failed to build fetch layers")?;
    Ok(RateLimitedFetcher::new(
        Arc::new(fetcher),
        RateLimiter::new(settings.rate_limit.clone()),
    ))
}

// Handles the 'fetch' subcommand
// Returns: Ok(0) when some layer produced valid content, Ok(1) otherwise
async fn handle_fetch(settings: &Settings, url: &str, json: bool) -> Result<i32> {
    let fetcher = gated_fetcher(settings)?;
    let result = fetcher.fetch(url).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_fetch(&result);
    }

    Ok(if result.success { 0 } else { 1 })
}

fn print_fetch(result: &FetchResult) {
    println!("🔍 {}", result.url);
    println!("{:<18} {:<10} {:<10} {}", "LAYER", "STATUS", "BYTES", "ERROR");
    println!("{}", "=".repeat(80));
    for attempt in &result.attempts {
        println!(
            "{:<18} {:<10} {:<10} {}",
            format!("{:?}", attempt.layer),
            if attempt.success { "✅ ok" } else { "❌ failed" },
            attempt.content_length,
            attempt.error.as_deref().unwrap_or("")
        );
    }
    println!();
    match (&result.layer_used, result.success) {
        (Some(layer), true) => println!("✅ Retrieved {} bytes via {:?}", result.content_length, layer),
        _ => println!(
            "❌ No layer returned usable content: {}",
            result.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

struct ScanOptions<'a> {
    item_selector: String,
    source: Option<String>,
    catalog: Option<&'a Path>,
    concurrency: usize,
    json: bool,
}

type SessionOutcome = (String, Result<PaginationReport<RawPropertyRecord>>);

// URLs of `source` observed by this run, or None when some session failed
// or stopped short of the end (page cap, failed fetches). Listings can only
// be judged gone against a complete run.
fn seen_in_complete_run(source: &str, outcomes: &[SessionOutcome]) -> Option<Vec<String>> {
    let mut seen = Vec::new();
    for (start_url, outcome) in outcomes {
        let report = outcome.as_ref().ok()?;
        if !report.is_complete() {
            warn!(
                url = %start_url,
                stop = ?report.stop_reason,
                failed_pages = report.failed_pages,
                "session did not reach the end of the listing"
            );
            return None;
        }
        seen.extend(
            report
                .items
                .iter()
                .filter(|item| item.source.as_deref() == Some(source))
                .filter_map(|item| item.source_url.clone()),
        );
    }
    Some(seen)
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    start_url: String,
    pages_visited: usize,
    failed_pages: usize,
    items: usize,
    stop_reason: Option<StopReason>,
    profile: Option<PaginationProfile>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ScanSummary {
    sessions: Vec<SessionSummary>,
    resolution: ResolutionStats,
    retired: usize,
    catalog_size: usize,
    blocked_origins: Vec<OriginStats>,
    catalog: Vec<CanonicalProperty>,
}

// Handles the 'scan' subcommand
//
// Each start URL is one pagination session; sessions run concurrently
// (bounded by `concurrency`) and share one rate limiter, so sessions on
// the same host are serialized while different hosts proceed in parallel.
// Returns: Ok(0) when at least one item was extracted, Ok(1) otherwise
async fn handle_scan(settings: &Settings, urls: &[String], options: ScanOptions<'_>) -> Result<i32> {
    let fetcher = gated_fetcher(settings)?;
    let extractor = SelectorExtractor::new(&options.item_selector, options.source.clone())?;

    let store = Arc::new(match options.catalog {
        Some(path) if path.exists() => load_catalog(path)?,
        _ => InMemoryStore::new(),
    });
    let resolver = IdentityResolver::new(store.clone(), settings.dedup.clone());
    resolver.rebuild_index().await?;

    info!(sessions = urls.len(), concurrency = options.concurrency, "scan started");

    let outcomes: Vec<SessionOutcome> = stream::iter(urls.iter())
        .map(|start| {
            let paginator = GenericPaginator::new(fetcher.clone(), settings.pagination.clone());
            let extractor = &extractor;
            let resolver = &resolver;
            async move {
                let report = paginator
                    .paginate_with_report(start, |page: &Page<'_>| extractor.extract(page))
                    .await;
                let report = match report {
                    Ok(report) => report,
                    Err(e) => return (start.clone(), Err(anyhow::Error::from(e))),
                };
                for item in &report.items {
                    if let Err(e) = resolver.resolve(item).await {
                        return (start.clone(), Err(anyhow::Error::from(e)));
                    }
                }
                (start.clone(), Ok(report))
            }
        })
        .buffer_unordered(options.concurrency)
        .collect()
        .await;

    let mut retired = 0;
    if let Some(source) = &options.source {
        match seen_in_complete_run(source, &outcomes) {
            Some(seen) => retired = resolver.mark_inactive(source, &seen).await?,
            None => warn!(source = %source, "scan incomplete, inactivity marking skipped"),
        }
    }

    let mut sessions = Vec::with_capacity(outcomes.len());
    let mut total_items = 0;

    for (start_url, outcome) in outcomes {
        match outcome {
            Ok(report) => {
                total_items += report.items.len();
                sessions.push(SessionSummary {
                    start_url,
                    pages_visited: report.pages_visited,
                    failed_pages: report.failed_pages,
                    items: report.items.len(),
                    stop_reason: Some(report.stop_reason),
                    profile: report.profile,
                    error: None,
                });
            }
            Err(e) => {
                warn!(url = %start_url, error = %e, "session failed");
                sessions.push(SessionSummary {
                    start_url,
                    pages_visited: 0,
                    failed_pages: 0,
                    items: 0,
                    stop_reason: None,
                    profile: None,
                    error: Some(format!("{:#}", e)),
                });
            }
        }
    }

    let catalog = store.all().await?;
    if let Some(path) = options.catalog {
        save_catalog(path, &catalog)?;
    }

    let blocked_origins: Vec<OriginStats> = fetcher
        .limiter()
        .get_stats(None)?
        .into_values()
        .filter(|s| s.is_blocked)
        .collect();

    let summary = ScanSummary {
        sessions,
        resolution: resolver.stats(),
        retired,
        catalog_size: catalog.len(),
        blocked_origins,
        catalog,
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_scan(&summary);
    }

    Ok(if total_items > 0 { 0 } else { 1 })
}

fn print_scan(summary: &ScanSummary) {
    println!("{:<50} {:<8} {:<8} {:<12}", "START URL", "PAGES", "ITEMS", "STOP");
    println!("{}", "=".repeat(80));
    for session in &summary.sessions {
        let stop = match (&session.stop_reason, &session.error) {
            (Some(reason), _) => format!("{:?}", reason),
            (None, Some(error)) => format!("error: {}", error),
            (None, None) => String::new(),
        };
        let url_display = truncate_display(&session.start_url, 47);
        println!("{:<50} {:<8} {:<8} {}", url_display, session.pages_visited, session.items, stop);
    }
    println!();

    let stats = &summary.resolution;
    println!("📊 Summary:");
    println!("   🆕 New listings: {}", stats.created);
    println!(
        "   🔗 Merged: {} (url {}, address {}, fuzzy {})",
        stats.merged_url + stats.merged_address + stats.merged_fuzzy,
        stats.merged_url,
        stats.merged_address,
        stats.merged_fuzzy
    );
    println!("   ❓ Unresolvable: {}", stats.unresolvable);
    println!("   💲 Price changes: {}", stats.value_changes);
    println!("   ♻️  Reactivated: {}", stats.reactivated);
    println!("   💤 Marked inactive: {}", summary.retired);
    println!("   📋 Catalog size: {}", summary.catalog_size);
    for origin in &summary.blocked_origins {
        println!(
            "   ⛔ {} blocked for {:.0}s after {} errors",
            origin.origin,
            origin.blocked_for_secs.unwrap_or(0.0),
            origin.consecutive_errors
        );
    }
}

// Cuts on a character boundary; user-supplied URLs may carry non-ASCII text
fn truncate_display(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

fn load_catalog(path: &Path) -> Result<InMemoryStore> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read catalog {}", path.display()))?;
    let records: Vec<CanonicalProperty> =
        serde_json::from_str(&text).with_context(|| format!("invalid catalog {}", path.display()))?;
    info!(path = %path.display(), records = records.len(), "catalog loaded");
    Ok(InMemoryStore::from_records(records))
}

fn save_catalog(path: &Path, records: &[CanonicalProperty]) -> Result<()> {
    let json = serde_json::to_string_pretty(records)?;
    std::fs::write(path, json).with_context(|| format!("cannot write catalog {}", path.display()))?;
    info!(path = %path.display(), records = records.len(), "catalog saved");
    Ok(())
}

// Handles the 'normalize' subcommand
fn handle_normalize(input: &str, city: Option<&str>, state: Option<&str>) -> Result<i32> {
    let looks_like_url = input.trim_start().starts_with("http://") || input.trim_start().starts_with("https://");

    if looks_like_url {
        println!("{}", normalize_url(input)?);
        return Ok(0);
    }

    let key = match city {
        Some(_) => address_key(Some(input), city, state),
        None => normalize_address(input),
    };
    match key {
        Some(key) => {
            println!("{}", key);
            Ok(0)
        }
        None => {
            eprintln!("⚠️  Nothing identifying left after normalization");
            Ok(1)
        }
    }
}

//! CacheLab - entity cache scenario runner

mod scenarios;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use entitycache::Settings;
use tracing::{info, warn};

use crate::scenarios::{Runner, Scenario, ScenarioReport};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory; each scenario writes to its own subdirectory
    #[arg(short, long, default_value = "./cachelab-data")]
    data: PathBuf,

    /// Scenarios to run (default: all)
    #[arg(short, long, value_enum)]
    scenario: Vec<Scenario>,

    /// Disable the second-level cache (implies --no-query-cache)
    #[arg(long)]
    no_second_level_cache: bool,

    /// Disable the query cache
    #[arg(long)]
    no_query_cache: bool,

    /// Maximum entries per cache region (0: unbounded)
    #[arg(short, long, default_value_t = 10000)]
    capacity: usize,

    /// Cache property, e.g. -D hibernate.cache.region.entity.Post.max_entries=100
    #[arg(short = 'D', long = "property", value_name = "KEY=VALUE", value_parser = parse_property)]
    property: Vec<(String, String)>,

    /// PostDetails creation time in epoch millis (default: now)
    #[arg(long)]
    created_on: Option<i64>,

    /// Replace scenario directories left by an earlier run
    #[arg(long)]
    fresh: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    /// Flags as `hibernate.cache.*` properties, overridden by `--property`
    fn properties(&self) -> HashMap<String, String> {
        let second_level = !self.no_second_level_cache;
        let query_cache = second_level && !self.no_query_cache;
        let mut properties: HashMap<String, String> = [
            ("hibernate.cache.use_second_level_cache", second_level.to_string()),
            ("hibernate.cache.use_query_cache", query_cache.to_string()),
            ("hibernate.cache.default.max_entries", self.capacity.to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
        properties.extend(self.property.iter().cloned());
        properties
    }

    fn settings(&self) -> Result<Settings> {
        Settings::from_properties(&self.properties()).context("Invalid cache properties")
    }

    fn scenarios(&self) -> Vec<Scenario> {
        if self.scenario.is_empty() {
            Scenario::ALL.to_vec()
        } else {
            self.scenario.clone()
        }
    }
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let settings = args.settings()?;
    info!("Starting CacheLab v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", args.data.display());
    info!(
        "Second-level cache: {}, query cache: {}, default region: {:?}",
        settings.use_second_level_cache, settings.use_query_cache, settings.default_region
    );

    std::fs::create_dir_all(&args.data)?;

    let mut runner = Runner::new(settings);
    if let Some(millis) = args.created_on {
        runner = runner.with_created_on(millis);
    }
    let mut reports = Vec::new();
    for scenario in args.scenarios() {
        let dir = args.data.join(scenario.name());
        if dir.exists() {
            if !args.fresh {
                bail!("{} exists, rerun with --fresh to replace it", dir.display());
            }
            warn!("Replacing {}", dir.display());
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        std::fs::create_dir_all(&dir)?;
        reports.push(runner.run(scenario, &dir)?);
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("Failed to serialize report")?
        );
    } else {
        for report in &reports {
            print_report(report);
        }
    }

    let failed = reports.iter().filter(|r| !r.passed()).count();
    if failed > 0 {
        bail!("{} of {} scenarios failed", failed, reports.len());
    }
    Ok(())
}

fn parse_property(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{}`", arg)),
    }
}

fn print_report(report: &ScenarioReport) {
    let status = if report.passed() { "PASS" } else { "FAIL" };
    println!("\n[{}] {}: {}", status, report.scenario.name(), report.description);
    for check in &report.checks {
        let mark = if check.passed { "ok" } else { "!!" };
        println!(
            "   {} {:<34} expected {:<30} got {}",
            mark, check.name, check.expected, check.actual
        );
    }

    let store = &report.store;
    println!(
        "   store:  selects Post={} PostDetails={} Comment={}, queries={}, inserts={}, updates={}, commits={}",
        store.post_selects,
        store.post_details_selects,
        store.comment_selects,
        store.queries,
        store.inserts,
        store.updates,
        store.commits
    );

    let cache = &report.cache;
    println!(
        "   L2:     hits={} misses={} puts={}",
        cache.second_level_hits, cache.second_level_misses, cache.second_level_puts
    );
    println!(
        "   query:  hits={} misses={} puts={}",
        cache.query_cache_hits, cache.query_cache_misses, cache.query_cache_puts
    );
    for region in &report.regions {
        println!(
            "   region {:<34} {:<10} entries={} hit ratio={:.2}",
            region.name, region.kind, region.entries, region.hit_ratio
        );
    }
}

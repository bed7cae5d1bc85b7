//! `conquer`: run one scheduler session against the coordinator.
//!
//! The suite is read from a JSON file in the wire `suite` format. Nothing is
//! executed: every scheduled item is reported back as skipped, which makes the
//! binary handy for smoke-testing a coordinator deployment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::Parser;
use conquer_core::heartbeat::{HEARTBEAT_INTERVAL, Heartbeat};
use conquer_core::http::{HttpClient, HttpConfig};
use conquer_core::logging::{LogConfig, init_logging};
use conquer_core::model::{ItemKind, Location, Report, ReportItem, Schedule, Status, SuiteItem};
use conquer_core::scheduler::Scheduler;
use conquer_core::serializer::deserialize_suite;
use conquer_core::settings::{CONFIG_FILE, FileConfig, SettingsResolver, SettingsSources};
use tracing::{debug, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Suite file (JSON, `{"items": [...]}`)
    #[arg(short, long)]
    suite: PathBuf,

    /// Config file, defaults to ./conquer.toml when present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Setting override, e.g. `--set api_key=secret` (repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE")]
    settings: Vec<String>,

    /// Post a heartbeat over HTTP while the session runs
    #[arg(long)]
    heartbeat: bool,

    /// Debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_settings(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid setting '{pair}', expected NAME=VALUE"))?;
            Ok((name.trim().to_lowercase(), value.to_string()))
        })
        .collect()
}

fn log_config(cli: &Cli) -> Result<LogConfig> {
    let path = cli.config.clone().or_else(|| {
        let default_path = PathBuf::from(CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let config = match path {
        Some(path) => FileConfig::load_from(&path)?.logging,
        None => LogConfig::default(),
    };
    Ok(config.with_debug(cli.debug))
}

fn load_suite(path: &Path) -> Result<Vec<SuiteItem>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read suite file {}", path.display()))?;
    let payload: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("suite file {} is not valid JSON", path.display()))?;
    Ok(deserialize_suite(&payload)?)
}

/// Report every item of a schedule as skipped.
fn skip_all(schedule: &Schedule) -> Report {
    let pending_at = Utc::now();
    let items = schedule
        .items()
        .map(|item| {
            ReportItem::new(ItemKind::File, Location::new(&item.file), Status::Skipped)
                .with_timings(pending_at, Utc::now())
        })
        .collect();
    Report {
        items,
        pending_at,
        started_at: pending_at,
        finished_at: Utc::now(),
    }
}

fn work(scheduler: &Scheduler, worker: u32) -> Result<usize> {
    let mut handled = 0;
    loop {
        let schedule = scheduler.next();
        if schedule.is_empty() {
            debug!(worker, "no more work");
            return Ok(handled);
        }
        handled += schedule.items().count();
        scheduler.report(schedule.id.as_deref(), skip_all(&schedule))?;
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&log_config(&cli)?)?;

    let args = parse_settings(&cli.settings)?;
    let sources = SettingsSources::capture(args, cli.config.as_deref())?;
    let resolver = Arc::new(SettingsResolver::new(sources)?);
    let settings = resolver.current();
    settings.validate()?;

    let suite = load_suite(&cli.suite)?;
    if suite.is_empty() {
        bail!("suite file {} has no items", cli.suite.display());
    }
    info!(items = suite.len(), workers = settings.client_workers, "starting session");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;
    let heartbeat = cli.heartbeat.then(|| {
        let _guard = runtime.enter();
        Heartbeat::start(&HttpClient::new(HttpConfig::from_settings(&settings)), HEARTBEAT_INTERVAL)
    });

    let scheduler = Arc::new(Scheduler::connect(Arc::clone(&resolver), 0)?);
    scheduler.start(suite)?;

    let workers: Vec<_> = (0..settings.client_workers.max(1))
        .map(|worker| {
            let scheduler = Arc::clone(&scheduler);
            thread::Builder::new()
                .name(format!("conquer-worker-{worker}"))
                .spawn(move || work(&scheduler, worker))
        })
        .collect::<std::io::Result<_>>()?;

    let mut handled = 0;
    for handle in workers {
        handled += handle
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))??;
    }
    scheduler.stop();

    if let Some(heartbeat) = heartbeat {
        runtime.block_on(heartbeat.stop());
    }
    info!(items = handled, "session finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conquer_core::model::{ScheduleBatch, ScheduleItem};

    #[test]
    fn settings_pairs_are_split_once() {
        let parsed = parse_settings(&["API_KEY=a=b".to_string(), "build_id=7".to_string()]).unwrap();
        assert_eq!(parsed.get("api_key").map(String::as_str), Some("a=b"));
        assert_eq!(parsed.get("build_id").map(String::as_str), Some("7"));
    }

    #[test]
    fn settings_pair_without_equals_is_rejected() {
        assert!(parse_settings(&["api_key".to_string()]).is_err());
    }

    #[test]
    fn every_scheduled_file_is_skipped() {
        let schedule = Schedule::new(
            Some("s1".into()),
            vec![ScheduleBatch {
                items: vec![ScheduleItem::new("a.py"), ScheduleItem::new("b.py")],
            }],
        );
        let report = skip_all(&schedule);
        assert_eq!(report.items.len(), 2);
        assert!(report.items.iter().all(|item| item.status == Status::Skipped));
        assert_eq!(report.items[1].location.file, "b.py");
    }
}

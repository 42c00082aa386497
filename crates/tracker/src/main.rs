use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use timeline::{format_duration, DAY};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod config;
mod group;
mod ingestion;
mod process_monitor;
mod record_file;
mod redraw;
mod registry;
mod report_writer;
mod task_completion_handler;

use config::{Cli, Command, Config, GroupsCommand, ReportArgs};
use group::GroupView;
use ingestion::{run_ingestion, IngestionPort};
use process_monitor::{Monitor, ProcFs, ProcessMonitorTask};
use record_file::{load_or_recover, Record, RecordLock};
use redraw::RedrawSignal;
use registry::{Registry, RegistryError};
use report_writer::ReportWriter;
use task_completion_handler::{task_completion_handler, TaskOutcome};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn format_timestamp(unix_seconds: u64) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetDateTime::from_unix_timestamp(unix_seconds as i64)
        .map(|t| t.to_offset(offset))
        .ok()
        .and_then(|t| t.format(&format).ok())
        .unwrap_or_else(|| unix_seconds.to_string())
}

fn unix_seconds(time: OffsetDateTime) -> u64 {
    time.unix_timestamp().max(0) as u64
}

fn now_unix_seconds() -> u64 {
    unix_seconds(OffsetDateTime::now_utc())
}

/// Text rendering of a view: one summary line, then one line per bucket
fn describe_view(group: &str, view: &GroupView) -> String {
    let summary = &view.summary;
    let mut text = format!(
        "{}: {} runs, total {}, longest {}, mean {} ({} buckets)",
        if group.is_empty() { "<no group>" } else { group },
        summary.count,
        format_duration(summary.total),
        format_duration(summary.max),
        format_duration(summary.mean.round() as u64),
        format_duration(view.bucket_width),
    );
    for bucket in &view.buckets {
        text.push_str(&format!(
            "\n  {}  {:>8.2} {}",
            format_timestamp(bucket.start),
            bucket.value,
            view.unit.label()
        ));
    }
    text
}

fn save_registry(registry: &Registry, path: &Path) -> Result<()> {
    let record = registry.to_record();
    record
        .save(path)
        .with_context(|| format!("Failed to save record file {}", path.display()))?;
    info!("Saved {} groups to {}", record.groups.len(), path.display());
    Ok(())
}

/// Renders the selected group whenever a redraw is owed.
///
/// Every frame is owed while tracked processes are running.
async fn run_refresh(
    registry: Arc<Registry>,
    port: Arc<IngestionPort>,
    redraw: Arc<RedrawSignal>,
    interval: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    let mut last_rendered = String::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let running = port.tracked_count();
                if running > 0 && !redraw.is_permanent() {
                    redraw.start_permanent_redraw();
                } else if running == 0 && redraw.is_permanent() {
                    redraw.stop_permanent_redraw();
                }
                if !redraw.consume_frame() {
                    continue;
                }
                let (name, intervals) = registry.selected_intervals();
                let now = now_unix_seconds();
                let view = intervals.view(now.saturating_sub(DAY), now + DAY)?;
                let text = format!(
                    "{}\n  {} tracked processes running",
                    describe_view(&name, &view),
                    running
                );
                if text != last_rendered {
                    println!("{}", text);
                    last_rendered = text;
                }
            }
        }
    }

    Ok(())
}

async fn run_tracker(config: &Config) -> Result<()> {
    let _lock = RecordLock::acquire(&config.record_file)?;
    let registry = Arc::new(Registry::from_record(load_or_recover(&config.record_file)?));
    let redraw = Arc::new(RedrawSignal::new());
    let port = Arc::new(IngestionPort::new(registry.clone(), redraw.clone()));
    let shutdown = CancellationToken::new();

    let monitor = Monitor::new(Box::new(ProcFs::new()?), registry.clone());
    let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let monitor_task =
        ProcessMonitorTask::new(monitor, sender, config.poll_interval, shutdown.clone());

    let tasks = vec![
        tokio::spawn(task_completion_handler(
            monitor_task.run(),
            shutdown.clone(),
            "process monitor",
        )),
        tokio::spawn(task_completion_handler(
            run_ingestion(port.clone(), receiver),
            shutdown.clone(),
            "ingestion",
        )),
        tokio::spawn(task_completion_handler(
            run_refresh(
                registry.clone(),
                port.clone(),
                redraw.clone(),
                config.refresh_interval,
                shutdown.clone(),
            ),
            shutdown.clone(),
            "refresh",
        )),
    ];

    info!(
        "Tracking {} groups, polling every {:?}",
        registry.len(),
        config.poll_interval
    );
    redraw.request_redraw();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received"),
                Err(err) => error!("Failed to listen for Ctrl-C: {}", err),
            }
        }
        _ = shutdown.cancelled() => warn!("A background task stopped, shutting down"),
    }

    // No exit handler writes into a group past this point
    port.begin_shutdown();
    shutdown.cancel();
    let outcomes = futures::future::join_all(tasks).await;
    info!(
        "{} tracked processes still running at shutdown",
        port.tracked_count()
    );

    save_registry(&registry, &config.record_file)?;

    let failed = outcomes
        .iter()
        .filter(|outcome| !matches!(outcome, Ok(TaskOutcome::Completed)))
        .count();
    if failed > 0 {
        bail!("{} of {} background tasks failed", failed, outcomes.len());
    }
    Ok(())
}

fn edit_groups(config: &Config, command: GroupsCommand) -> Result<()> {
    // A running tracker would overwrite the edit when it saves at shutdown
    let _lock = match command {
        GroupsCommand::List => None,
        _ => Some(RecordLock::acquire(&config.record_file)?),
    };
    let registry = Registry::from_record(load_or_recover(&config.record_file)?);

    match command {
        GroupsCommand::List => {
            for name in registry.group_names() {
                let marker = if registry.is_selected(&name) { '*' } else { ' ' };
                println!("{} {:<24} {}", marker, name, registry.processes_string(&name)?);
            }
            return Ok(());
        }
        GroupsCommand::Create { name } => {
            let name = match name {
                Some(name) => {
                    registry.create_group(&name)?;
                    name
                }
                None => registry.create_new_group(),
            };
            println!("Created group {:?}", name);
        }
        GroupsCommand::Delete { name } => {
            let was_selected = registry.is_selected(&name);
            match registry.delete_group(&name)? {
                Some(neighbour) if was_selected => {
                    println!("Deleted group {:?}, selected {:?}", name, neighbour)
                }
                _ => println!("Deleted group {:?}", name),
            }
        }
        GroupsCommand::Rename { name, new_name } => {
            registry.rename_group(&name, &new_name)?;
            println!("Renamed group {:?} to {:?}", name, new_name);
        }
        GroupsCommand::SetProcesses { name, processes } => {
            match registry.set_process_list(&name, &processes, config.max_processes_length) {
                Ok(()) => {}
                // The names accepted before the limit are kept
                Err(err @ RegistryError::TooManyProcesses(_)) => warn!("{}", err),
                Err(err) => return Err(err.into()),
            }
            println!("{}: {}", name, registry.processes_string(&name)?);
        }
        GroupsCommand::Select { name } => {
            registry.select(Some(&name))?;
            println!("Selected group {:?}", name);
        }
    }

    save_registry(&registry, &config.record_file)
}

fn report(config: &Config, args: ReportArgs) -> Result<()> {
    let record = Record::load(&config.record_file)
        .with_context(|| format!("Failed to read {}", config.record_file.display()))?
        .unwrap_or_default();
    let registry = Registry::from_record(record);

    let (name, intervals) = match args.group {
        Some(name) => {
            let intervals = registry
                .lookup(&name)
                .ok_or_else(|| RegistryError::NotFound(name.clone()))?;
            (name, intervals)
        }
        None => registry.selected_intervals(),
    };

    let now = OffsetDateTime::now_utc();
    let from = args.from.unwrap_or(now - time::Duration::DAY);
    let to = args.to.unwrap_or(now + time::Duration::DAY);
    let view = intervals.view(unix_seconds(from), unix_seconds(to))?;
    println!("{}", describe_view(&name, &view));

    if let Some(path) = args.output {
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = ReportWriter::new(file)?;
        writer.write(&name, &view)?;
        writer.finish()?;
        info!("Wrote {} buckets to {}", view.buckets.len(), path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = Config::from_cli(&cli);

    match cli.command {
        Command::Run => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(run_tracker(&config))
        }
        Command::Groups(command) => edit_groups(&config, command),
        Command::Report(args) => report(&config, args),
    }
}

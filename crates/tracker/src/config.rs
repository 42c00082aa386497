use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Longest process list accepted by `groups set-processes`, in UTF-16 units
pub const MAX_PROCESSES_LENGTH: usize = 4096;

/// Tracks how long groups of programs run and reports usage histograms
#[derive(Debug, Parser)]
#[command(name = "tracker")]
pub struct Cli {
    /// Verbose debug output
    #[arg(short, long)]
    pub verbose: bool,

    /// Record file (defaults to the per-user data directory)
    #[arg(short, long)]
    pub record_file: Option<PathBuf>,

    /// Process table poll interval in milliseconds
    #[arg(long, default_value = "500")]
    pub poll_interval_ms: u64,

    /// View refresh interval in milliseconds
    #[arg(long, default_value = "250")]
    pub refresh_interval_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Monitor processes until interrupted, then save
    Run,

    /// Edit groups stored in the record file
    #[command(subcommand)]
    Groups(GroupsCommand),

    /// Print the histogram of a group
    Report(ReportArgs),
}

#[derive(Debug, Subcommand)]
pub enum GroupsCommand {
    /// List groups and their processes
    List,

    /// Create a group (a placeholder name is generated when omitted)
    Create { name: Option<String> },

    /// Delete a group and its history
    Delete { name: String },

    /// Rename a group
    Rename { name: String, new_name: String },

    /// Replace the processes of a group, e.g. "firefox; code"
    SetProcesses { name: String, processes: String },

    /// Select the group shown by `run`
    Select { name: String },
}

#[derive(Debug, Parser)]
pub struct ReportArgs {
    /// Group to report (defaults to the selected group)
    #[arg(short, long)]
    pub group: Option<String>,

    /// Start of the visible range, RFC 3339 (defaults to one day ago)
    #[arg(long, value_parser = parse_timestamp)]
    pub from: Option<OffsetDateTime>,

    /// End of the visible range, RFC 3339 (defaults to one day from now)
    #[arg(long, value_parser = parse_timestamp)]
    pub to: Option<OffsetDateTime>,

    /// Also write the buckets to this Parquet file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| format!("invalid RFC 3339 timestamp: {}", e))
}

/// Settings resolved from the command line
#[derive(Debug, Clone)]
pub struct Config {
    pub record_file: PathBuf,
    pub poll_interval: Duration,
    pub refresh_interval: Duration,
    pub max_processes_length: usize,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            record_file: cli.record_file.clone().unwrap_or_else(default_record_file),
            poll_interval: Duration::from_millis(cli.poll_interval_ms.max(1)),
            refresh_interval: Duration::from_millis(cli.refresh_interval_ms.max(1)),
            max_processes_length: MAX_PROCESSES_LENGTH,
        }
    }
}

fn default_record_file() -> PathBuf {
    ProjectDirs::from("org", "tracker", "tracker")
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".tracker"))
        .join("records.dat")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["tracker", "run"]).unwrap();
        assert!(!cli.verbose);
        assert!(matches!(cli.command, Command::Run));

        let config = Config::from_cli(&cli);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.refresh_interval, Duration::from_millis(250));
        assert!(config.record_file.ends_with("records.dat"));
    }

    #[test]
    fn test_record_file_override() {
        let cli =
            Cli::try_parse_from(["tracker", "-r", "/tmp/x.dat", "--poll-interval-ms", "0", "run"])
                .unwrap();
        let config = Config::from_cli(&cli);
        assert_eq!(config.record_file, PathBuf::from("/tmp/x.dat"));
        assert_eq!(config.poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_groups_subcommands() {
        let cli = Cli::try_parse_from([
            "tracker",
            "groups",
            "set-processes",
            "dev",
            "code; nvim",
        ])
        .unwrap();
        match cli.command {
            Command::Groups(GroupsCommand::SetProcesses { name, processes }) => {
                assert_eq!(name, "dev");
                assert_eq!(processes, "code; nvim");
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["tracker", "groups", "create"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Groups(GroupsCommand::Create { name: None })
        ));
    }

    #[test]
    fn test_report_timestamps() {
        let cli = Cli::try_parse_from([
            "tracker",
            "report",
            "--from",
            "2024-01-01T00:00:00Z",
            "--to",
            "2024-01-02T12:00:00+02:00",
        ])
        .unwrap();
        match cli.command {
            Command::Report(args) => {
                assert_eq!(args.from.unwrap().unix_timestamp(), 1_704_067_200);
                assert_eq!(args.to.unwrap().unix_timestamp(), 1_704_189_600);
                assert!(args.group.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Cli::try_parse_from(["tracker", "report", "--from", "yesterday"]).is_err());
    }
}

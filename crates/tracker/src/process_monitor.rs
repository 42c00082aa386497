use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use timeline::{unix_seconds_to_ticks, TICKS_PER_SECOND};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;

/// One running process as seen by a [`ProcessSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable name, not normalized
    pub name: String,
    /// Process start time, ticks
    pub start_tick: u64,
}

/// Lifetime notifications delivered to the ingestion port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Started { pid: u32, name: String },
    Exited { pid: u32, start: u64, end: u64 },
}

/// Enumerates the processes currently running
pub trait ProcessSource: Send {
    fn snapshot(&mut self) -> Result<Vec<ProcessInfo>>;
}

/// Current wall clock in ticks
pub fn now_ticks() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    unix_seconds_to_ticks(since_epoch.as_secs()) + u64::from(since_epoch.subsec_nanos()) / 100
}

/// Parses `/proc/<pid>/stat`, returning the command name and the start time in clock ticks after boot.
///
/// The command name sits in parentheses and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
pub fn parse_stat(content: &str) -> Option<(String, u64)> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close < open {
        return None;
    }
    let comm = content[open + 1..close].to_string();
    // Field 3 (state) is the first after the name; starttime is field 22
    let start_time = content[close + 1..]
        .split_whitespace()
        .nth(19)?
        .parse()
        .ok()?;
    Some((comm, start_time))
}

fn file_name_of(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Basename of argv[0] from the contents of `/proc/<pid>/cmdline`
pub fn parse_cmdline_name(content: &[u8]) -> Option<String> {
    let argv0 = content.split(|b| *b == 0).next()?;
    file_name_of(&String::from_utf8_lossy(argv0))
}

/// Untruncated executable name of the process in `dir`.
///
/// The kernel cuts `comm` to 15 bytes, so the `exe` link is tried first, then
/// argv[0]. `comm` is kept for kernel threads and for processes whose `exe`
/// belongs to another user and whose command line is empty.
fn process_name(dir: &Path, comm: String) -> String {
    let from_exe = fs::read_link(dir.join("exe")).ok().and_then(|target| {
        let target = target.to_string_lossy();
        file_name_of(target.trim_end_matches(" (deleted)"))
    });
    from_exe
        .or_else(|| {
            fs::read(dir.join("cmdline"))
                .ok()
                .and_then(|content| parse_cmdline_name(&content))
        })
        .unwrap_or(comm)
}

/// Reads `btime` from the contents of `/proc/stat`
pub fn parse_boot_time(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|value| value.trim().parse().ok())
}

fn clock_ticks_per_second() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

/// [`ProcessSource`] backed by procfs
#[derive(Debug)]
pub struct ProcFs {
    root: PathBuf,
    boot_tick: u64,
    clock_ticks: u64,
}

impl ProcFs {
    pub fn new() -> Result<Self> {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let stat_path = root.join("stat");
        let stat = fs::read_to_string(&stat_path)
            .with_context(|| format!("Failed to read {}", stat_path.display()))?;
        let boot_time = parse_boot_time(&stat)
            .ok_or_else(|| anyhow!("No btime in {}", stat_path.display()))?;

        Ok(Self {
            root,
            boot_tick: unix_seconds_to_ticks(boot_time),
            clock_ticks: clock_ticks_per_second(),
        })
    }

    fn start_tick(&self, start_time: u64) -> u64 {
        self.boot_tick + start_time * TICKS_PER_SECOND / self.clock_ticks
    }
}

impl ProcessSource for ProcFs {
    fn snapshot(&mut self) -> Result<Vec<ProcessInfo>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list {}", self.root.display()))?;

        let mut processes = Vec::new();
        for entry in entries.flatten() {
            let pid = match entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            // The process may exit between listing and reading
            let content = match fs::read_to_string(entry.path().join("stat")) {
                Ok(content) => content,
                Err(_) => continue,
            };
            if let Some((comm, start_time)) = parse_stat(&content) {
                processes.push(ProcessInfo {
                    pid,
                    name: process_name(&entry.path(), comm),
                    start_tick: self.start_tick(start_time),
                });
            }
        }
        Ok(processes)
    }
}

/// Turns successive snapshots into start and exit events for claimed processes
pub struct Monitor {
    source: Box<dyn ProcessSource>,
    registry: Arc<Registry>,
    running: HashMap<u32, ProcessInfo>,
}

impl Monitor {
    pub fn new(source: Box<dyn ProcessSource>, registry: Arc<Registry>) -> Self {
        Self {
            source,
            registry,
            running: HashMap::new(),
        }
    }

    /// Number of claimed processes currently followed
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Takes a snapshot and diffs it against the previous one.
    ///
    /// A pid whose start time changed was reused, and is reported as an exit
    /// followed by a start.
    pub fn poll(&mut self, now_tick: u64) -> Result<Vec<ProcessEvent>> {
        let snapshot = self.source.snapshot()?;
        let mut events = Vec::new();

        let current: HashMap<u32, ProcessInfo> =
            snapshot.into_iter().map(|info| (info.pid, info)).collect();

        let mut exited: Vec<u32> = self
            .running
            .iter()
            .filter(|(pid, info)| {
                current
                    .get(pid)
                    .map_or(true, |seen| seen.start_tick != info.start_tick)
            })
            .map(|(pid, _)| *pid)
            .collect();
        exited.sort_unstable();

        for pid in exited {
            if let Some(info) = self.running.remove(&pid) {
                events.push(ProcessEvent::Exited {
                    pid,
                    start: info.start_tick,
                    end: now_tick.max(info.start_tick),
                });
            }
        }

        let mut started: Vec<&ProcessInfo> = current
            .values()
            .filter(|info| !self.running.contains_key(&info.pid))
            .filter(|info| self.registry.lookup_by_process(&info.name).is_some())
            .collect();
        started.sort_unstable_by_key(|info| info.pid);

        for info in started {
            events.push(ProcessEvent::Started {
                pid: info.pid,
                name: info.name.clone(),
            });
            self.running.insert(info.pid, info.clone());
        }

        Ok(events)
    }
}

/// Polls the process table and forwards events until cancelled
pub struct ProcessMonitorTask {
    monitor: Monitor,
    sender: mpsc::Sender<ProcessEvent>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl ProcessMonitorTask {
    pub fn new(
        monitor: Monitor,
        sender: mpsc::Sender<ProcessEvent>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            monitor,
            sender,
            poll_interval,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Process monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let events = match self.monitor.poll(now_ticks()) {
                        Ok(events) => events,
                        Err(err) => {
                            warn!("Process snapshot failed: {:?}", err);
                            continue;
                        }
                    };
                    for event in events {
                        if self.sender.send(event).await.is_err() {
                            debug!("Event receiver dropped, shutting down process monitor");
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted snapshots
    struct ScriptedSource {
        snapshots: Arc<Mutex<VecDeque<Vec<ProcessInfo>>>>,
    }

    impl ProcessSource for ScriptedSource {
        fn snapshot(&mut self) -> Result<Vec<ProcessInfo>> {
            self.snapshots
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("script exhausted"))
        }
    }

    fn process(pid: u32, name: &str, start_tick: u64) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: name.to_string(),
            start_tick,
        }
    }

    fn monitor_with(snapshots: Vec<Vec<ProcessInfo>>) -> Monitor {
        let registry = Arc::new(Registry::new());
        registry.create_group("editors").unwrap();
        registry
            .set_process_list("editors", "code; nvim", 4096)
            .unwrap();
        let source = ScriptedSource {
            snapshots: Arc::new(Mutex::new(snapshots.into())),
        };
        Monitor::new(Box::new(source), registry)
    }

    #[test]
    fn test_parse_stat() {
        let line = "1234 (my (odd) proc) S 1 1234 1234 0 -1 4194560 100 0 0 0 5 3 0 0 20 0 1 0 98765 1000 50";
        assert_eq!(
            parse_stat(line),
            Some(("my (odd) proc".to_string(), 98765))
        );
        assert_eq!(parse_stat("garbage"), None);
        assert_eq!(parse_stat("1 (short) S 1 2"), None);
    }

    #[test]
    fn test_parse_boot_time() {
        let stat = "cpu  1 2 3 4\nintr 5\nbtime 1700000000\nprocesses 42\n";
        assert_eq!(parse_boot_time(stat), Some(1_700_000_000));
        assert_eq!(parse_boot_time("cpu 1\n"), None);
    }

    #[test]
    fn test_poll_reports_claimed_starts_and_exits() {
        let mut monitor = monitor_with(vec![
            vec![process(1, "bash", 5), process(2, "Code", 10)],
            vec![process(1, "bash", 5), process(2, "Code", 10), process(3, "nvim", 40)],
            vec![process(3, "nvim", 40)],
        ]);

        assert_eq!(
            monitor.poll(100).unwrap(),
            vec![ProcessEvent::Started {
                pid: 2,
                name: "Code".to_string()
            }]
        );
        assert_eq!(
            monitor.poll(200).unwrap(),
            vec![ProcessEvent::Started {
                pid: 3,
                name: "nvim".to_string()
            }]
        );
        assert_eq!(
            monitor.poll(300).unwrap(),
            vec![ProcessEvent::Exited {
                pid: 2,
                start: 10,
                end: 300
            }]
        );
        assert_eq!(monitor.running(), 1);
    }

    #[test]
    fn test_pid_reuse_is_exit_then_start() {
        let mut monitor = monitor_with(vec![
            vec![process(7, "code", 10)],
            vec![process(7, "code", 250)],
        ]);
        monitor.poll(100).unwrap();

        assert_eq!(
            monitor.poll(300).unwrap(),
            vec![
                ProcessEvent::Exited {
                    pid: 7,
                    start: 10,
                    end: 300
                },
                ProcessEvent::Started {
                    pid: 7,
                    name: "code".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_snapshot_failure_keeps_state() {
        let mut monitor = monitor_with(vec![vec![process(7, "code", 10)]]);
        monitor.poll(100).unwrap();
        assert!(monitor.poll(200).is_err());
        assert_eq!(monitor.running(), 1);
    }

    #[test]
    fn test_procfs_reads_fake_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stat"), "cpu 0\nbtime 1000\n").unwrap();
        fs::create_dir(dir.path().join("42")).unwrap();
        fs::write(
            dir.path().join("42").join("stat"),
            "42 (code) S 1 42 42 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 0 0 0",
        )
        .unwrap();
        fs::create_dir(dir.path().join("self")).unwrap();

        let mut procfs = ProcFs::with_root(dir.path()).unwrap();
        assert_eq!(
            procfs.snapshot().unwrap(),
            vec![process(42, "code", unix_seconds_to_ticks(1000))]
        );
    }

    #[test]
    fn test_parse_cmdline_name() {
        assert_eq!(
            parse_cmdline_name(b"/usr/libexec/gnome-terminal-server\0--app-id\0x\0"),
            Some("gnome-terminal-server".to_string())
        );
        assert_eq!(parse_cmdline_name(b"nvim\0"), Some("nvim".to_string()));
        assert_eq!(parse_cmdline_name(b""), None);
        assert_eq!(parse_cmdline_name(b"\0\0"), None);
    }

    fn fake_process(root: &Path, pid: u32, comm: &str) -> PathBuf {
        let dir = root.join(pid.to_string());
        fs::create_dir(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!("{} ({}) S 1 1 1 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 0 0 0", pid, comm),
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_procfs_uses_untruncated_names() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("stat"), "btime 1000\n").unwrap();

        let dir = fake_process(root.path(), 42, "averyverylongex");
        std::os::unix::fs::symlink("/opt/bin/averyverylongexecutable", dir.join("exe")).unwrap();

        let dir = fake_process(root.path(), 43, "gnome-terminal-");
        fs::write(dir.join("cmdline"), b"/usr/libexec/gnome-terminal-server\0--x\0").unwrap();

        let dir = fake_process(root.path(), 44, "updated-daemon-");
        std::os::unix::fs::symlink("/usr/bin/updated-daemon-binary (deleted)", dir.join("exe"))
            .unwrap();

        fake_process(root.path(), 45, "kthreadd");

        let mut procfs = ProcFs::with_root(root.path()).unwrap();
        let mut names: Vec<(u32, String)> = procfs
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|info| (info.pid, info.name))
            .collect();
        names.sort();

        assert_eq!(
            names,
            vec![
                (42, "averyverylongexecutable".to_string()),
                (43, "gnome-terminal-server".to_string()),
                (44, "updated-daemon-binary".to_string()),
                (45, "kthreadd".to_string()),
            ]
        );
    }

    #[test]
    fn test_long_claimed_name_is_reported_started() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("stat"), "btime 1000\n").unwrap();
        let dir = fake_process(root.path(), 42, "averyverylongex");
        std::os::unix::fs::symlink("/opt/bin/averyverylongexecutable", dir.join("exe")).unwrap();

        let registry = Arc::new(Registry::new());
        registry.create_group("long").unwrap();
        registry
            .set_process_list("long", "averyverylongexecutable", 4096)
            .unwrap();
        let mut monitor = Monitor::new(Box::new(ProcFs::with_root(root.path()).unwrap()), registry);

        assert_eq!(
            monitor.poll(unix_seconds_to_ticks(2000)).unwrap(),
            vec![ProcessEvent::Started {
                pid: 42,
                name: "averyverylongexecutable".to_string()
            }]
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_real_procfs_names_this_process_in_full() {
        let expected = std::env::current_exe()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let mut procfs = ProcFs::new().unwrap();
        let me = procfs
            .snapshot()
            .unwrap()
            .into_iter()
            .find(|info| info.pid == std::process::id())
            .unwrap();
        assert_eq!(me.name, expected);
    }

    #[tokio::test]
    async fn test_task_forwards_events_and_stops_on_cancel() {
        let monitor = monitor_with(vec![vec![process(2, "code", 10)], vec![], vec![]]);
        let (sender, mut receiver) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let task = ProcessMonitorTask::new(
            monitor,
            sender,
            Duration::from_millis(1),
            shutdown.clone(),
        );
        let handle = tokio::spawn(task.run());

        assert!(matches!(
            receiver.recv().await,
            Some(ProcessEvent::Started { pid: 2, .. })
        ));
        assert!(matches!(
            receiver.recv().await,
            Some(ProcessEvent::Exited { pid: 2, start: 10, .. })
        ));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}

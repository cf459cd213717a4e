use std::{
    collections::VecDeque,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::Local;

use crate::Result;

pub const DEFAULT_LOG_CAPACITY: usize = 2000;
pub const DEFAULT_LOG_TAIL: usize = 400;

/// Initialize tracing for the bot.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    // Default: info for our crates, warn for everything else.
    // Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,gwb=info,gwb_core=info,gwb_bridge=info,{service_name}=info"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init()
        .map_err(|e| crate::Error::External(format!("tracing init failed: {e}")))
}

#[derive(Debug)]
struct Ring {
    cap: usize,
    lines: VecDeque<String>,
}

/// Bounded activity log shared between the worker and the control plane.
///
/// Every line is also emitted as a tracing event and, best effort, appended to
/// a mirror file. Cloning is cheap; clones share the same buffer.
#[derive(Clone, Debug)]
pub struct ActivityLog {
    ring: Arc<Mutex<Ring>>,
    mirror: Option<PathBuf>,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(Ring {
                cap: capacity.max(1),
                lines: VecDeque::new(),
            })),
            mirror: None,
        }
    }

    /// Mirror every appended line to `path` (created on first write).
    pub fn with_mirror(mut self, path: impl Into<PathBuf>) -> Self {
        self.mirror = Some(path.into());
        self
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::info!("{msg}");
        self.append(msg);
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::warn!("{msg}");
        self.append(msg);
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::error!("{msg}");
        self.append(msg);
    }

    /// Most recent `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let skip = ring.lines.len().saturating_sub(n);
        ring.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .lines
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, msg: &str) {
        let line = format!("[{}] {msg}", Local::now().format("%Y-%m-%d %H:%M:%S"));
        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            while ring.lines.len() >= ring.cap {
                ring.lines.pop_front();
            }
            ring.lines.push_back(line.clone());
        }
        if let Some(path) = &self.mirror {
            append_line(path, &line);
        }
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

fn append_line(path: &Path, line: &str) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(file, "{line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest_lines_past_capacity() {
        let log = ActivityLog::new(3);
        for i in 0..5 {
            log.info(format!("line {i}"));
        }
        let tail = log.tail(10);
        assert_eq!(tail.len(), 3);
        assert!(tail[0].ends_with("line 2"));
        assert!(tail[2].ends_with("line 4"));
    }

    #[test]
    fn tail_returns_most_recent_lines_in_order() {
        let log = ActivityLog::new(100);
        for i in 0..10 {
            log.info(format!("n{i}"));
        }
        let tail = log.tail(2);
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("n8"));
        assert!(tail[1].ends_with("n9"));
    }

    #[test]
    fn lines_are_mirrored_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bot_logs.txt");
        let log = ActivityLog::new(10).with_mirror(&path);
        log.info("hello");
        log.warn("world");

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(written.contains("hello"));
        assert!(written.contains("world"));
    }

    #[test]
    fn unwritable_mirror_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for append.
        let log = ActivityLog::new(10).with_mirror(dir.path());
        log.error("still buffered");
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn concurrent_appends_are_all_kept() {
        let log = ActivityLog::new(1000);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        log.info(format!("t{t}-{i}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 200);
    }
}

//! Start/stop/status surface for a host process.
//!
//! At most one worker runs per [`Controller`]. The host talks to it only
//! through the cancellation token, the [`StatusBoard`] and the [`ActivityLog`].

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    accounts::{AccountRotator, Credential, SessionStore},
    config::Settings,
    dedup::DedupCache,
    domain::GroupId,
    logging::{ActivityLog, DEFAULT_LOG_TAIL},
    provider::GroupProvider,
    status::{RuntimeStatus, StatusBoard},
    utils::unix_secs,
    worker::{StopReason, Worker},
};

/// Everything a run needs besides the provider.
#[derive(Clone, Debug)]
pub struct StartRequest {
    pub groups: Vec<GroupId>,
    pub credentials: Vec<Credential>,
    pub templates: Vec<String>,
    pub delay: Duration,
    pub poll_interval: Duration,
    pub admins: Vec<String>,
    pub enable_commands: bool,
    pub enable_auto_reply: bool,
    pub rotation_threshold: u32,
}

impl StartRequest {
    pub fn from_settings(settings: Settings, credentials: Vec<Credential>) -> Self {
        Self {
            groups: settings.groups,
            credentials,
            templates: settings.templates,
            delay: settings.delay,
            poll_interval: settings.poll_interval,
            admins: settings.admins,
            enable_commands: settings.enable_commands,
            enable_auto_reply: settings.enable_auto_reply,
            rotation_threshold: settings.rotation_threshold,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.groups.is_empty() {
            return Err("at least one group id is required".to_string());
        }
        if self.credentials.is_empty() {
            return Err("at least one account is required".to_string());
        }
        if self.templates.iter().all(|t| t.trim().is_empty()) && !self.enable_commands {
            return Err("welcome messages are required unless commands are enabled".to_string());
        }
        Ok(())
    }

    fn into_parts(self) -> (Settings, Vec<Credential>) {
        let settings = Settings {
            groups: self.groups,
            templates: self
                .templates
                .into_iter()
                .filter(|t| !t.trim().is_empty())
                .collect(),
            delay: self.delay,
            poll_interval: self.poll_interval,
            admins: self.admins,
            enable_commands: self.enable_commands,
            enable_auto_reply: self.enable_auto_reply,
            rotation_threshold: self.rotation_threshold,
        };
        (settings, self.credentials)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted { task_id: String },
    AlreadyRunning,
    Rejected(String),
}

struct RunHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<StopReason>>,
}

pub struct Controller {
    provider: Arc<dyn GroupProvider>,
    dedup_path: Option<PathBuf>,
    sessions_dir: Option<PathBuf>,
    status: StatusBoard,
    log: ActivityLog,
    run: Mutex<Option<RunHandle>>,
}

impl Controller {
    /// A controller whose runs keep dedup and sessions in memory only.
    pub fn new(provider: Arc<dyn GroupProvider>, log: ActivityLog) -> Self {
        Self {
            provider,
            dedup_path: None,
            sessions_dir: None,
            status: StatusBoard::new(),
            log,
            run: Mutex::new(None),
        }
    }

    pub fn with_dedup_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.dedup_path = Some(path.into());
        self
    }

    pub fn with_sessions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sessions_dir = Some(dir.into());
        self
    }

    /// Spawn a worker. Must be called from within a tokio runtime.
    pub fn start(&self, req: StartRequest) -> StartOutcome {
        let mut guard = self.run.lock().unwrap_or_else(|e| e.into_inner());
        if self.status.snapshot().running {
            return StartOutcome::AlreadyRunning;
        }
        if let Err(reason) = req.validate() {
            self.log.warn(format!("Start rejected: {reason}"));
            return StartOutcome::Rejected(reason);
        }

        let (settings, credentials) = req.into_parts();
        let mut rotator = match AccountRotator::new(credentials, settings.rotation_threshold) {
            Ok(r) => r,
            Err(e) => return StartOutcome::Rejected(e.to_string()),
        };
        if let Some(dir) = &self.sessions_dir {
            rotator = rotator.with_store(SessionStore::new(dir.clone()));
        }
        let dedup = match &self.dedup_path {
            Some(path) => match DedupCache::open(path) {
                Ok(cache) => cache,
                Err(e) => {
                    let reason = format!("cannot open welcomed cache {}: {e}", path.display());
                    self.log.error(&reason);
                    return StartOutcome::Rejected(reason);
                }
            },
            None => DedupCache::in_memory(),
        };
        if dedup.skipped_lines() > 0 {
            self.log.warn(format!(
                "Skipped {} unreadable line(s) in welcomed cache",
                dedup.skipped_lines()
            ));
        }

        let task_id = format!("TASK-{}", unix_secs());
        self.status.update(|st| {
            *st = RuntimeStatus {
                running: true,
                task_id: Some(task_id.clone()),
                ..RuntimeStatus::default()
            };
        });
        self.log.info(format!(
            "Starting {task_id}: {} group(s), {} account(s), {} welcome message(s), {} already welcomed",
            settings.groups.len(),
            rotator.len(),
            settings.templates.len(),
            dedup.len()
        ));

        let cancel = CancellationToken::new();
        let worker = Worker::new(
            settings,
            self.provider.clone(),
            rotator,
            dedup,
            self.status.clone(),
            self.log.clone(),
            cancel.clone(),
        );
        let join = tokio::spawn(worker.run());
        *guard = Some(RunHandle {
            cancel,
            join: Some(join),
        });

        StartOutcome::Accepted { task_id }
    }

    /// Ask the worker to stop. Returns immediately; a no-op when stopped.
    pub fn stop(&self) {
        let guard = self.run.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(run) if !run.cancel.is_cancelled() && self.status.snapshot().running => {
                self.log.info("Stop requested");
                run.cancel.cancel();
            }
            _ => {}
        }
    }

    pub fn status(&self) -> RuntimeStatus {
        self.status.snapshot()
    }

    pub fn status_board(&self) -> &StatusBoard {
        &self.status
    }

    pub fn logs(&self, n: usize) -> Vec<String> {
        self.log.tail(n)
    }

    pub fn recent_logs(&self) -> Vec<String> {
        self.log.tail(DEFAULT_LOG_TAIL)
    }

    /// Wait for the current worker to exit. `None` if there was none to wait on.
    ///
    /// Dropping the future before it completes loses nothing; a later call
    /// still observes the exit.
    pub async fn wait(&self) -> Option<StopReason> {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|st| !st.running).await;

        let join = {
            let mut guard = self.run.lock().unwrap_or_else(|e| e.into_inner());
            guard.as_mut().and_then(|run| run.join.take())
        }?;
        match join.await {
            Ok(reason) => Some(reason),
            Err(e) => {
                self.log.error(format!("Worker task failed: {e}"));
                None
            }
        }
    }
}

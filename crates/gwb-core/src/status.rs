use chrono::{Local, NaiveDate};
use serde::Serialize;
use tokio::sync::watch;

/// Snapshot of the worker exposed to the control plane.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RuntimeStatus {
    pub running: bool,
    pub task_id: Option<String>,
    pub active_account_index: usize,
    pub active_account: Option<String>,
    pub consecutive_errors: u32,
    pub started_at: Option<String>,
    pub last_poll_at: Option<String>,
    pub total_welcomed: u64,
    pub today_welcomed: u64,
    pub today: Option<NaiveDate>,
    pub stop_reason: Option<String>,
}

/// Single-writer status cell.
///
/// The worker mutates through [`StatusBoard::update`]; readers get a cloned
/// snapshot and never block the writer for longer than the clone.
#[derive(Clone, Debug)]
pub struct StatusBoard {
    tx: watch::Sender<RuntimeStatus>,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RuntimeStatus::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> RuntimeStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeStatus> {
        self.tx.subscribe()
    }

    pub fn update(&self, f: impl FnOnce(&mut RuntimeStatus)) {
        self.tx.send_modify(f);
    }

    /// Count one successfully delivered welcome message.
    pub fn record_welcome_sent(&self) {
        let today = Local::now().date_naive();
        self.update(|st| {
            if st.today != Some(today) {
                st.today = Some(today);
                st.today_welcomed = 0;
            }
            st.total_welcomed += 1;
            st.today_welcomed += 1;
        });
    }

    pub fn set_account(&self, index: usize, identifier: &str, consecutive_errors: u32) {
        self.update(|st| {
            st.active_account_index = index;
            st.active_account = Some(identifier.to_string());
            st.consecutive_errors = consecutive_errors;
        });
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now_str() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

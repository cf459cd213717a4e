//! Credential pool with lazy authentication and a consecutive-failure circuit breaker.

use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{MemberId, Session},
    errors::{Error, ProviderError},
    logging::ActivityLog,
    provider::GroupProvider,
    status::StatusBoard,
    utils::{atomic_write, sleep_or_cancel, unix_secs},
    Result,
};

pub const DEFAULT_ROTATION_THRESHOLD: u32 = 3;

const RATE_LIMIT_BASE_BACKOFF: Duration = Duration::from_secs(30);
const RATE_LIMIT_MAX_BACKOFF: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct Credential {
    pub identifier: String,
    pub secret: String,
    pub cached_session: Option<Session>,
    pub consecutive_errors: u32,
}

impl Credential {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
            cached_session: None,
            consecutive_errors: 0,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .field("cached_session", &self.cached_session.is_some())
            .field("consecutive_errors", &self.consecutive_errors)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFileData {
    identifier: String,
    session: Session,
    saved_at: u64,
}

/// Persists one session blob per credential so restarts can skip logging in.
#[derive(Clone, Debug)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Percent-encoded so distinct identifiers never share a file.
    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", urlencoding::encode(identifier)))
    }

    pub fn load(&self, identifier: &str) -> Result<Option<Session>> {
        let path = self.path_for(identifier);
        if !path.exists() {
            return Ok(None);
        }
        let txt = fs::read_to_string(&path)?;
        if txt.trim().is_empty() {
            return Ok(None);
        }
        let data: SessionFileData = serde_json::from_str(&txt)?;
        if data.identifier != identifier {
            return Ok(None);
        }
        Ok(Some(data.session))
    }

    pub fn save(&self, identifier: &str, session: &Session) -> Result<()> {
        let data = SessionFileData {
            identifier: identifier.to_string(),
            session: session.clone(),
            saved_at: unix_secs(),
        };
        let txt = serde_json::to_vec_pretty(&data)?;
        atomic_write(&self.path_for(identifier), &txt)
    }

    pub fn remove(&self, identifier: &str) -> Result<()> {
        let path = self.path_for(identifier);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// What `record_result` did to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationEvent {
    None,
    Rotated { from: usize, to: usize },
}

/// Ordered credential pool; exactly one credential is active at a time.
#[derive(Debug)]
pub struct AccountRotator {
    pool: Vec<Credential>,
    index: usize,
    threshold: u32,
    store: Option<SessionStore>,
    /// Authentication failures in a row across the pool; a full sweep is fatal.
    auth_failures_in_row: usize,
    rate_limit_streak: u32,
    pending_backoff: Option<Duration>,
    /// Member ids of every account that has held a session.
    own_ids: HashSet<MemberId>,
}

impl AccountRotator {
    pub fn new(pool: Vec<Credential>, threshold: u32) -> Result<Self> {
        if pool.is_empty() {
            return Err(Error::Config("account pool is empty".to_string()));
        }
        Ok(Self {
            pool,
            index: 0,
            threshold: threshold.max(1),
            store: None,
            auth_failures_in_row: 0,
            rate_limit_streak: 0,
            pending_backoff: None,
            own_ids: HashSet::new(),
        })
    }

    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn active(&self) -> &Credential {
        &self.pool[self.index]
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.active().cached_session.as_ref()
    }

    /// Session for the active credential, authenticating if none is cached.
    ///
    /// `Ok(None)` tells the caller to skip this cycle's work. Only a rejected
    /// credential advances the pool and counts toward the sweep; when every
    /// credential has been rejected in a row, returns [`Error::PoolExhausted`].
    /// Network trouble leaves the pool alone, and rate limiting goes through
    /// [`record_error`](Self::record_error) with the wait left in
    /// [`take_backoff`](Self::take_backoff).
    pub async fn ensure_session(
        &mut self,
        provider: &dyn GroupProvider,
    ) -> Result<Option<Session>> {
        if let Some(session) = self.current_session() {
            return Ok(Some(session.clone()));
        }

        if let Some(session) = self.load_persisted() {
            self.auth_failures_in_row = 0;
            self.own_ids.insert(session.self_id.clone());
            let cred = &mut self.pool[self.index];
            cred.cached_session = Some(session.clone());
            tracing::info!(account = %cred.identifier, "reusing persisted session");
            return Ok(Some(session));
        }

        let (identifier, secret) = {
            let cred = self.active();
            (cred.identifier.clone(), cred.secret.clone())
        };

        match provider.authenticate(&identifier, &secret).await {
            Ok(session) => {
                let cred = &mut self.pool[self.index];
                cred.cached_session = Some(session.clone());
                cred.consecutive_errors = 0;
                self.auth_failures_in_row = 0;
                self.own_ids.insert(session.self_id.clone());
                if let Some(store) = &self.store {
                    if let Err(e) = store.save(&identifier, &session) {
                        tracing::warn!(account = %identifier, "could not persist session: {e}");
                    }
                }
                Ok(Some(session))
            }
            Err(e @ (ProviderError::Auth(_) | ProviderError::Rejected(_))) => {
                tracing::warn!(account = %identifier, "authentication failed: {e}");
                self.auth_failures_in_row += 1;
                self.pool[self.index].consecutive_errors = 0;
                self.advance();
                if self.auth_failures_in_row >= self.pool.len() {
                    return Err(Error::PoolExhausted {
                        accounts: self.pool.len(),
                    });
                }
                Ok(None)
            }
            Err(e @ ProviderError::RateLimited { .. }) => {
                tracing::warn!(account = %identifier, "login rate limited: {e}");
                let (_, backoff) = self.record_error(&e);
                self.pending_backoff = backoff;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(account = %identifier, "login attempt failed: {e}");
                Ok(None)
            }
        }
    }

    /// Whether `member` is one of the pool's own accounts seen so far.
    pub fn is_own(&self, member: &MemberId) -> bool {
        self.own_ids.contains(member)
    }

    /// Backoff requested by a rate-limited login, if one is pending.
    pub fn take_backoff(&mut self) -> Option<Duration> {
        self.pending_backoff.take()
    }

    /// Feed back the outcome of a provider call made through the active credential.
    pub fn record_result(&mut self, success: bool) -> RotationEvent {
        if success {
            self.pool[self.index].consecutive_errors = 0;
            self.rate_limit_streak = 0;
            return RotationEvent::None;
        }

        let cred = &mut self.pool[self.index];
        cred.consecutive_errors += 1;
        if cred.consecutive_errors < self.threshold {
            return RotationEvent::None;
        }

        let from = self.index;
        self.invalidate_active();
        self.advance();
        RotationEvent::Rotated {
            from,
            to: self.index,
        }
    }

    /// Classify a provider error for the breaker.
    ///
    /// Rate limiting does not count the first time; a repeat in a row counts as
    /// a failure. Returns how long the caller should back off, if at all.
    pub fn record_error(&mut self, err: &ProviderError) -> (RotationEvent, Option<Duration>) {
        match err {
            ProviderError::RateLimited { retry_after } => {
                self.rate_limit_streak += 1;
                let backoff =
                    retry_after.unwrap_or_else(|| escalating_backoff(self.rate_limit_streak));
                let event = if self.rate_limit_streak > 1 {
                    self.record_result(false)
                } else {
                    RotationEvent::None
                };
                if matches!(event, RotationEvent::Rotated { .. }) {
                    self.rate_limit_streak = 0;
                }
                (event, Some(backoff))
            }
            // A missing group or an abandoned send says nothing about the credential.
            ProviderError::NotFound(_) | ProviderError::Cancelled => (RotationEvent::None, None),
            _ => (self.record_result(false), None),
        }
    }

    /// [`record_error`](Self::record_error) plus logging and any backoff wait.
    ///
    /// Returns `false` if `cancel` fired while backing off.
    pub async fn absorb_error(
        &mut self,
        err: &ProviderError,
        log: &ActivityLog,
        cancel: &CancellationToken,
    ) -> bool {
        let from = self.active().identifier.clone();
        let (event, backoff) = self.record_error(err);
        if let RotationEvent::Rotated { .. } = event {
            log.warn(format!(
                "Account {from} reached {} consecutive errors; switched to {}",
                self.threshold,
                self.active().identifier
            ));
        }
        match backoff {
            Some(wait) => {
                log.warn(format!("Rate limited; backing off {}s", wait.as_secs()));
                sleep_or_cancel(cancel, wait).await
            }
            None => true,
        }
    }

    /// Mirror the active account into the shared status.
    pub fn publish(&self, status: &StatusBoard) {
        let cred = self.active();
        status.set_account(self.index, &cred.identifier, cred.consecutive_errors);
    }

    fn invalidate_active(&mut self) {
        let cred = &mut self.pool[self.index];
        cred.cached_session = None;
        cred.consecutive_errors = 0;
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(&cred.identifier) {
                tracing::warn!(account = %cred.identifier, "could not drop persisted session: {e}");
            }
        }
    }

    fn advance(&mut self) {
        self.index = (self.index + 1) % self.pool.len();
    }

    fn load_persisted(&self) -> Option<Session> {
        let store = self.store.as_ref()?;
        let identifier = &self.active().identifier;
        match store.load(identifier) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(account = %identifier, "ignoring unreadable session file: {e}");
                None
            }
        }
    }
}

fn escalating_backoff(streak: u32) -> Duration {
    let shift = streak.saturating_sub(1).min(8);
    RATE_LIMIT_BASE_BACKOFF
        .saturating_mul(1u32 << shift)
        .min(RATE_LIMIT_MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{session_for, FakeProvider};

    fn pool(ids: &[&str]) -> Vec<Credential> {
        ids.iter().map(|id| Credential::new(*id, "pw")).collect()
    }

    #[tokio::test]
    async fn session_is_authenticated_lazily_and_cached() {
        let fake = FakeProvider::new();
        let mut rot = AccountRotator::new(pool(&["a", "b"]), 3).unwrap();

        let s1 = rot.ensure_session(&fake).await.unwrap().unwrap();
        let s2 = rot.ensure_session(&fake).await.unwrap().unwrap();
        assert_eq!(s1, s2);
        assert_eq!(fake.auth_calls(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn three_failures_rotate_exactly_once() {
        let fake = FakeProvider::new();
        let mut rot = AccountRotator::new(pool(&["a", "b", "c"]), 3).unwrap();
        rot.ensure_session(&fake).await.unwrap();

        assert_eq!(rot.record_result(false), RotationEvent::None);
        assert_eq!(rot.record_result(false), RotationEvent::None);
        assert_eq!(
            rot.record_result(false),
            RotationEvent::Rotated { from: 0, to: 1 }
        );
        assert_eq!(rot.index(), 1);
        assert_eq!(rot.active().consecutive_errors, 0);
        assert!(rot.pool[0].cached_session.is_none());

        // A fourth failure lands on the new credential and never rolls back.
        assert_eq!(rot.record_result(false), RotationEvent::None);
        assert_eq!(rot.index(), 1);
        assert_eq!(rot.active().consecutive_errors, 1);
    }

    #[tokio::test]
    async fn success_resets_the_counter() {
        let fake = FakeProvider::new();
        let mut rot = AccountRotator::new(pool(&["a", "b"]), 3).unwrap();
        rot.ensure_session(&fake).await.unwrap();

        rot.record_result(false);
        rot.record_result(false);
        rot.record_result(true);
        rot.record_result(false);
        assert_eq!(rot.index(), 0);
        assert_eq!(rot.active().consecutive_errors, 1);
    }

    #[tokio::test]
    async fn rotation_wraps_around_the_pool() {
        let mut rot = AccountRotator::new(pool(&["a", "b"]), 1).unwrap();
        rot.record_result(false);
        assert_eq!(rot.index(), 1);
        rot.record_result(false);
        assert_eq!(rot.index(), 0);
    }

    #[tokio::test]
    async fn auth_failure_advances_and_skips() {
        let fake = FakeProvider::new();
        fake.push_auth_result("a", Err(ProviderError::Auth("bad password".into())));
        let mut rot = AccountRotator::new(pool(&["a", "b"]), 3).unwrap();

        assert!(rot.ensure_session(&fake).await.unwrap().is_none());
        assert_eq!(rot.index(), 1);

        let s = rot.ensure_session(&fake).await.unwrap().unwrap();
        assert_eq!(s, session_for("b"));
    }

    #[tokio::test]
    async fn full_sweep_of_auth_failures_is_fatal() {
        let fake = FakeProvider::new();
        fake.push_auth_result("a", Err(ProviderError::Auth("no".into())));
        fake.push_auth_result("b", Err(ProviderError::Auth("no".into())));
        let mut rot = AccountRotator::new(pool(&["a", "b"]), 3).unwrap();

        assert!(rot.ensure_session(&fake).await.unwrap().is_none());
        let err = rot.ensure_session(&fake).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { accounts: 2 }));
    }

    #[tokio::test]
    async fn accounts_stay_own_after_rotating_away() {
        let fake = FakeProvider::new();
        let mut rot = AccountRotator::new(pool(&["a", "b"]), 1).unwrap();
        rot.ensure_session(&fake).await.unwrap();
        rot.record_result(false);
        rot.ensure_session(&fake).await.unwrap();

        assert!(rot.is_own(&MemberId::from("self-a")));
        assert!(rot.is_own(&MemberId::from("self-b")));
        assert!(!rot.is_own(&MemberId::from("someone")));
    }

    #[tokio::test]
    async fn network_error_at_login_skips_without_advancing() {
        let fake = FakeProvider::new();
        fake.push_auth_result("a", Err(ProviderError::Network("connection reset".into())));
        let mut rot = AccountRotator::new(pool(&["a"]), 3).unwrap();

        assert!(rot.ensure_session(&fake).await.unwrap().is_none());
        assert_eq!(rot.index(), 0);
        assert!(rot.take_backoff().is_none());

        let s = rot.ensure_session(&fake).await.unwrap().unwrap();
        assert_eq!(s, session_for("a"));
    }

    #[tokio::test]
    async fn rate_limited_login_backs_off_then_counts() {
        let fake = FakeProvider::new();
        let rl = || Err(ProviderError::RateLimited { retry_after: None });
        fake.push_auth_result("a", rl());
        fake.push_auth_result("a", rl());
        let mut rot = AccountRotator::new(pool(&["a", "b"]), 3).unwrap();

        assert!(rot.ensure_session(&fake).await.unwrap().is_none());
        assert_eq!(rot.take_backoff(), Some(Duration::from_secs(30)));
        assert!(rot.take_backoff().is_none());
        assert_eq!(rot.active().consecutive_errors, 0);

        assert!(rot.ensure_session(&fake).await.unwrap().is_none());
        assert_eq!(rot.take_backoff(), Some(Duration::from_secs(60)));
        assert_eq!(rot.active().consecutive_errors, 1);
        assert_eq!(rot.index(), 0);

        assert!(rot.ensure_session(&fake).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn persisted_session_breaks_the_failure_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save("b", &session_for("b")).unwrap();

        let fake = FakeProvider::new();
        fake.push_auth_result("a", Err(ProviderError::Auth("no".into())));
        fake.push_auth_result("a", Err(ProviderError::Auth("no".into())));
        let mut rot = AccountRotator::new(pool(&["a", "b"]), 3)
            .unwrap()
            .with_store(store);

        assert!(rot.ensure_session(&fake).await.unwrap().is_none());
        assert_eq!(rot.ensure_session(&fake).await.unwrap(), Some(session_for("b")));
        for _ in 0..3 {
            rot.record_result(false);
        }
        assert_eq!(rot.index(), 0);

        // a fails again, but b authenticated in between: not a full sweep.
        assert!(rot.ensure_session(&fake).await.unwrap().is_none());
        assert_eq!(rot.index(), 1);
        assert!(rot.ensure_session(&fake).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn first_rate_limit_is_free_repeats_count() {
        let fake = FakeProvider::new();
        let mut rot = AccountRotator::new(pool(&["a", "b"]), 2).unwrap();
        rot.ensure_session(&fake).await.unwrap();

        let rl = ProviderError::RateLimited { retry_after: None };
        let (ev, backoff) = rot.record_error(&rl);
        assert_eq!(ev, RotationEvent::None);
        assert_eq!(backoff, Some(Duration::from_secs(30)));
        assert_eq!(rot.active().consecutive_errors, 0);

        let (ev, backoff) = rot.record_error(&rl);
        assert_eq!(ev, RotationEvent::None);
        assert_eq!(backoff, Some(Duration::from_secs(60)));
        assert_eq!(rot.active().consecutive_errors, 1);

        let (ev, _) = rot.record_error(&rl);
        assert_eq!(ev, RotationEvent::Rotated { from: 0, to: 1 });
    }

    #[tokio::test]
    async fn missing_group_does_not_count_against_account() {
        let mut rot = AccountRotator::new(pool(&["a", "b"]), 1).unwrap();
        let (ev, backoff) = rot.record_error(&ProviderError::NotFound("g".into()));
        assert_eq!(ev, RotationEvent::None);
        assert!(backoff.is_none());
        assert_eq!(rot.index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn absorb_error_waits_out_rate_limits() {
        let mut rot = AccountRotator::new(pool(&["a"]), 3).unwrap();
        let log = ActivityLog::new(10);
        let cancel = CancellationToken::new();

        let started = tokio::time::Instant::now();
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert!(rot.absorb_error(&err, &log, &cancel).await);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(log.tail(1)[0].contains("backing off 5s"));
    }

    #[tokio::test]
    async fn provider_suggested_backoff_wins() {
        let mut rot = AccountRotator::new(pool(&["a"]), 3).unwrap();
        let (_, backoff) = rot.record_error(&ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        });
        assert_eq!(backoff, Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn persisted_session_skips_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save("a", &session_for("a")).unwrap();

        let fake = FakeProvider::new();
        let mut rot = AccountRotator::new(pool(&["a"]), 3)
            .unwrap()
            .with_store(store.clone());
        let s = rot.ensure_session(&fake).await.unwrap().unwrap();
        assert_eq!(s, session_for("a"));
        assert!(fake.auth_calls().is_empty());

        // Rotation drops the stale file.
        for _ in 0..3 {
            rot.record_result(false);
        }
        assert!(store.load("a").unwrap().is_none());
    }

    #[test]
    fn session_store_sanitizes_file_names() {
        let store = SessionStore::new("/tmp/sessions");
        let path = store.path_for("../evil/name@x");
        assert_eq!(path.parent(), Some(Path::new("/tmp/sessions")));
        assert_eq!(path, PathBuf::from("/tmp/sessions/..%2Fevil%2Fname%40x.json"));
    }

    #[test]
    fn similar_identifiers_get_distinct_session_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert_ne!(store.path_for("a/b"), store.path_for("a_b"));

        store.save("a/b", &session_for("a/b")).unwrap();
        store.save("a_b", &session_for("a_b")).unwrap();
        assert_eq!(store.load("a/b").unwrap(), Some(session_for("a/b")));
        assert_eq!(store.load("a_b").unwrap(), Some(session_for("a_b")));
    }

    #[test]
    fn debug_output_redacts_secret() {
        let c = Credential::new("a", "hunter2");
        assert!(!format!("{c:?}").contains("hunter2"));
    }
}

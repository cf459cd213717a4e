use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{GroupId, GroupSnapshot, MemberId, Session},
    errors::ProviderError,
    provider::port::{GroupProvider, ProviderResult},
    utils::sleep_or_cancel,
};

/// Per-target slots older than this many intervals are forgotten.
const PRUNE_AFTER_INTERVALS: u32 = 4;
const PRUNE_THRESHOLD: usize = 256;

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound sends.
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same group or member.
    pub per_target_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(250),
            per_target_min_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Target {
    Group(GroupId),
    Member(MemberId),
}

/// Last granted send slot, globally and per target.
#[derive(Debug, Default)]
struct Pacer {
    last_global: Option<Instant>,
    last_by_target: HashMap<Target, Instant>,
}

impl Pacer {
    /// Grant the earliest slot that respects both spacings and record it.
    fn grant(&mut self, cfg: &ThrottleConfig, target: Target, now: Instant) -> Instant {
        let after_global = self.last_global.map(|t| t + cfg.global_min_interval);
        let after_target = self
            .last_by_target
            .get(&target)
            .map(|t| *t + cfg.per_target_min_interval);
        let slot = [Some(now), after_global, after_target]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(now);

        self.last_global = Some(slot);
        self.last_by_target.insert(target, slot);
        if self.last_by_target.len() > PRUNE_THRESHOLD {
            let horizon = cfg.per_target_min_interval * PRUNE_AFTER_INTERVALS;
            self.last_by_target
                .retain(|_, last| now.saturating_duration_since(*last) < horizon);
        }
        slot
    }
}

/// GroupProvider decorator that paces outbound sends.
///
/// Reads and authentication are not throttled. Sends are spaced per target so a
/// zero welcome delay still cannot turn into a burst against one thread. A
/// pending pacing wait is abandoned with [`ProviderError::Cancelled`] once the
/// shutdown token fires.
pub struct ThrottledProvider {
    inner: Arc<dyn GroupProvider>,
    cfg: ThrottleConfig,
    pacer: Mutex<Pacer>,
    shutdown: CancellationToken,
}

impl ThrottledProvider {
    pub fn new(inner: Arc<dyn GroupProvider>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            pacer: Mutex::new(Pacer::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    async fn pace(&self, target: Target) -> ProviderResult<()> {
        let now = Instant::now();
        let slot = {
            let mut pacer = self.pacer.lock().unwrap_or_else(|e| e.into_inner());
            pacer.grant(&self.cfg, target, now)
        };
        let wait = slot.saturating_duration_since(now);
        if wait.is_zero() {
            return Ok(());
        }
        if sleep_or_cancel(&self.shutdown, wait).await {
            Ok(())
        } else {
            Err(ProviderError::Cancelled)
        }
    }
}

#[async_trait]
impl GroupProvider for ThrottledProvider {
    async fn authenticate(&self, identifier: &str, secret: &str) -> ProviderResult<Session> {
        self.inner.authenticate(identifier, secret).await
    }

    async fn fetch_group(
        &self,
        session: &Session,
        group: &GroupId,
    ) -> ProviderResult<GroupSnapshot> {
        self.inner.fetch_group(session, group).await
    }

    async fn send_to_group(
        &self,
        session: &Session,
        group: &GroupId,
        text: &str,
    ) -> ProviderResult<()> {
        self.pace(Target::Group(group.clone())).await?;
        self.inner.send_to_group(session, group, text).await
    }

    async fn send_to_member(
        &self,
        session: &Session,
        member: &MemberId,
        text: &str,
    ) -> ProviderResult<()> {
        self.pace(Target::Member(member.clone())).await?;
        self.inner.send_to_member(session, member, text).await
    }

    async fn remove_member(
        &self,
        session: &Session,
        group: &GroupId,
        member: &MemberId,
    ) -> ProviderResult<()> {
        self.pace(Target::Group(group.clone())).await?;
        self.inner.remove_member(session, group, member).await
    }
}

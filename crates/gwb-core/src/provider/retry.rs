use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::sleep;

use crate::{
    domain::{GroupId, GroupSnapshot, MemberId, Session},
    provider::port::{GroupProvider, ProviderResult},
};

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Extra attempts after the first one, for transient network errors only.
    pub max_retries: usize,
    /// Backoff before retry `n` is `base_delay * n`.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// GroupProvider decorator that retries transient network failures in place.
///
/// Auth, rate-limit and rejection errors pass straight through so the worker
/// can apply its own policy to them.
pub struct RetryingProvider {
    inner: Arc<dyn GroupProvider>,
    cfg: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn GroupProvider>, cfg: RetryConfig) -> Self {
        Self { inner, cfg }
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = ProviderResult<T>> + Send,
    {
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempts < self.cfg.max_retries => {
                    attempts += 1;
                    tracing::debug!(attempt = attempts, error = %e, "retrying provider call");
                    let factor = u32::try_from(attempts).unwrap_or(u32::MAX);
                    sleep(self.cfg.base_delay.saturating_mul(factor)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl GroupProvider for RetryingProvider {
    async fn authenticate(&self, identifier: &str, secret: &str) -> ProviderResult<Session> {
        self.with_retry(|| self.inner.authenticate(identifier, secret))
            .await
    }

    async fn fetch_group(
        &self,
        session: &Session,
        group: &GroupId,
    ) -> ProviderResult<GroupSnapshot> {
        self.with_retry(|| self.inner.fetch_group(session, group))
            .await
    }

    async fn send_to_group(
        &self,
        session: &Session,
        group: &GroupId,
        text: &str,
    ) -> ProviderResult<()> {
        self.with_retry(|| self.inner.send_to_group(session, group, text))
            .await
    }

    async fn send_to_member(
        &self,
        session: &Session,
        member: &MemberId,
        text: &str,
    ) -> ProviderResult<()> {
        self.with_retry(|| self.inner.send_to_member(session, member, text))
            .await
    }

    async fn remove_member(
        &self,
        session: &Session,
        group: &GroupId,
        member: &MemberId,
    ) -> ProviderResult<()> {
        self.with_retry(|| self.inner.remove_member(session, group, member))
            .await
    }
}

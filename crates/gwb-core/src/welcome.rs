use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    accounts::AccountRotator,
    dedup::DedupCache,
    domain::{GroupId, Member},
    logging::ActivityLog,
    provider::GroupProvider,
    status::StatusBoard,
    utils::{render_template, sleep_or_cancel, truncate_text},
    Result,
};

/// Everything a welcome run touches besides the templates themselves.
pub struct DispatchEnv<'a> {
    pub provider: &'a dyn GroupProvider,
    pub rotator: &'a mut AccountRotator,
    pub dedup: &'a mut DedupCache,
    pub status: &'a StatusBoard,
    pub log: &'a ActivityLog,
    pub cancel: &'a CancellationToken,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WelcomeOutcome {
    /// Templates delivered to the group.
    pub sent: usize,
    /// Templates delivered directly to the member after the group send failed.
    pub via_fallback: usize,
    pub failed: usize,
    pub cancelled: bool,
    /// Whether `(group, member)` is now in the dedup cache.
    pub recorded: bool,
    pub skipped_duplicate: bool,
}

impl WelcomeOutcome {
    pub fn attempted(&self) -> usize {
        self.sent + self.via_fallback + self.failed
    }
}

/// Sends the templated welcome sequence to newly observed members.
#[derive(Clone, Debug)]
pub struct WelcomeDispatcher {
    templates: Vec<String>,
    delay: Duration,
}

impl WelcomeDispatcher {
    pub fn new(templates: Vec<String>, delay: Duration) -> Self {
        Self { templates, delay }
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    /// Attempt the whole template sequence once for `member`.
    ///
    /// A failed group send gets exactly one direct-to-member fallback; a failed
    /// fallback is logged and the sequence moves on. Once any template has been
    /// attempted the pair is written to the dedup cache, delivered or not.
    pub async fn welcome(
        &self,
        env: &mut DispatchEnv<'_>,
        group: &GroupId,
        member: &Member,
    ) -> Result<WelcomeOutcome> {
        let mut out = WelcomeOutcome::default();
        if env.dedup.contains(group, &member.id) {
            out.skipped_duplicate = true;
            out.recorded = true;
            return Ok(out);
        }

        let handle = member.display_handle();
        env.log
            .info(format!("New member detected: @{handle} in {group}"));

        let res = self.send_sequence(env, group, member, &mut out).await;

        if out.attempted() > 0 {
            if let Err(e) = env.dedup.insert(group, &member.id) {
                env.log
                    .warn(format!("Failed to persist welcomed cache entry: {e}"));
            }
            out.recorded = true;
        }
        res.map(|()| out)
    }

    async fn send_sequence(
        &self,
        env: &mut DispatchEnv<'_>,
        group: &GroupId,
        member: &Member,
        out: &mut WelcomeOutcome,
    ) -> Result<()> {
        let handle = member.display_handle();
        let total = self.templates.len();

        for (idx, template) in self.templates.iter().enumerate() {
            if env.cancel.is_cancelled() {
                out.cancelled = true;
                return Ok(());
            }

            let Some(session) = env.rotator.ensure_session(env.provider).await? else {
                env.log.warn(format!(
                    "No usable account; dropping {} remaining welcome message(s) for @{handle}",
                    total - idx
                ));
                out.failed += total - idx;
                if let Some(wait) = env.rotator.take_backoff() {
                    out.cancelled = !sleep_or_cancel(env.cancel, wait).await;
                }
                return Ok(());
            };

            let text = render_template(template, handle);
            match env.provider.send_to_group(&session, group, &text).await {
                Ok(()) => {
                    env.rotator.record_result(true);
                    env.status.record_welcome_sent();
                    out.sent += 1;
                    env.log.info(format!(
                        "Sent to @{handle} in {group}: {}",
                        truncate_text(&text, 80)
                    ));
                }
                Err(primary) => {
                    env.log
                        .warn(format!("Send error to @{handle} in {group}: {primary}"));
                    match env
                        .provider
                        .send_to_member(&session, &member.id, &text)
                        .await
                    {
                        Ok(()) => {
                            env.rotator.record_result(true);
                            env.status.record_welcome_sent();
                            out.via_fallback += 1;
                            env.log
                                .info(format!("Fallback sent to @{handle} directly"));
                        }
                        Err(fallback) => {
                            out.failed += 1;
                            env.log
                                .warn(format!("Fallback failed for @{handle}: {fallback}"));
                            if !env
                                .rotator
                                .absorb_error(&primary, env.log, env.cancel)
                                .await
                            {
                                out.cancelled = true;
                                return Ok(());
                            }
                        }
                    }
                }
            }
            env.rotator.publish(env.status);

            let is_last = idx + 1 == total;
            if !is_last && !sleep_or_cancel(env.cancel, self.delay).await {
                out.cancelled = true;
                return Ok(());
            }
        }
        Ok(())
    }
}

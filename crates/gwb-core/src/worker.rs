//! The polling worker: one sequential loop over all configured groups.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    accounts::AccountRotator,
    commands::{CommandContext, CommandInterpreter},
    config::Settings,
    dedup::DedupCache,
    domain::{GroupId, Member},
    errors::Error,
    logging::ActivityLog,
    membership::MembershipTracker,
    provider::GroupProvider,
    status::{now_str, StatusBoard},
    utils::sleep_or_cancel,
    welcome::{DispatchEnv, WelcomeDispatcher},
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    PoolExhausted,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "stop requested",
            Self::PoolExhausted => "all accounts failed to authenticate",
        }
    }
}

pub struct Worker {
    settings: Settings,
    provider: Arc<dyn GroupProvider>,
    rotator: AccountRotator,
    tracker: MembershipTracker,
    dedup: DedupCache,
    interpreter: CommandInterpreter,
    dispatcher: WelcomeDispatcher,
    status: StatusBoard,
    log: ActivityLog,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        settings: Settings,
        provider: Arc<dyn GroupProvider>,
        rotator: AccountRotator,
        dedup: DedupCache,
        status: StatusBoard,
        log: ActivityLog,
        cancel: CancellationToken,
    ) -> Self {
        let interpreter = CommandInterpreter::new(
            &settings.admins,
            settings.enable_commands,
            settings.enable_auto_reply,
        );
        let dispatcher = WelcomeDispatcher::new(settings.templates.clone(), settings.delay);
        Self {
            settings,
            provider,
            rotator,
            tracker: MembershipTracker::new(),
            dedup,
            interpreter,
            dispatcher,
            status,
            log,
            cancel,
        }
    }

    pub fn tracker(&self) -> &MembershipTracker {
        &self.tracker
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn rotator(&self) -> &AccountRotator {
        &self.rotator
    }

    /// Run until cancelled or until no account can authenticate.
    pub async fn run(mut self) -> StopReason {
        self.status.update(|st| {
            st.running = true;
            st.started_at = Some(now_str());
            st.stop_reason = None;
        });
        self.rotator.publish(&self.status);
        self.log.info(format!(
            "Configured groups: {}",
            self.settings
                .groups
                .iter()
                .map(|g| g.0.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
        self.log.info(format!(
            "Delay between messages: {:.1}s, poll interval: {:.1}s",
            self.settings.delay.as_secs_f64(),
            self.settings.poll_interval.as_secs_f64()
        ));

        let reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Requested;
            }
            self.status.update(|st| st.last_poll_at = Some(now_str()));

            if let Err(e) = self.run_cycle().await {
                self.log.error(format!("Worker stopping: {e}"));
                break StopReason::PoolExhausted;
            }

            if !sleep_or_cancel(&self.cancel, self.settings.poll_interval).await {
                break StopReason::Requested;
            }
        };

        self.status.update(|st| {
            st.running = false;
            st.stop_reason = Some(reason.as_str().to_string());
        });
        self.log.info(format!("Worker stopped: {}", reason.as_str()));
        reason
    }

    /// One pass over every group. Only a fatal account condition is returned;
    /// anything else is logged and the next group proceeds.
    pub async fn run_cycle(&mut self) -> Result<()> {
        let groups = self.settings.groups.clone();
        for group in &groups {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match self.process_group(group).await {
                Ok(()) => {}
                Err(e @ Error::PoolExhausted { .. }) => return Err(e),
                Err(e) => self.log.error(format!("Error in group {group}: {e}")),
            }
        }
        self.rotator.publish(&self.status);
        Ok(())
    }

    async fn wait_out_login_backoff(&mut self) {
        if let Some(wait) = self.rotator.take_backoff() {
            self.log
                .warn(format!("Login rate limited; backing off {}s", wait.as_secs()));
            sleep_or_cancel(&self.cancel, wait).await;
        }
    }

    async fn process_group(&mut self, group: &GroupId) -> Result<()> {
        let Some(session) = self.rotator.ensure_session(self.provider.as_ref()).await? else {
            self.log
                .warn(format!("No session available; skipping {group} this cycle"));
            self.wait_out_login_backoff().await;
            return Ok(());
        };

        let snapshot = match self.provider.fetch_group(&session, group).await {
            Ok(s) => {
                self.rotator.record_result(true);
                s
            }
            Err(e) => {
                self.log.warn(format!("Error reading thread {group}: {e}"));
                self.rotator
                    .absorb_error(&e, &self.log, &self.cancel)
                    .await;
                return Ok(());
            }
        };

        let new_members: Vec<Member> = if self.tracker.has_baseline(group) {
            self.tracker.poll(group, &snapshot.members)
        } else {
            let baseline = self.tracker.init_baseline(group, &snapshot.members);
            self.log.info(format!(
                "Baseline for {group}: {} member(s), none will be welcomed",
                baseline.len()
            ));
            Vec::new()
        };

        if self.interpreter.is_enabled() {
            let ctx = CommandContext {
                provider: self.provider.as_ref(),
                session: &session,
                status: &self.status,
                log: &self.log,
            };
            let state = self.tracker.state_mut(group);
            let report = self.interpreter.process(&ctx, state, &snapshot).await;
            for outcome in report.outcomes {
                match outcome {
                    Ok(()) => {
                        self.rotator.record_result(true);
                    }
                    Err(e) => {
                        if !self.rotator.absorb_error(&e, &self.log, &self.cancel).await {
                            return Ok(());
                        }
                    }
                }
            }
        }

        if self.dispatcher.templates().is_empty() {
            return Ok(());
        }

        for member in new_members {
            if self.cancel.is_cancelled() {
                break;
            }
            // A welcome may have rotated the account; compare against the one now active.
            if self
                .rotator
                .ensure_session(self.provider.as_ref())
                .await?
                .is_none()
            {
                self.log.warn(format!(
                    "No session available; remaining new members of {group} are not welcomed"
                ));
                self.wait_out_login_backoff().await;
                break;
            }
            if self.rotator.is_own(&member.id) {
                continue;
            }
            let mut env = DispatchEnv {
                provider: self.provider.as_ref(),
                rotator: &mut self.rotator,
                dedup: &mut self.dedup,
                status: &self.status,
                log: &self.log,
                cancel: &self.cancel,
            };
            let outcome = self.dispatcher.welcome(&mut env, group, &member).await?;
            if outcome.skipped_duplicate {
                tracing::debug!(group = %group, member = %member.id, "already welcomed");
            }
        }

        Ok(())
    }
}

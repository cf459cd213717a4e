//! In-thread text commands and auto-replies.
//!
//! Commands are a static table of tagged variants matched on the first token
//! of the normalized message text. Privileged commands run only for senders in
//! the admin set; everyone else is ignored without a reply.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Local;
use rand::seq::IndexedRandom;

use crate::{
    domain::{GroupId, GroupSnapshot, Member, MemberId, Message, MessageId, Session},
    errors::ProviderError,
    logging::ActivityLog,
    membership::{GroupState, Watermark},
    provider::GroupProvider,
    status::StatusBoard,
    utils::{normalize_text, truncate_text},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Help,
    Ping,
    Time,
    Members,
    Stats,
    Fun,
    SetAutoReply,
    ClearAutoReply,
    Kick,
}

#[derive(Clone, Copy, Debug)]
pub struct CommandDefinition {
    pub trigger: &'static str,
    pub privileged: bool,
    pub kind: CommandKind,
    pub usage: &'static str,
}

pub const COMMANDS: &[CommandDefinition] = &[
    CommandDefinition {
        trigger: "/help",
        privileged: false,
        kind: CommandKind::Help,
        usage: "/help - list commands",
    },
    CommandDefinition {
        trigger: "/ping",
        privileged: false,
        kind: CommandKind::Ping,
        usage: "/ping - check the bot is alive",
    },
    CommandDefinition {
        trigger: "/time",
        privileged: false,
        kind: CommandKind::Time,
        usage: "/time - current server time",
    },
    CommandDefinition {
        trigger: "/members",
        privileged: false,
        kind: CommandKind::Members,
        usage: "/members - member count",
    },
    CommandDefinition {
        trigger: "/stats",
        privileged: false,
        kind: CommandKind::Stats,
        usage: "/stats - bot statistics",
    },
    CommandDefinition {
        trigger: "/fun",
        privileged: false,
        kind: CommandKind::Fun,
        usage: "/fun - something random",
    },
    CommandDefinition {
        trigger: "/autoreply",
        privileged: true,
        kind: CommandKind::SetAutoReply,
        usage: "/autoreply <trigger> | <response> - add an auto-reply",
    },
    CommandDefinition {
        trigger: "/autoreply_clear",
        privileged: true,
        kind: CommandKind::ClearAutoReply,
        usage: "/autoreply_clear [trigger] - remove one or all auto-replies",
    },
    CommandDefinition {
        trigger: "/kick",
        privileged: true,
        kind: CommandKind::Kick,
        usage: "/kick <@handle|id> - remove a member",
    },
];

const FUN_PHRASES: &[&str] = &[
    "Why did the bot cross the thread? To welcome the other side.",
    "I would tell you a UDP joke, but you might not get it.",
    "Fun fact: this group gets better with every new member.",
    "There are 10 kinds of people: those who read binary and those who don't.",
    "Keep calm and stay in the chat.",
    "Loading witty remark... 99%... please hold.",
];

pub fn lookup(trigger: &str) -> Option<&'static CommandDefinition> {
    COMMANDS.iter().find(|c| c.trigger == trigger)
}

/// Split message text into the normalized trigger token and the raw argument text.
pub fn parse_command(text: &str) -> (String, String) {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim().to_string();
    (normalize_text(first), rest)
}

/// Registered trigger -> response pairs per group.
#[derive(Debug, Default)]
pub struct AutoReplies {
    per_group: HashMap<GroupId, BTreeMap<String, String>>,
}

impl AutoReplies {
    pub fn set(&mut self, group: &GroupId, trigger: &str, response: &str) {
        self.per_group
            .entry(group.clone())
            .or_default()
            .insert(normalize_text(trigger), response.trim().to_string());
    }

    pub fn clear(&mut self, group: &GroupId, trigger: Option<&str>) -> usize {
        let Some(map) = self.per_group.get_mut(group) else {
            return 0;
        };
        match trigger {
            Some(t) => usize::from(map.remove(&normalize_text(t)).is_some()),
            None => {
                let n = map.len();
                map.clear();
                n
            }
        }
    }

    pub fn response_for(&self, group: &GroupId, normalized: &str) -> Option<&str> {
        self.per_group
            .get(group)
            .and_then(|m| m.get(normalized))
            .map(String::as_str)
    }

    pub fn len(&self, group: &GroupId) -> usize {
        self.per_group.get(group).map(BTreeMap::len).unwrap_or(0)
    }
}

/// Collaborators a command run needs for one group.
pub struct CommandContext<'a> {
    pub provider: &'a dyn GroupProvider,
    pub session: &'a Session,
    pub status: &'a StatusBoard,
    pub log: &'a ActivityLog,
}

/// Outcome of one `process` call.
#[derive(Debug, Default)]
pub struct ProcessReport {
    pub scanned: usize,
    pub executed: Vec<CommandKind>,
    pub auto_replies: usize,
    pub denied: usize,
    /// Result of every provider call made, in order, for the account breaker.
    pub outcomes: Vec<Result<(), ProviderError>>,
}

#[derive(Debug)]
pub struct CommandInterpreter {
    admins: HashSet<String>,
    enable_commands: bool,
    enable_auto_reply: bool,
    auto_replies: AutoReplies,
}

impl CommandInterpreter {
    pub fn new(admins: &[String], enable_commands: bool, enable_auto_reply: bool) -> Self {
        Self {
            admins: admins
                .iter()
                .map(|a| normalize_handle(a))
                .filter(|a| !a.is_empty())
                .collect(),
            enable_commands,
            enable_auto_reply,
            auto_replies: AutoReplies::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enable_commands || self.enable_auto_reply
    }

    pub fn auto_replies(&self) -> &AutoReplies {
        &self.auto_replies
    }

    /// Handle messages newer than the group's watermark, oldest first.
    ///
    /// On first sight of a group the watermark is set to the newest message and
    /// nothing runs. The watermark always ends on the newest message seen.
    pub async fn process(
        &mut self,
        ctx: &CommandContext<'_>,
        state: &mut GroupState,
        snapshot: &GroupSnapshot,
    ) -> ProcessReport {
        let mut report = ProcessReport::default();
        let newest = snapshot.messages.iter().max_by_key(|m| m.ordinal);

        let Some(watermark) = state.command_watermark.clone() else {
            // An empty thread has nothing retroactive; its first message is new.
            state.command_watermark =
                Some(newest.map_or_else(empty_thread_watermark, watermark_of));
            return report;
        };

        let mut batch: Vec<&Message> = snapshot
            .messages
            .iter()
            .filter(|m| m.ordinal > watermark.ordinal)
            .collect();
        batch.sort_by_key(|m| m.ordinal);

        for msg in &batch {
            report.scanned += 1;
            if msg.sender_id == ctx.session.self_id {
                continue;
            }
            self.handle_message(ctx, &state.group_id, snapshot, msg, &mut report)
                .await;
        }

        if let Some(last) = batch.last() {
            if last.ordinal > watermark.ordinal {
                state.command_watermark = Some(watermark_of(last));
            }
        }

        report
    }

    async fn handle_message(
        &mut self,
        ctx: &CommandContext<'_>,
        group: &GroupId,
        snapshot: &GroupSnapshot,
        msg: &Message,
        report: &mut ProcessReport,
    ) {
        let normalized = normalize_text(&msg.text);
        if normalized.is_empty() {
            return;
        }

        if self.enable_auto_reply {
            if let Some(response) = self.auto_replies.response_for(group, &normalized) {
                let response = response.to_string();
                let res = ctx.provider.send_to_group(ctx.session, group, &response).await;
                if let Err(e) = &res {
                    ctx.log.warn(format!("Auto-reply in {group} failed: {e}"));
                } else {
                    report.auto_replies += 1;
                }
                report.outcomes.push(res);
            }
        }

        if !self.enable_commands {
            return;
        }

        let (trigger, args) = parse_command(&msg.text);
        let Some(def) = lookup(&trigger) else {
            return;
        };

        if def.privileged && !self.is_admin(&msg.sender_id, snapshot) {
            report.denied += 1;
            tracing::debug!(
                group = %group,
                sender = %msg.sender_id,
                trigger = def.trigger,
                "privileged command ignored"
            );
            return;
        }

        ctx.log.info(format!(
            "Command {} from {} in {group}",
            def.trigger, msg.sender_id
        ));
        let reply = self.execute(ctx, group, snapshot, def.kind, &args, report).await;
        report.executed.push(def.kind);

        if let Some(reply) = reply {
            let res = ctx.provider.send_to_group(ctx.session, group, &reply).await;
            if let Err(e) = &res {
                ctx.log.warn(format!(
                    "Reply to {} in {group} failed: {e}",
                    def.trigger
                ));
            }
            report.outcomes.push(res);
        }
    }

    async fn execute(
        &mut self,
        ctx: &CommandContext<'_>,
        group: &GroupId,
        snapshot: &GroupSnapshot,
        kind: CommandKind,
        args: &str,
        report: &mut ProcessReport,
    ) -> Option<String> {
        match kind {
            CommandKind::Help => Some(help_text()),
            CommandKind::Ping => Some("pong".to_string()),
            CommandKind::Time => Some(format!(
                "Time: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            )),
            CommandKind::Members => Some(format!("Members: {}", snapshot.members.len())),
            CommandKind::Stats => {
                let st = ctx.status.snapshot();
                Some(format!(
                    "Running since {} | welcomed today {} | total {} | account #{}",
                    st.started_at.as_deref().unwrap_or("-"),
                    st.today_welcomed,
                    st.total_welcomed,
                    st.active_account_index + 1,
                ))
            }
            CommandKind::Fun => {
                let phrase = FUN_PHRASES
                    .choose(&mut rand::rng())
                    .copied()
                    .unwrap_or("...");
                Some(phrase.to_string())
            }
            CommandKind::SetAutoReply => {
                let Some((trigger, response)) = args.split_once('|') else {
                    return Some("Usage: /autoreply <trigger> | <response>".to_string());
                };
                let (trigger, response) = (trigger.trim(), response.trim());
                if trigger.is_empty() || response.is_empty() {
                    return Some("Usage: /autoreply <trigger> | <response>".to_string());
                }
                self.auto_replies.set(group, trigger, response);
                Some(format!(
                    "Auto-reply set for \"{}\"",
                    truncate_text(&normalize_text(trigger), 40)
                ))
            }
            CommandKind::ClearAutoReply => {
                let trigger = Some(args.trim()).filter(|t| !t.is_empty());
                let removed = self.auto_replies.clear(group, trigger);
                let noun = if removed == 1 { "auto-reply" } else { "auto-replies" };
                Some(format!("Removed {removed} {noun}"))
            }
            CommandKind::Kick => {
                let target = args.trim();
                if target.is_empty() {
                    return Some("Usage: /kick <@handle|id>".to_string());
                }
                let Some(member) = find_member(snapshot, target) else {
                    return Some(format!("No member matching {target}"));
                };
                if member.id == ctx.session.self_id {
                    return None;
                }
                let res = ctx
                    .provider
                    .remove_member(ctx.session, group, &member.id)
                    .await;
                let reply = match &res {
                    Ok(()) => {
                        ctx.log
                            .info(format!("Removed @{} from {group}", member.display_handle()));
                        format!("Removed @{}", member.display_handle())
                    }
                    Err(e) => {
                        ctx.log.warn(format!(
                            "Could not remove @{} from {group}: {e}",
                            member.display_handle()
                        ));
                        format!("Could not remove @{}", member.display_handle())
                    }
                };
                report.outcomes.push(res);
                Some(reply)
            }
        }
    }

    fn is_admin(&self, sender: &MemberId, snapshot: &GroupSnapshot) -> bool {
        if self.admins.contains(&normalize_handle(&sender.0)) {
            return true;
        }
        snapshot
            .member(sender)
            .is_some_and(|m| self.admins.contains(&normalize_handle(&m.handle)))
    }
}

fn empty_thread_watermark() -> Watermark {
    Watermark {
        message_id: MessageId(String::new()),
        ordinal: i64::MIN,
    }
}

fn watermark_of(msg: &Message) -> Watermark {
    Watermark {
        message_id: msg.id.clone(),
        ordinal: msg.ordinal,
    }
}

fn normalize_handle(s: &str) -> String {
    normalize_text(s).trim_start_matches('@').to_string()
}

fn find_member<'a>(snapshot: &'a GroupSnapshot, target: &str) -> Option<&'a Member> {
    let wanted = normalize_handle(target);
    snapshot
        .members
        .iter()
        .find(|m| normalize_handle(&m.handle) == wanted)
        .or_else(|| snapshot.members.iter().find(|m| m.id.0 == target.trim()))
}

fn help_text() -> String {
    let mut lines = vec!["Commands:".to_string()];
    for c in COMMANDS {
        if c.privileged {
            lines.push(format!("{} (admin)", c.usage));
        } else {
            lines.push(c.usage.to_string());
        }
    }
    lines.join("\n")
}

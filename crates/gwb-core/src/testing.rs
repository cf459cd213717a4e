//! Scripted in-memory provider shared by unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{
    domain::{GroupId, GroupSnapshot, Member, MemberId, Message, MessageId, Session},
    errors::ProviderError,
    provider::port::{GroupProvider, ProviderResult},
};

#[derive(Default)]
struct FakeState {
    groups: HashMap<GroupId, GroupSnapshot>,
    next_ordinal: i64,
    auth_results: HashMap<String, VecDeque<ProviderResult<Session>>>,
    fetch_results: VecDeque<ProviderResult<GroupSnapshot>>,
    send_results: VecDeque<ProviderResult<()>>,
    member_send_results: VecDeque<ProviderResult<()>>,
    auth_calls: Vec<String>,
    group_sends: Vec<(GroupId, String, MemberId)>,
    member_sends: Vec<(MemberId, String)>,
    removed: Vec<(GroupId, MemberId)>,
}

/// Provider double: every call succeeds unless a scripted result is queued.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Session {
        session_for("bot")
    }

    pub fn set_members(&self, group: &str, members: &[(&str, &str)]) {
        let mut st = self.state.lock().unwrap();
        let snap = st.groups.entry(GroupId::from(group)).or_default();
        snap.members = members.iter().map(|(id, h)| Member::new(*id, *h)).collect();
    }

    /// Appends a message as the newest one in `group`.
    pub fn post(&self, group: &str, sender: &str, text: &str) -> MessageId {
        let mut st = self.state.lock().unwrap();
        st.next_ordinal += 1;
        let ordinal = st.next_ordinal;
        let id = MessageId(format!("m{ordinal}"));
        let snap = st.groups.entry(GroupId::from(group)).or_default();
        snap.messages.insert(
            0,
            Message {
                id: id.clone(),
                sender_id: MemberId::from(sender),
                text: text.to_string(),
                ordinal,
            },
        );
        id
    }

    pub fn push_auth_result(&self, identifier: &str, res: ProviderResult<Session>) {
        let mut st = self.state.lock().unwrap();
        st.auth_results
            .entry(identifier.to_string())
            .or_default()
            .push_back(res);
    }

    pub fn push_fetch_result(&self, res: ProviderResult<GroupSnapshot>) {
        self.state.lock().unwrap().fetch_results.push_back(res);
    }

    pub fn push_send_result(&self, res: ProviderResult<()>) {
        self.state.lock().unwrap().send_results.push_back(res);
    }

    pub fn push_member_send_result(&self, res: ProviderResult<()>) {
        self.state.lock().unwrap().member_send_results.push_back(res);
    }

    pub fn auth_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().auth_calls.clone()
    }

    /// Group sends as `(group, text, sending account)`, including failed attempts.
    pub fn group_sends(&self) -> Vec<(GroupId, String, MemberId)> {
        self.state.lock().unwrap().group_sends.clone()
    }

    pub fn group_texts(&self, group: &str) -> Vec<String> {
        self.group_sends()
            .into_iter()
            .filter(|(g, _, _)| g.0 == group)
            .map(|(_, t, _)| t)
            .collect()
    }

    pub fn member_sends(&self) -> Vec<(MemberId, String)> {
        self.state.lock().unwrap().member_sends.clone()
    }

    pub fn removed(&self) -> Vec<(GroupId, MemberId)> {
        self.state.lock().unwrap().removed.clone()
    }
}

pub fn session_for(identifier: &str) -> Session {
    Session {
        self_id: MemberId(format!("self-{identifier}")),
        blob: serde_json::json!({ "token": format!("tok-{identifier}") }),
    }
}

#[async_trait]
impl GroupProvider for FakeProvider {
    async fn authenticate(&self, identifier: &str, _secret: &str) -> ProviderResult<Session> {
        let mut st = self.state.lock().unwrap();
        st.auth_calls.push(identifier.to_string());
        st.auth_results
            .get_mut(identifier)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(session_for(identifier)))
    }

    async fn fetch_group(
        &self,
        _session: &Session,
        group: &GroupId,
    ) -> ProviderResult<GroupSnapshot> {
        let mut st = self.state.lock().unwrap();
        if let Some(res) = st.fetch_results.pop_front() {
            return res;
        }
        st.groups
            .get(group)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(group.to_string()))
    }

    async fn send_to_group(
        &self,
        session: &Session,
        group: &GroupId,
        text: &str,
    ) -> ProviderResult<()> {
        let mut st = self.state.lock().unwrap();
        st.group_sends
            .push((group.clone(), text.to_string(), session.self_id.clone()));
        st.send_results.pop_front().unwrap_or(Ok(()))
    }

    async fn send_to_member(
        &self,
        _session: &Session,
        member: &MemberId,
        text: &str,
    ) -> ProviderResult<()> {
        let mut st = self.state.lock().unwrap();
        st.member_sends.push((member.clone(), text.to_string()));
        st.member_send_results.pop_front().unwrap_or(Ok(()))
    }

    async fn remove_member(
        &self,
        _session: &Session,
        group: &GroupId,
        member: &MemberId,
    ) -> ProviderResult<()> {
        let mut st = self.state.lock().unwrap();
        st.removed.push((group.clone(), member.clone()));
        if let Some(snap) = st.groups.get_mut(group) {
            snap.members.retain(|m| &m.id != member);
        }
        Ok(())
    }
}

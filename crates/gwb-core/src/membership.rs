use std::collections::{HashMap, HashSet};

use crate::domain::{GroupId, Member, MemberId, MessageId};

/// Position of the newest message already scanned for commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Watermark {
    pub message_id: MessageId,
    pub ordinal: i64,
}

/// Per-group state owned by the worker for the length of a run.
#[derive(Clone, Debug)]
pub struct GroupState {
    pub group_id: GroupId,
    /// `None` until the first successful read establishes a baseline.
    pub known_member_ids: Option<HashSet<MemberId>>,
    pub command_watermark: Option<Watermark>,
}

impl GroupState {
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            known_member_ids: None,
            command_watermark: None,
        }
    }

    pub fn has_baseline(&self) -> bool {
        self.known_member_ids.is_some()
    }
}

/// Tracks the last-known member set of every monitored group.
///
/// The tracker never talks to the provider itself: the worker reads a group
/// once per cycle and hands the member list in, so a failed read simply means
/// the tracker is not called and its state stays as it was.
#[derive(Debug, Default)]
pub struct MembershipTracker {
    groups: HashMap<GroupId, GroupState>,
}

impl MembershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, group: &GroupId) -> Option<&GroupState> {
        self.groups.get(group)
    }

    pub fn state_mut(&mut self, group: &GroupId) -> &mut GroupState {
        self.groups
            .entry(group.clone())
            .or_insert_with(|| GroupState::new(group.clone()))
    }

    pub fn has_baseline(&self, group: &GroupId) -> bool {
        self.groups.get(group).is_some_and(GroupState::has_baseline)
    }

    /// Store `members` as the baseline. Nobody in the baseline is ever reported as new.
    pub fn init_baseline(&mut self, group: &GroupId, members: &[Member]) -> Vec<Member> {
        let state = self.state_mut(group);
        state.known_member_ids = Some(members.iter().map(|m| m.id.clone()).collect());
        members.to_vec()
    }

    /// Members present now but not at the previous observation, in provider order.
    ///
    /// The known set is replaced with `members` unconditionally, whatever happens
    /// to the welcomes sent for the returned members. Without a baseline this
    /// establishes one and returns nothing.
    pub fn poll(&mut self, group: &GroupId, members: &[Member]) -> Vec<Member> {
        let state = self.state_mut(group);
        let current: HashSet<MemberId> = members.iter().map(|m| m.id.clone()).collect();

        let new_members = match &state.known_member_ids {
            None => Vec::new(),
            Some(known) => {
                let mut seen = HashSet::new();
                members
                    .iter()
                    .filter(|m| !known.contains(&m.id) && seen.insert(m.id.clone()))
                    .cloned()
                    .collect()
            }
        };

        state.known_member_ids = Some(current);
        new_members
    }

    pub fn known_count(&self, group: &GroupId) -> usize {
        self.groups
            .get(group)
            .and_then(|s| s.known_member_ids.as_ref())
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[&str]) -> Vec<Member> {
        ids.iter().map(|id| Member::new(*id, format!("user{id}"))).collect()
    }

    #[test]
    fn baseline_members_are_never_new() {
        let mut t = MembershipTracker::new();
        let g = GroupId::from("g");
        t.init_baseline(&g, &members(&["1", "2", "3"]));
        assert!(t.poll(&g, &members(&["1", "2", "3"])).is_empty());
    }

    #[test]
    fn poll_reports_joins_in_provider_order() {
        let mut t = MembershipTracker::new();
        let g = GroupId::from("g");
        t.init_baseline(&g, &members(&["1", "2"]));

        let new = t.poll(&g, &members(&["5", "1", "4", "2"]));
        let ids: Vec<_> = new.iter().map(|m| m.id.0.as_str()).collect();
        assert_eq!(ids, vec!["5", "4"]);
    }

    #[test]
    fn poll_is_idempotent_without_membership_change() {
        let mut t = MembershipTracker::new();
        let g = GroupId::from("g");
        t.init_baseline(&g, &members(&["1"]));

        assert_eq!(t.poll(&g, &members(&["1", "2"])).len(), 1);
        assert!(t.poll(&g, &members(&["1", "2"])).is_empty());
    }

    #[test]
    fn leavers_who_rejoin_are_new_again() {
        let mut t = MembershipTracker::new();
        let g = GroupId::from("g");
        t.init_baseline(&g, &members(&["1", "2"]));

        assert!(t.poll(&g, &members(&["1"])).is_empty());
        assert_eq!(t.poll(&g, &members(&["1", "2"])).len(), 1);
    }

    #[test]
    fn poll_without_baseline_only_establishes_one() {
        let mut t = MembershipTracker::new();
        let g = GroupId::from("g");
        assert!(!t.has_baseline(&g));
        assert!(t.poll(&g, &members(&["1", "2"])).is_empty());
        assert!(t.has_baseline(&g));
        assert_eq!(t.known_count(&g), 2);
    }

    #[test]
    fn groups_are_tracked_independently() {
        let mut t = MembershipTracker::new();
        let a = GroupId::from("a");
        let b = GroupId::from("b");
        t.init_baseline(&a, &members(&["1"]));
        t.init_baseline(&b, &members(&["2"]));

        assert_eq!(t.poll(&a, &members(&["1", "2"])).len(), 1);
        assert!(t.poll(&b, &members(&["2"])).is_empty());
    }
}

use async_trait::async_trait;

use crate::{
    domain::{GroupId, GroupSnapshot, MemberId, Session},
    errors::ProviderError,
};

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Port for the upstream message-thread service.
///
/// Implementations translate their wire format into the value types in
/// [`crate::domain`]. Messages in a [`GroupSnapshot`] are newest first.
#[async_trait]
pub trait GroupProvider: Send + Sync {
    async fn authenticate(&self, identifier: &str, secret: &str) -> ProviderResult<Session>;

    async fn fetch_group(&self, session: &Session, group: &GroupId)
        -> ProviderResult<GroupSnapshot>;

    async fn send_to_group(&self, session: &Session, group: &GroupId, text: &str)
        -> ProviderResult<()>;

    async fn send_to_member(&self, session: &Session, member: &MemberId, text: &str)
        -> ProviderResult<()>;

    async fn remove_member(
        &self,
        session: &Session,
        group: &GroupId,
        member: &MemberId,
    ) -> ProviderResult<()>;
}

//! HTTP bridge adapter.
//!
//! Talks JSON to a sidecar service that owns the actual messaging-platform
//! client. Every call carries the session blob returned by `/login`.

use std::time::Duration;

use async_trait::async_trait;
use gwb_core::{
    domain::{GroupId, GroupSnapshot, Member, MemberId, Message, MessageId, Session},
    errors::{Error, ProviderError},
    provider::{GroupProvider, ProviderResult},
    Result,
};
use reqwest::{header::RETRY_AFTER, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_LIMIT: usize = 200;

#[derive(Clone, Debug)]
pub struct BridgeProvider {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl BridgeProvider {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::External(format!("bridge client build error: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send<B>(&self, path: &str, body: &B) -> ProviderResult<reqwest::Response>
    where
        B: Serialize + ?Sized + Sync,
    {
        let mut req = self.http.post(self.url(path)).json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(
                resp.headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(%status, path, "bridge call failed");
            return Err(classify(status, retry_after, &body));
        }
        Ok(resp)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> ProviderResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.send(path, body)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Other(format!("bridge json error: {e}")))
    }

    /// Like [`post`](Self::post) but the response body is ignored.
    async fn post_unit<B>(&self, path: &str, body: &B) -> ProviderResult<()>
    where
        B: Serialize + ?Sized + Sync,
    {
        self.send(path, body).await.map(drop)
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    ProviderError::Network(format!("bridge request error: {e}"))
}

/// Map a non-success HTTP status to a provider error.
pub fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let detail = format!(
        "{status} {}",
        body.chars().take(ERROR_BODY_LIMIT).collect::<String>()
    )
    .trim()
    .to_string();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        StatusCode::NOT_FOUND => ProviderError::NotFound(detail),
        StatusCode::REQUEST_TIMEOUT => ProviderError::Network(detail),
        s if s.is_server_error() => ProviderError::Network(detail),
        s if s.is_client_error() => ProviderError::Rejected(detail),
        _ => ProviderError::Other(detail),
    }
}

/// `Retry-After` in delay-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    secret: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    self_id: String,
    #[serde(default)]
    session: serde_json::Value,
}

#[derive(Serialize)]
struct SessionRequest<'a> {
    session: &'a serde_json::Value,
}

#[derive(Serialize)]
struct TextRequest<'a> {
    session: &'a serde_json::Value,
    text: &'a str,
}

#[derive(Serialize)]
struct RemoveRequest<'a> {
    session: &'a serde_json::Value,
    member_id: &'a str,
}

#[derive(Deserialize)]
struct SnapshotDto {
    #[serde(default)]
    members: Vec<MemberDto>,
    #[serde(default)]
    messages: Vec<MessageDto>,
}

#[derive(Deserialize)]
struct MemberDto {
    id: String,
    #[serde(default, alias = "username")]
    handle: Option<String>,
}

#[derive(Deserialize)]
struct MessageDto {
    id: String,
    sender_id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(alias = "timestamp")]
    ordinal: i64,
}

impl From<SnapshotDto> for GroupSnapshot {
    fn from(dto: SnapshotDto) -> Self {
        let members = dto
            .members
            .into_iter()
            .map(|m| Member::new(m.id, m.handle.unwrap_or_default()))
            .collect();
        let mut messages: Vec<Message> = dto
            .messages
            .into_iter()
            .map(|m| Message {
                id: MessageId(m.id),
                sender_id: MemberId(m.sender_id),
                text: m.text.unwrap_or_default(),
                ordinal: m.ordinal,
            })
            .collect();
        // Core expects newest first regardless of bridge ordering.
        messages.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
        GroupSnapshot { members, messages }
    }
}

fn group_path(group: &GroupId, tail: &str) -> String {
    format!("/groups/{}/{tail}", urlencoding::encode(&group.0))
}

#[async_trait]
impl GroupProvider for BridgeProvider {
    async fn authenticate(&self, identifier: &str, secret: &str) -> ProviderResult<Session> {
        let resp: LoginResponse = self
            .post("/login", &LoginRequest { identifier, secret })
            .await?;
        if resp.self_id.trim().is_empty() {
            return Err(ProviderError::Auth("bridge returned no account id".to_string()));
        }
        Ok(Session {
            self_id: MemberId(resp.self_id),
            blob: resp.session,
        })
    }

    async fn fetch_group(&self, session: &Session, group: &GroupId) -> ProviderResult<GroupSnapshot> {
        let dto: SnapshotDto = self
            .post(
                &group_path(group, "snapshot"),
                &SessionRequest {
                    session: &session.blob,
                },
            )
            .await?;
        Ok(dto.into())
    }

    async fn send_to_group(&self, session: &Session, group: &GroupId, text: &str) -> ProviderResult<()> {
        self.post_unit(
            &group_path(group, "messages"),
            &TextRequest {
                session: &session.blob,
                text,
            },
        )
        .await
    }

    async fn send_to_member(&self, session: &Session, member: &MemberId, text: &str) -> ProviderResult<()> {
        self.post_unit(
            &format!("/members/{}/messages", urlencoding::encode(&member.0)),
            &TextRequest {
                session: &session.blob,
                text,
            },
        )
        .await
    }

    async fn remove_member(
        &self,
        session: &Session,
        group: &GroupId,
        member: &MemberId,
    ) -> ProviderResult<()> {
        self.post_unit(
            &group_path(group, "remove"),
            &RemoveRequest {
                session: &session.blob,
                member_id: &member.0,
            },
        )
        .await
    }
}

//! Consultation bookkeeping collaborator: decides whether a room id may be
//! opened and records when a session starts and ends.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("bookkeeping request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bookkeeping service returned {0}")]
    Status(StatusCode),
    #[error("invalid bookkeeping base url: {0}")]
    BaseUrl(String),
    #[error("room id {0:?} cannot be addressed")]
    RoomId(String),
}

#[async_trait]
pub trait RoomAuthority: Send + Sync {
    /// Whether a consultation with this room id exists and may be joined.
    async fn may_exist(&self, room_id: &str) -> Result<bool, AuthorityError>;
    async fn mark_started(&self, room_id: &str) -> Result<(), AuthorityError>;
    async fn mark_ended(&self, room_id: &str) -> Result<(), AuthorityError>;
}

/// Accepts every room id; used when no bookkeeping service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllRooms;

#[async_trait]
impl RoomAuthority for AllowAllRooms {
    async fn may_exist(&self, _room_id: &str) -> Result<bool, AuthorityError> {
        Ok(true)
    }

    async fn mark_started(&self, _room_id: &str) -> Result<(), AuthorityError> {
        Ok(())
    }

    async fn mark_ended(&self, _room_id: &str) -> Result<(), AuthorityError> {
        Ok(())
    }
}

/// Talks to the consultation service over HTTP:
/// `GET {base}/rooms/{id}`, `POST {base}/rooms/{id}/start` and
/// `POST {base}/rooms/{id}/end`.
#[derive(Debug, Clone)]
pub struct HttpRoomAuthority {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpRoomAuthority {
    pub fn new(base_url: &str) -> Result<Self, AuthorityError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        let base_url =
            Url::parse(base_url).map_err(|err| AuthorityError::BaseUrl(err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(AuthorityError::BaseUrl(base_url.to_string()));
        }
        Ok(Self { client, base_url })
    }

    /// `{base}/rooms/{id}[/{action}]` with the id encoded as one segment.
    fn room_url(&self, room_id: &str, action: Option<&str>) -> Result<Url, AuthorityError> {
        if room_id.is_empty() || room_id == "." || room_id == ".." {
            return Err(AuthorityError::RoomId(room_id.to_string()));
        }
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AuthorityError::BaseUrl(self.base_url.to_string()))?;
            segments.pop_if_empty().push("rooms").push(room_id);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        Ok(url)
    }

    async fn post(&self, url: Url) -> Result<(), AuthorityError> {
        let response = self.client.post(url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AuthorityError::Status(response.status()))
        }
    }
}

#[async_trait]
impl RoomAuthority for HttpRoomAuthority {
    async fn may_exist(&self, room_id: &str) -> Result<bool, AuthorityError> {
        let response = self.client.get(self.room_url(room_id, None)?).send().await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::GONE => Ok(false),
            status => Err(AuthorityError::Status(status)),
        }
    }

    async fn mark_started(&self, room_id: &str) -> Result<(), AuthorityError> {
        self.post(self.room_url(room_id, Some("start"))?).await
    }

    async fn mark_ended(&self, room_id: &str) -> Result<(), AuthorityError> {
        self.post(self.room_url(room_id, Some("end"))?).await
    }
}

//! Remote form gateway for Kobo Toolbox.

mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{GeoPoint, PullPhase, Submission};
use crate::util::parse_timestamp_millis;

pub use client::{KoboClient, KoboConfig};

/// Failures talking to the remote form service
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Network failure, timeout, or 5xx; safe to retry
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),
    /// 4xx response; retrying will not help
    #[error("Upstream rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    /// Response did not have the expected shape
    #[error("Invalid upstream payload: {0}")]
    InvalidPayload(String),
}

impl GatewayError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// A submission as stored by the remote service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteSubmission {
    /// Remote `_id`
    pub remote_id: i64,
    /// Remote `_uuid` (instance id without the `uuid:` prefix)
    pub instance_uuid: Option<String>,
    /// `_submission_time` (Unix ms)
    pub submission_time: i64,
    /// Latest remote modification (Unix ms); `_last_edited` when present
    pub updated_at: i64,
    pub submitted_by: Option<String>,
    pub location: Option<GeoPoint>,
    /// Full raw record, system fields included
    pub answers: Map<String, Value>,
}

impl RemoteSubmission {
    /// Read one entry of the `/data/` results array.
    pub fn from_value(value: Value) -> GatewayResult<Self> {
        let Value::Object(answers) = value else {
            return Err(GatewayError::InvalidPayload(
                "submission must be a JSON object".to_string(),
            ));
        };

        let remote_id = answers
            .get("_id")
            .and_then(|id| id.as_i64().or_else(|| id.as_str()?.parse().ok()))
            .ok_or_else(|| GatewayError::InvalidPayload("submission is missing `_id`".to_string()))?;
        let submission_time = answers
            .get("_submission_time")
            .and_then(Value::as_str)
            .and_then(parse_timestamp_millis)
            .ok_or_else(|| {
                GatewayError::InvalidPayload(format!(
                    "submission {remote_id} has no parseable `_submission_time`"
                ))
            })?;
        let updated_at = answers
            .get("_last_edited")
            .and_then(Value::as_str)
            .and_then(parse_timestamp_millis)
            .map_or(submission_time, |edited| edited.max(submission_time));
        let instance_uuid = answers
            .get("_uuid")
            .and_then(Value::as_str)
            .or_else(|| answers.get("meta/instanceID").and_then(Value::as_str))
            .map(|uuid| uuid.trim_start_matches("uuid:").to_string())
            .filter(|uuid| !uuid.is_empty());
        let submitted_by = answers
            .get("_submitted_by")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|name| !name.is_empty());
        let location = answers.get("_geolocation").and_then(GeoPoint::from_answer);

        Ok(Self {
            remote_id,
            instance_uuid,
            submission_time,
            updated_at,
            submitted_by,
            location,
            answers,
        })
    }
}

/// One page of remote submissions
#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub results: Vec<RemoteSubmission>,
    /// Entries on this page that could not be read and were dropped
    pub skipped: u32,
    /// Total matching records reported by the remote, if any
    pub count: Option<u64>,
    pub has_more: bool,
}

/// Account that owns the API token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KoboUser {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Outbound calls to the remote form service.
#[async_trait]
pub trait FormGateway: Send + Sync {
    /// Raw survey assets visible to the token (list view, content not expanded).
    async fn list_forms(&self) -> GatewayResult<Vec<Value>>;

    /// Full asset for one form; `None` when the remote does not know it.
    async fn get_form(&self, form_id: &str) -> GatewayResult<Option<Value>>;

    /// Submissions whose phase timestamp (`_submission_time` or
    /// `_last_edited`) is at or after `since_millis`, ascending by
    /// `(timestamp, _id)`, skipping the first `start`. The edited phase only
    /// returns records that were edited at least once.
    async fn fetch_submissions(
        &self,
        form_id: &str,
        phase: PullPhase,
        since_millis: i64,
        start: u32,
        limit: u32,
    ) -> GatewayResult<RemotePage>;

    /// Deliver a local submission; returns the remote id it was assigned.
    async fn push_submission(&self, submission: &Submission) -> GatewayResult<i64>;

    /// Deliver a local submission in a single attempt, for callers that are
    /// waiting on the result.
    async fn push_submission_once(&self, submission: &Submission) -> GatewayResult<i64> {
        self.push_submission(submission).await
    }

    /// Identify the token owner; doubles as a connectivity check.
    async fn current_user(&self) -> GatewayResult<KoboUser>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_submission_reads_system_fields() {
        let remote = RemoteSubmission::from_value(json!({
            "_id": 401,
            "_uuid": "5e0c8f3a-0000-4000-8000-000000000001",
            "_submission_time": "2024-03-01T08:00:00",
            "_last_edited": "2024-03-02T09:30:00",
            "_submitted_by": "ranger1",
            "_geolocation": [-1.2, 36.8],
            "species": "lion"
        }))
        .unwrap();

        assert_eq!(remote.remote_id, 401);
        assert_eq!(remote.submission_time, 1_709_280_000_000);
        assert!(remote.updated_at > remote.submission_time);
        assert_eq!(remote.submitted_by.as_deref(), Some("ranger1"));
        assert!(remote.location.is_some());
        assert_eq!(remote.answers["species"], json!("lion"));
    }

    #[test]
    fn remote_submission_requires_id_and_time() {
        assert!(RemoteSubmission::from_value(json!({"_submission_time": "2024-03-01T08:00:00"})).is_err());
        assert!(RemoteSubmission::from_value(json!({"_id": 1})).is_err());
        assert!(RemoteSubmission::from_value(json!("nope")).is_err());
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(GatewayError::Unavailable("timeout".into()).is_retryable());
        assert!(!GatewayError::Rejected {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!GatewayError::InvalidPayload("x".into()).is_retryable());
    }
}

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{FormGateway, GatewayError, GatewayResult, KoboUser, RemotePage, RemoteSubmission};
use crate::models::{PullPhase, Submission};
use crate::util::{compact_text, format_remote_timestamp, sanitize};

const RETRY_MIN_DELAY: Duration = Duration::from_millis(250);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Connection settings for the Kobo API
#[derive(Clone, PartialEq, Eq)]
pub struct KoboConfig {
    pub server_url: String,
    pub api_token: String,
    pub timeout: Duration,
    /// Extra attempts after a retryable failure
    pub max_retries: u32,
}

impl fmt::Debug for KoboConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("KoboConfig")
            .field("server_url", &self.server_url)
            .field("api_token", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// reqwest-backed [`FormGateway`]
#[derive(Debug, Clone)]
pub struct KoboClient {
    client: reqwest::Client,
    config: KoboConfig,
}

impl KoboClient {
    pub fn new(config: KoboConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("wildwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| GatewayError::Unavailable(sanitize(&error)))?;
        Ok(Self { client, config })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> GatewayResult<Value> {
        self.request_with_retries(method, path, query, body, self.config.max_retries)
            .await
    }

    /// Send a request, retrying `Unavailable` failures with jittered
    /// exponential backoff up to `retries` extra attempts.
    async fn request_with_retries(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        retries: u32,
    ) -> GatewayResult<Value> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(RETRY_MIN_DELAY)
            .with_max_delay(RETRY_MAX_DELAY)
            .with_max_times(usize::try_from(retries).unwrap_or(usize::MAX))
            .with_jitter();

        (|| self.send_once(method.clone(), path, query, body))
            .retry(backoff)
            .when(GatewayError::is_retryable)
            .notify(|error: &GatewayError, delay: Duration| {
                tracing::warn!(
                    path,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Kobo request failed, retrying: {error}"
                );
            })
            .await
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> GatewayResult<Value> {
        let url = format!(
            "{}/{}",
            self.config.server_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        tracing::debug!(%method, %url, "Kobo API request");

        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", format!("Token {}", self.config.api_token))
            .header("Accept", "application/json")
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                GatewayError::Unavailable(format!(
                    "request timed out after {}s",
                    self.config.timeout.as_secs()
                ))
            } else {
                GatewayError::Unavailable(format!("request failed: {}", sanitize(&error)))
            }
        })?;

        let status = response.status();
        tracing::debug!(status = status.as_u16(), "Kobo API response");
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        if status.is_success() {
            return response.json::<Value>().await.map_err(|error| {
                GatewayError::InvalidPayload(format!("JSON parse failed: {}", sanitize(&error)))
            });
        }

        let body = response.text().await.unwrap_or_default();
        let message = parse_api_error(&body);
        if status.is_client_error() {
            Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(GatewayError::Unavailable(format!("{message} (HTTP {})", status.as_u16())))
        }
    }

    async fn post_submission(&self, submission: &Submission, retries: u32) -> GatewayResult<i64> {
        let mut payload = submission.answers.clone();
        payload.insert(
            "meta".to_string(),
            json!({"instanceID": submission.instance_id()}),
        );
        let body = json!({
            "submission": payload,
            "meta/instanceID": submission.instance_id(),
        });

        let response = self
            .request_with_retries(
                Method::POST,
                &format!("/api/v2/assets/{}/submissions/", submission.form_id),
                &[],
                Some(&body),
                retries,
            )
            .await?;

        let remote_id = ["_id", "id"]
            .iter()
            .find_map(|key| {
                let id = response.get(*key)?;
                id.as_i64().or_else(|| id.as_str()?.parse().ok())
            })
            .ok_or_else(|| {
                GatewayError::InvalidPayload("submission response did not include an id".to_string())
            })?;
        tracing::info!(
            form_id = submission.form_id.as_str(),
            submission_id = %submission.id,
            remote_id,
            "Pushed submission to Kobo"
        );
        Ok(remote_id)
    }
}

#[async_trait]
impl FormGateway for KoboClient {
    async fn list_forms(&self) -> GatewayResult<Vec<Value>> {
        let payload = self
            .request(
                Method::GET,
                "/api/v2/assets/",
                &[
                    ("asset_type", "survey".to_string()),
                    ("limit", "100".to_string()),
                ],
                None,
            )
            .await?;
        let forms = results_array(payload)?;
        tracing::info!(count = forms.len(), "Retrieved forms from Kobo");
        Ok(forms)
    }

    async fn get_form(&self, form_id: &str) -> GatewayResult<Option<Value>> {
        match self
            .request(Method::GET, &format!("/api/v2/assets/{form_id}/"), &[], None)
            .await
        {
            Ok(asset) => Ok(Some(asset)),
            Err(GatewayError::Rejected { status: 404, .. }) => {
                tracing::warn!(form_id, "Form not found on Kobo");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    async fn fetch_submissions(
        &self,
        form_id: &str,
        phase: PullPhase,
        since_millis: i64,
        start: u32,
        limit: u32,
    ) -> GatewayResult<RemotePage> {
        let field = match phase {
            PullPhase::Submitted => "_submission_time",
            PullPhase::Edited => "_last_edited",
        };
        let mut query = vec![
            ("format", "json".to_string()),
            // Key order matters here; `json!` would sort `_id` first
            ("sort", format!(r#"{{"{field}":1,"_id":1}}"#)),
            ("start", start.to_string()),
            ("limit", limit.to_string()),
        ];
        let filter = match phase {
            PullPhase::Submitted if since_millis <= 0 => None,
            PullPhase::Submitted => Some(
                json!({field: {"$gte": format_remote_timestamp(since_millis)}}),
            ),
            PullPhase::Edited if since_millis <= 0 => Some(json!({field: {"$ne": null}})),
            PullPhase::Edited => Some(
                json!({field: {"$ne": null, "$gte": format_remote_timestamp(since_millis)}}),
            ),
        };
        if let Some(filter) = filter {
            query.push(("query", filter.to_string()));
        }

        let payload = self
            .request(
                Method::GET,
                &format!("/api/v2/assets/{form_id}/data/"),
                &query,
                None,
            )
            .await?;
        let count = payload.get("count").and_then(Value::as_u64);
        let has_next = payload.get("next").is_some_and(|next| !next.is_null());
        let raw = results_array(payload)?;
        let received = raw.len() as u64;

        let mut results = Vec::with_capacity(raw.len());
        let mut skipped: u32 = 0;
        for value in raw {
            match RemoteSubmission::from_value(value) {
                Ok(remote) => results.push(remote),
                Err(error) => {
                    skipped = skipped.saturating_add(1);
                    tracing::warn!(form_id, phase = phase.as_str(), "Skipping unreadable submission: {error}");
                }
            }
        }

        let fetched_through = u64::from(start) + received;
        let has_more = has_next || count.is_some_and(|count| count > fetched_through);
        tracing::debug!(
            form_id,
            phase = phase.as_str(),
            start,
            fetched = results.len(),
            skipped,
            has_more,
            "Fetched submissions page"
        );
        Ok(RemotePage {
            results,
            skipped,
            count,
            has_more,
        })
    }

    async fn push_submission(&self, submission: &Submission) -> GatewayResult<i64> {
        self.post_submission(submission, self.config.max_retries).await
    }

    async fn push_submission_once(&self, submission: &Submission) -> GatewayResult<i64> {
        self.post_submission(submission, 0).await
    }

    async fn current_user(&self) -> GatewayResult<KoboUser> {
        let payload = self.request(Method::GET, "/api/v2/me/", &[], None).await?;
        serde_json::from_value(payload)
            .map_err(|error| GatewayError::InvalidPayload(sanitize(&error)))
    }
}

fn results_array(payload: Value) -> GatewayResult<Vec<Value>> {
    match payload {
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(GatewayError::InvalidPayload(
                "response did not include a `results` array".to_string(),
            )),
        },
        Value::Array(items) => Ok(items),
        _ => Err(GatewayError::InvalidPayload(
            "response was not a JSON object".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct KoboErrorBody {
    detail: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

/// Human-readable message from an error body; the HTTP status is carried
/// separately by the caller.
fn parse_api_error(body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<KoboErrorBody>(body) {
        if let Some(message) = payload.detail.or(payload.message).or(payload.error) {
            return message.trim().to_string();
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed
    }
}

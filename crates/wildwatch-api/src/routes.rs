use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use wildwatch_core::db::{SubmissionPatch, SubmissionQuery, DEFAULT_QUERY_LIMIT};
use wildwatch_core::forms::{extract_location, normalize_answers, parse_form, validate_answers};
use wildwatch_core::kobo::GatewayError;
use wildwatch_core::models::{
    BoundingBox, FormDefinition, FormSummary, GeoPoint, SyncConflict, SyncCursor, SyncRun,
    SyncStatus,
};
use wildwatch_core::services::DatabaseService;
use wildwatch_core::sync::{PushOutcome, SyncCoordinator, SyncLease, SyncMode};
use wildwatch_core::util::parse_timestamp_millis;
use wildwatch_core::{Submission, SubmissionId};

use crate::auth::{extract_bearer_token, AuthenticatedUser, JwtVerifier, TokenVerifier};
use crate::config::{AllowedOrigins, AppConfig};
use crate::error::{ApiResponse, AppError};
use crate::extract::{ApiJson, ApiPath, ApiQuery};

const MAX_PAGE_LIMIT: usize = 100;
const DEFAULT_RADIUS_KM: f64 = 10.0;
const RECENT_RUNS: usize = 10;
const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

type ApiResult<T> = Result<ApiResponse<T>, AppError>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    db: DatabaseService,
    coordinator: Arc<SyncCoordinator>,
    verifier: Arc<dyn TokenVerifier>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        db: DatabaseService,
        coordinator: Arc<SyncCoordinator>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            verifier: Arc::new(JwtVerifier::from_config(&config)),
            config,
            db,
            coordinator,
            shutdown,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/forms", get(list_forms))
        .route("/forms/", get(list_forms))
        .route("/forms/{form_id}", get(get_form))
        .route(
            "/submissions",
            get(list_submissions).post(create_submission),
        )
        .route(
            "/submissions/",
            get(list_submissions).post(create_submission),
        )
        .route(
            "/submissions/{id}",
            get(get_submission).patch(update_submission),
        )
        .route("/sync/conflicts", get(list_conflicts))
        .route("/sync/{form_id}", get(sync_status).post(trigger_sync))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/health/", get(health))
        .route("/health/database", get(health_database))
        .route("/health/kobo", get(health_kobo))
        .route("/webhooks/kobo/{form_id}", post(kobo_webhook));

    let cors = match &state.config.allowed_origins {
        AllowedOrigins::Any => CorsLayer::new().allow_origin(Any),
        AllowedOrigins::List(origins) => CorsLayer::new().allow_origin(AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )),
    }
    .allow_headers(Any)
    .allow_methods(Any)
    .expose_headers([HeaderName::from_static("x-request-id")]);

    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .nest("/api/v1", public_routes.merge(protected_routes))
        .fallback(not_found)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.verifier.verify(token)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn not_found() -> AppError {
    AppError::not_found("Route not found")
}

#[derive(Debug, Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
    api: &'static str,
    kobo_server: String,
}

async fn service_info(State(state): State<AppState>) -> ApiResponse<ServiceInfo> {
    ApiResponse::ok(
        "Wildwatch incident reporting API",
        ServiceInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            api: "/api/v1",
            kobo_server: state.config.core.kobo.server_url.clone(),
        },
    )
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    version: &'static str,
}

async fn health() -> ApiResponse<HealthResponse> {
    ApiResponse::ok(
        "Service is healthy",
        HealthResponse {
            status: "healthy",
            timestamp: Utc::now().timestamp(),
            version: env!("CARGO_PKG_VERSION"),
        },
    )
}

#[derive(Debug, Serialize)]
struct DatabaseHealth {
    status: &'static str,
    remote: bool,
    forms: i64,
    submissions: i64,
}

async fn health_database(State(state): State<AppState>) -> ApiResult<DatabaseHealth> {
    state.db.ping().await?;
    let forms = state.db.count_forms().await?;
    let submissions = state.db.count_submissions().await?;
    Ok(ApiResponse::ok(
        "Database connection is healthy",
        DatabaseHealth {
            status: "connected",
            remote: state.db.is_remote().await,
            forms,
            submissions,
        },
    ))
}

#[derive(Debug, Serialize)]
struct KoboHealth {
    status: &'static str,
    server_url: String,
    username: String,
}

async fn health_kobo(State(state): State<AppState>) -> ApiResult<KoboHealth> {
    let user = state.coordinator.gateway().current_user().await?;
    Ok(ApiResponse::ok(
        "Kobo connection is healthy",
        KoboHealth {
            status: "connected",
            server_url: state.config.core.kobo.server_url.clone(),
            username: user.username,
        },
    ))
}

/// Fetch, parse, and cache one form. `None` when Kobo does not know it.
async fn refresh_form(state: &AppState, form_id: &str) -> Result<Option<FormDefinition>, AppError> {
    let Some(asset) = state.coordinator.gateway().get_form(form_id).await? else {
        return Ok(None);
    };
    let form = parse_form(&asset)?;
    state.db.save_form(&form).await?;
    Ok(Some(form))
}

/// Cached definition, fetched from Kobo on a miss. A form Kobo cannot be
/// reached for is treated as unknown so submissions still land locally.
async fn resolve_form(state: &AppState, form_id: &str) -> Result<Option<FormDefinition>, AppError> {
    if let Some(form) = state.db.cached_form(form_id).await? {
        return Ok(Some(form));
    }
    match refresh_form(state, form_id).await {
        Err(AppError::UpstreamUnavailable(message)) => {
            tracing::warn!(form_id, "Form lookup skipped, Kobo unavailable: {message}");
            Ok(None)
        }
        other => other,
    }
}

async fn list_forms(State(state): State<AppState>) -> ApiResult<Vec<FormDefinition>> {
    let assets = match state.coordinator.gateway().list_forms().await {
        Ok(assets) => assets,
        Err(GatewayError::Unavailable(message)) => {
            tracing::warn!("Serving cached forms, Kobo unavailable: {message}");
            let forms = state.db.list_forms().await?;
            return Ok(ApiResponse::ok(
                format!("Kobo unavailable; serving {} cached forms", forms.len()),
                forms,
            ));
        }
        Err(error) => return Err(error.into()),
    };

    let mut forms = Vec::with_capacity(assets.len());
    for asset in &assets {
        // List entries carry no survey content; compare revisions and only
        // re-fetch forms that changed since they were cached.
        let listed = match parse_form(asset) {
            Ok(listed) => listed,
            Err(error) => {
                tracing::warn!("Skipping unreadable form asset: {error}");
                continue;
            }
        };
        match state.db.cached_form(&listed.form_id).await? {
            Some(cached) if cached.version.is_some() && cached.version == listed.version => {
                forms.push(cached);
            }
            _ => {
                if let Some(form) = refresh_form(&state, &listed.form_id).await? {
                    forms.push(form);
                }
            }
        }
    }

    Ok(ApiResponse::ok(format!("Retrieved {} forms", forms.len()), forms))
}

#[derive(Debug, Serialize)]
struct FormDetail {
    form: FormDefinition,
    summary: FormSummary,
}

async fn get_form(
    State(state): State<AppState>,
    ApiPath(form_id): ApiPath<String>,
) -> ApiResult<FormDetail> {
    let form = match refresh_form(&state, &form_id).await {
        Err(AppError::UpstreamUnavailable(message)) => {
            tracing::warn!(form_id, "Serving cached form, Kobo unavailable: {message}");
            state.db.cached_form(&form_id).await?
        }
        other => other?,
    };
    let form = form.ok_or_else(|| AppError::not_found(format!("Form {form_id} not found")))?;
    let summary = form.summary();
    Ok(ApiResponse::ok(
        "Form retrieved",
        FormDetail { form, summary },
    ))
}

#[derive(Debug, Deserialize)]
struct CreateSubmissionRequest {
    form_id: String,
    data: Map<String, Value>,
    submitted_by: Option<String>,
    location: Option<GeoPoint>,
}

#[derive(Debug, Serialize)]
struct CreatedSubmission {
    id: SubmissionId,
    form_id: String,
    sync_status: SyncStatus,
    synced_to_kobo: bool,
    remote_id: Option<i64>,
    sync_error: Option<String>,
    created_at: i64,
}

async fn create_submission(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    ApiJson(request): ApiJson<CreateSubmissionRequest>,
) -> ApiResult<CreatedSubmission> {
    let form_id = request.form_id.trim().to_string();
    if form_id.is_empty() {
        return Err(AppError::bad_request("form_id is required"));
    }

    let form = resolve_form(&state, &form_id).await?;
    validate_answers(&request.data, form.as_ref()).map_err(wildwatch_core::Error::Validation)?;

    let location = match request.location {
        Some(location) => {
            location.validate().map_err(AppError::bad_request)?;
            Some(location)
        }
        None => extract_location(&request.data, form.as_ref()),
    };
    let submitted_by = wildwatch_core::util::normalize_text_option(request.submitted_by)
        .or(user.username)
        .or(Some(user.user_id));

    let submission = Submission::new(
        form_id,
        normalize_answers(&request.data, form.as_ref()),
        submitted_by,
        location,
    );
    state.db.create_submission(&submission).await?;
    tracing::info!(
        form_id = submission.form_id.as_str(),
        submission_id = %submission.id,
        "Stored submission"
    );

    let mut created = CreatedSubmission {
        id: submission.id,
        form_id: submission.form_id.clone(),
        sync_status: submission.sync_status,
        synced_to_kobo: false,
        remote_id: None,
        sync_error: None,
        created_at: submission.created_at,
    };
    // The record is already stored; a failed delivery is retried by the next run.
    match state.coordinator.push_submission(&submission).await {
        Ok(PushOutcome::Pushed(remote_id)) => {
            created.sync_status = SyncStatus::Synced;
            created.synced_to_kobo = true;
            created.remote_id = Some(remote_id);
        }
        Ok(PushOutcome::Failed(error)) => {
            created.sync_status = SyncStatus::Failed;
            created.sync_error = Some(error.to_string());
        }
        Ok(PushOutcome::Deferred) => {
            created.sync_error = Some("Sync in progress; delivery deferred".to_string());
        }
        Err(error) => {
            tracing::warn!(submission_id = %submission.id, "Push bookkeeping failed: {error}");
            created.sync_error = Some(wildwatch_core::util::sanitize(&error));
        }
    }

    Ok(ApiResponse::ok("Submission created", created))
}

#[derive(Debug, Default, Deserialize)]
struct SubmissionListParams {
    form_id: Option<String>,
    status: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
    radius_km: Option<f64>,
    min_lat: Option<f64>,
    min_lng: Option<f64>,
    max_lat: Option<f64>,
    max_lng: Option<f64>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl SubmissionListParams {
    fn into_query(self) -> Result<SubmissionQuery, AppError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<SyncStatus>)
            .transpose()
            .map_err(AppError::bad_request)?;

        let timestamp = |name: &str, value: Option<String>| -> Result<Option<i64>, AppError> {
            value
                .map(|text| {
                    parse_timestamp_millis(&text).ok_or_else(|| {
                        AppError::bad_request(format!("{name} must be an ISO 8601 timestamp"))
                    })
                })
                .transpose()
        };

        let near = match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => {
                let center = GeoPoint::new(lat, lng).map_err(AppError::bad_request)?;
                let radius = self.radius_km.unwrap_or(DEFAULT_RADIUS_KM);
                if !radius.is_finite() || radius <= 0.0 {
                    return Err(AppError::bad_request("radius_km must be positive"));
                }
                Some((center, radius))
            }
            (None, None) => None,
            _ => return Err(AppError::bad_request("lat and lng must be given together")),
        };

        let bbox = match (self.min_lat, self.min_lng, self.max_lat, self.max_lng) {
            (Some(min_lat), Some(min_lng), Some(max_lat), Some(max_lng)) => Some(
                BoundingBox::new(min_lat, min_lng, max_lat, max_lng)
                    .map_err(AppError::bad_request)?,
            ),
            (None, None, None, None) => None,
            _ => {
                return Err(AppError::bad_request(
                    "min_lat, min_lng, max_lat, and max_lng must be given together",
                ))
            }
        };

        let limit = self.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(AppError::bad_request(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }

        Ok(SubmissionQuery {
            form_id: wildwatch_core::util::normalize_text_option(self.form_id),
            status,
            created_after: timestamp("date_from", self.date_from)?,
            created_before: timestamp("date_to", self.date_to)?,
            bbox,
            near,
            limit,
            offset: self.offset.unwrap_or(0),
        })
    }
}

#[derive(Debug, Serialize)]
struct SubmissionPage {
    items: Vec<Submission>,
    count: usize,
    limit: usize,
    offset: usize,
}

async fn list_submissions(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<SubmissionListParams>,
) -> ApiResult<SubmissionPage> {
    let query = params.into_query()?;
    let items = state.db.query_submissions(&query).await?;
    Ok(ApiResponse::ok(
        format!("Retrieved {} submissions", items.len()),
        SubmissionPage {
            count: items.len(),
            limit: query.limit,
            offset: query.offset,
            items,
        },
    ))
}

fn parse_submission_id(id: &str) -> Result<SubmissionId, AppError> {
    id.parse()
        .map_err(|_| AppError::bad_request(format!("`{id}` is not a valid submission id")))
}

async fn get_submission(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Submission> {
    let id = parse_submission_id(&id)?;
    let submission = state
        .db
        .get_submission(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Submission {id} not found")))?;
    Ok(ApiResponse::ok("Submission retrieved", submission))
}

#[derive(Debug, Deserialize)]
struct UpdateSubmissionRequest {
    data: Option<Map<String, Value>>,
    location: Option<GeoPoint>,
    submitted_by: Option<String>,
}

async fn update_submission(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    ApiJson(request): ApiJson<UpdateSubmissionRequest>,
) -> ApiResult<Submission> {
    let id = parse_submission_id(&id)?;
    let existing = state
        .db
        .get_submission(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Submission {id} not found")))?;
    let form = state.db.cached_form(&existing.form_id).await?;

    let answers = request.data.map(|data| {
        let mut merged = existing.answers.clone();
        merged.extend(data.clone());
        (merged, normalize_answers(&data, form.as_ref()))
    });
    if let Some((merged, _)) = &answers {
        validate_answers(merged, form.as_ref()).map_err(wildwatch_core::Error::Validation)?;
    }

    let location = request.location.or_else(|| {
        answers
            .as_ref()
            .and_then(|(_, changed)| extract_location(changed, form.as_ref()))
    });
    let patch = SubmissionPatch {
        answers: answers.map(|(_, changed)| changed),
        location,
        submitted_by: wildwatch_core::util::normalize_text_option(request.submitted_by),
    };
    if patch == SubmissionPatch::default() {
        return Err(AppError::bad_request("Nothing to update"));
    }

    let updated = state.db.update_submission(&id, &patch).await?;
    tracing::info!(
        form_id = updated.form_id.as_str(),
        submission_id = %updated.id,
        "Updated submission locally"
    );
    Ok(ApiResponse::ok("Submission updated", updated))
}

#[derive(Debug, Deserialize)]
struct ConflictParams {
    limit: Option<usize>,
}

async fn list_conflicts(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ConflictParams>,
) -> ApiResult<Vec<SyncConflict>> {
    let limit = params.limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    let conflicts = state.db.list_conflicts(limit).await?;
    Ok(ApiResponse::ok(
        format!("Retrieved {} conflicts", conflicts.len()),
        conflicts,
    ))
}

#[derive(Debug, Serialize)]
struct SyncState {
    form_id: String,
    running: bool,
    cursor: SyncCursor,
    recent_runs: Vec<SyncRun>,
}

async fn sync_status(
    State(state): State<AppState>,
    ApiPath(form_id): ApiPath<String>,
) -> ApiResult<SyncState> {
    let cursor = state.db.cursor(&form_id).await?;
    let recent_runs = state.db.recent_runs(&form_id, RECENT_RUNS).await?;
    Ok(ApiResponse::ok(
        "Sync state retrieved",
        SyncState {
            running: state.coordinator.is_running(&form_id),
            form_id,
            cursor,
            recent_runs,
        },
    ))
}

#[derive(Debug, Default, Deserialize)]
struct TriggerParams {
    #[serde(default)]
    full: bool,
}

#[derive(Debug, Serialize)]
struct SyncAccepted {
    form_id: String,
    mode: &'static str,
}

async fn trigger_sync(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    ApiPath(form_id): ApiPath<String>,
    ApiQuery(params): ApiQuery<TriggerParams>,
) -> ApiResult<SyncAccepted> {
    let lease = state.coordinator.acquire(&form_id)?;
    let mode = if params.full {
        SyncMode::Full
    } else {
        SyncMode::Incremental
    };
    tracing::info!(form_id, user = user.user_id.as_str(), ?mode, "Sync requested");
    spawn_sync(&state, lease, mode);

    Ok(ApiResponse::with_status(
        StatusCode::ACCEPTED,
        "Sync started",
        SyncAccepted {
            form_id,
            mode: mode_name(mode),
        },
    ))
}

async fn kobo_webhook(
    State(state): State<AppState>,
    ApiPath(form_id): ApiPath<String>,
    headers: HeaderMap,
) -> ApiResult<SyncAccepted> {
    let Some(expected) = state.config.webhook_secret.as_deref() else {
        return Err(AppError::not_found("Webhook is not enabled"));
    };
    let presented = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !secrets_match(presented, expected) {
        return Err(AppError::unauthorized("Invalid webhook secret"));
    }

    // Kobo retries failed hooks; a busy form already picks the record up.
    let message = match state.coordinator.acquire(&form_id) {
        Ok(lease) => {
            spawn_sync(&state, lease, SyncMode::Incremental);
            "Sync started"
        }
        Err(wildwatch_core::Error::SyncInProgress(_)) => "Sync already running",
        Err(error) => return Err(error.into()),
    };
    tracing::info!(form_id, message, "Kobo webhook received");

    Ok(ApiResponse::with_status(
        StatusCode::ACCEPTED,
        message,
        SyncAccepted {
            form_id,
            mode: mode_name(SyncMode::Incremental),
        },
    ))
}

fn spawn_sync(state: &AppState, lease: SyncLease, mode: SyncMode) {
    let coordinator = Arc::clone(&state.coordinator);
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        // Outcome is logged and recorded as a sync run by the coordinator
        let _ = coordinator.run_leased(lease, mode, &cancel).await;
    });
}

const fn mode_name(mode: SyncMode) -> &'static str {
    match mode {
        SyncMode::Incremental => "incremental",
        SyncMode::Full => "full",
    }
}

fn secrets_match(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && presented
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tower::ServiceExt;
    use wildwatch_core::kobo::{FormGateway, GatewayResult, KoboUser, RemotePage};
    use wildwatch_core::models::PullPhase;
    use wildwatch_core::sync::SyncOptions;

    use super::*;
    use crate::auth::tests::{valid_token, TEST_SECRET};

    const FORM_ID: &str = "aIncident01";

    fn asset() -> Value {
        json!({
            "uid": FORM_ID,
            "name": "Incident report",
            "version_id": "v1",
            "deployment__active": true,
            "content": {
                "survey": [
                    {"type": "select_one species", "name": "species", "label": "Species", "required": true},
                    {"type": "geopoint", "name": "location", "label": "Location"},
                    {"type": "integer", "name": "count", "label": "Count"}
                ],
                "choices": [
                    {"list_name": "species", "name": "lion", "label": "Lion"},
                    {"list_name": "species", "name": "elephant", "label": "Elephant"}
                ]
            }
        })
    }

    #[derive(Default)]
    struct FakeKobo {
        down: AtomicBool,
    }

    impl FakeKobo {
        fn check(&self) -> GatewayResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(GatewayError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl FormGateway for FakeKobo {
        async fn list_forms(&self) -> GatewayResult<Vec<Value>> {
            self.check()?;
            Ok(vec![json!({"uid": FORM_ID, "name": "Incident report", "version_id": "v1"})])
        }

        async fn get_form(&self, form_id: &str) -> GatewayResult<Option<Value>> {
            self.check()?;
            Ok((form_id == FORM_ID).then(asset))
        }

        async fn fetch_submissions(
            &self,
            _form_id: &str,
            _phase: PullPhase,
            _since_millis: i64,
            _start: u32,
            _limit: u32,
        ) -> GatewayResult<RemotePage> {
            self.check()?;
            Ok(RemotePage::default())
        }

        async fn push_submission(&self, _submission: &Submission) -> GatewayResult<i64> {
            self.check()?;
            Ok(501)
        }

        async fn current_user(&self) -> GatewayResult<KoboUser> {
            self.check()?;
            Ok(KoboUser {
                username: "wildwatch".into(),
                email: None,
            })
        }
    }

    struct Harness {
        router: Router,
        kobo: Arc<FakeKobo>,
        coordinator: Arc<SyncCoordinator>,
        db: DatabaseService,
    }

    async fn harness() -> Harness {
        let config = AppConfig::from_lookup(|key| match key {
            "KOBO_API_TOKEN" => Some("kobo-token".to_string()),
            "JWT_SECRET" => Some(TEST_SECRET.to_string()),
            "KOBO_WEBHOOK_SECRET" => Some("hook-secret".to_string()),
            _ => None,
        })
        .unwrap();
        let db = DatabaseService::open_in_memory().await.unwrap();
        let kobo = Arc::new(FakeKobo::default());
        let coordinator = Arc::new(SyncCoordinator::new(
            kobo.clone(),
            Arc::new(db.clone()),
            SyncOptions::default(),
        ));
        let state = AppState::new(
            Arc::new(config),
            db.clone(),
            coordinator.clone(),
            CancellationToken::new(),
        );
        Harness {
            router: app_router(state),
            kobo,
            coordinator,
            db,
        }
    }

    fn authed(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", valid_token()))
            .header("content-type", "application/json");
        builder
            .body(body.map_or_else(Body::empty, |body| Body::from(body.to_string())))
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_is_public_and_tagged_with_request_id() {
        let harness = harness().await;
        for uri in ["/health", "/api/v1/health/"] {
            let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let (status, headers, body) = send(&harness.router, request).await;
            assert_eq!(status, StatusCode::OK);
            assert!(headers.contains_key("x-request-id"));
            assert_eq!(body["success"], json!(true));
            assert_eq!(body["data"]["status"], json!("healthy"));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn protected_routes_require_bearer_token() {
        let harness = harness().await;
        let request = Request::builder()
            .uri("/api/v1/submissions/")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&harness.router, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"]["type"], json!("Unauthorized"));
        assert_eq!(body["error"]["status_code"], json!(401));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_submission_returns_envelope_with_id() {
        let harness = harness().await;
        let (status, _, body) = send(
            &harness.router,
            authed(
                "POST",
                "/api/v1/submissions/",
                Some(json!({
                    "form_id": FORM_ID,
                    "data": {"species": "lion", "location": "-1.29 36.82", "count": "3"}
                })),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["status_code"], json!(200));
        assert_eq!(body["data"]["synced_to_kobo"], json!(true));
        assert_eq!(body["data"]["remote_id"], json!(501));

        let id: SubmissionId = body["data"]["id"].as_str().unwrap().parse().unwrap();
        let stored = harness.db.get_submission(&id).await.unwrap().unwrap();
        assert_eq!(stored.remote_id, Some(501));
        assert_eq!(stored.answers["count"], json!(3));
        assert!(stored.location.is_some());
        assert_eq!(stored.submitted_by.as_deref(), Some("ranger"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_submission_rejects_invalid_payload_with_details() {
        let harness = harness().await;
        let (status, _, body) = send(
            &harness.router,
            authed(
                "POST",
                "/api/v1/submissions",
                Some(json!({"form_id": FORM_ID, "data": {"species": "zebra"}})),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["type"], json!("ValidationError"));
        assert!(body["error"]["details"]["species"].is_array());
        assert_eq!(harness.db.count_submissions().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_requests_use_error_envelope() {
        let harness = harness().await;

        let (status, _, body) = send(
            &harness.router,
            authed(
                "POST",
                "/api/v1/submissions/",
                Some(json!({"data": {"species": "lion"}})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"]["type"], json!("ValidationError"));
        assert_eq!(body["error"]["status_code"], json!(422));
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("form_id"));

        let (status, _, body) = send(
            &harness.router,
            authed("GET", "/api/v1/submissions/?limit=many", None),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["type"], json!("ValidationError"));
        assert_eq!(harness.db.count_submissions().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_submission_keeps_record_when_kobo_is_down() {
        let harness = harness().await;
        harness.kobo.down.store(true, Ordering::SeqCst);

        let (status, _, body) = send(
            &harness.router,
            authed(
                "POST",
                "/api/v1/submissions/",
                Some(json!({"form_id": FORM_ID, "data": {"species": "lion"}})),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["synced_to_kobo"], json!(false));
        assert_eq!(body["data"]["sync_status"], json!("failed"));
        assert_eq!(harness.db.count_submissions().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_and_patch_submissions() {
        let harness = harness().await;
        let (_, _, created) = send(
            &harness.router,
            authed(
                "POST",
                "/api/v1/submissions/",
                Some(json!({"form_id": FORM_ID, "data": {"species": "lion"}})),
            ),
        )
        .await;
        let id = created["data"]["id"].as_str().unwrap().to_string();

        let (status, _, listed) = send(
            &harness.router,
            authed(
                "GET",
                &format!("/api/v1/submissions/?form_id={FORM_ID}&limit=10"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["data"]["count"], json!(1));
        assert_eq!(listed["data"]["items"][0]["id"], json!(id));

        let (status, _, patched) = send(
            &harness.router,
            authed(
                "PATCH",
                &format!("/api/v1/submissions/{id}"),
                Some(json!({"data": {"species": "elephant"}})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["data"]["answers"]["species"], json!("elephant"));
        assert_eq!(patched["data"]["sync_status"], json!("unsynced"));

        let (status, _, _) = send(
            &harness.router,
            authed("GET", "/api/v1/submissions/?limit=1000", None),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn forms_fall_back_to_cache_when_kobo_is_down() {
        let harness = harness().await;
        let (status, _, body) = send(&harness.router, authed("GET", "/api/v1/forms/", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["form_id"], json!(FORM_ID));
        assert_eq!(body["data"][0]["questions"].as_array().unwrap().len(), 3);

        harness.kobo.down.store(true, Ordering::SeqCst);
        let (status, _, body) = send(&harness.router, authed("GET", "/api/v1/forms/", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["form_id"], json!(FORM_ID));

        let (status, _, body) =
            send(&harness.router, authed("GET", "/api/v1/health/kobo", None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["type"], json!("UpstreamUnavailable"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_form_is_not_found() {
        let harness = harness().await;
        let (status, _, body) =
            send(&harness.router, authed("GET", "/api/v1/forms/missing", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["status_code"], json!(404));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_sync_refuses_busy_form() {
        let harness = harness().await;
        let _lease = harness.coordinator.acquire(FORM_ID).unwrap();

        let (status, _, body) = send(
            &harness.router,
            authed("POST", &format!("/api/v1/sync/{FORM_ID}"), None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["type"], json!("SyncInProgress"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_sync_accepts_idle_form() {
        let harness = harness().await;
        let (status, _, body) = send(
            &harness.router,
            authed("POST", &format!("/api/v1/sync/{FORM_ID}?full=true"), None),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status_code"], json!(202));
        assert_eq!(body["data"]["mode"], json!("full"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn webhook_checks_shared_secret() {
        let harness = harness().await;
        let uri = format!("/api/v1/webhooks/kobo/{FORM_ID}");

        let request = Request::builder()
            .method("POST")
            .uri(&uri)
            .header(WEBHOOK_SECRET_HEADER, "wrong")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&harness.router, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("POST")
            .uri(&uri)
            .header(WEBHOOK_SECRET_HEADER, "hook-secret")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&harness.router, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[test]
    fn list_params_validate_geography() {
        let params = SubmissionListParams {
            lat: Some(-1.29),
            ..SubmissionListParams::default()
        };
        assert!(params.into_query().is_err());

        let params = SubmissionListParams {
            lat: Some(-1.29),
            lng: Some(36.82),
            status: Some("synced".into()),
            date_from: Some("2024-01-01T00:00:00".into()),
            ..SubmissionListParams::default()
        };
        let query = params.into_query().unwrap();
        assert_eq!(query.near.unwrap().1, DEFAULT_RADIUS_KM);
        assert_eq!(query.status, Some(SyncStatus::Synced));
        assert_eq!(query.created_after, Some(1_704_067_200_000));
        assert_eq!(query.limit, DEFAULT_QUERY_LIMIT);
    }
}

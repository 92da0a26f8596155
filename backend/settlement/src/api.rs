//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequestParts, Multipart, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::error;

use crate::config::Config;
use crate::errors::SettlementError;
use crate::overrides::{self, OverridePayload};
use crate::payout::PayoutCallData;
use crate::registry::{self, Actor};
use crate::settlement::{self, NewContribution};
use crate::types::{ApprovedResult, RecipientRegistration, Round, RoundResults};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub config: Config,
}

type ApiResult<T> = Result<Json<T>, SettlementError>;

// ─────────────────────────────────────────────────────────
// Errors & caller identity
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for SettlementError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::InvalidState(_) => StatusCode::CONFLICT,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NoCampaigns | Self::NoMatchingPool | Self::NoValidRecipients => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Database(_) | Self::Migrate(_) | Self::Json(_) | Self::Config(_) => {
                error!("Request failed: {self}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: self.code(),
            }),
        )
            .into_response()
    }
}

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const ROLE_HEADER: &str = "x-actor-role";

/// Caller identity as forwarded by the authenticating proxy.
#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = SettlementError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header_str = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let id = header_str(ACTOR_HEADER).ok_or_else(|| {
            SettlementError::InvalidInput(format!("missing {ACTOR_HEADER} header"))
        })?;
        let is_operator = header_str(ROLE_HEADER)
            .map(|role| role.eq_ignore_ascii_case("operator"))
            .unwrap_or(false);

        Ok(Actor {
            id: id.to_string(),
            is_operator,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoundRequest {
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub matching_pool: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub campaign_id: String,
    pub recipient_address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub tx_ref: String,
    pub onchain_recipient_id: String,
    pub recipient_address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionRequest {
    pub campaign_id: String,
    pub contributor: String,
    /// Decimal string; plain JSON numbers are accepted too.
    pub amount: Value,
    pub payment_status: String,
    pub humanity_score: Option<f64>,
}

#[derive(Serialize)]
pub struct ContributionResponse {
    pub id: i64,
}

#[derive(Serialize)]
pub struct RegistrationsResponse {
    pub round_id: i64,
    pub count: usize,
    pub registrations: Vec<RecipientRegistration>,
}

#[derive(Deserialize)]
pub struct ResultsQuery {
    pub min_humanity_score: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRequest {
    pub strategy_address: String,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /rounds`
pub async fn create_round(
    State(state): State<Arc<ApiState>>,
    actor: Actor,
    Json(req): Json<CreateRoundRequest>,
) -> Result<(StatusCode, Json<Round>), SettlementError> {
    let round = settlement::create_round(
        &state.pool,
        &req.title,
        req.start_at,
        req.end_at,
        req.matching_pool,
        &actor,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(round)))
}

/// `GET /rounds/:id`
pub async fn get_round(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<i64>,
) -> ApiResult<Round> {
    let mut round = settlement::get_round(&state.pool, round_id).await?;
    // Served separately by `/approved-result`.
    round.approved_result = None;
    Ok(Json(round))
}

/// `GET /rounds/:id/registrations`
pub async fn list_registrations(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<i64>,
) -> ApiResult<RegistrationsResponse> {
    let registrations = registry::list(&state.pool, round_id).await?;
    Ok(Json(RegistrationsResponse {
        round_id,
        count: registrations.len(),
        registrations,
    }))
}

/// `POST /rounds/:id/registrations`
pub async fn register(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<i64>,
    actor: Actor,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RecipientRegistration>), SettlementError> {
    let registration = registry::register(
        &state.pool,
        round_id,
        &req.campaign_id,
        &actor.id,
        &req.recipient_address,
        Utc::now(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

/// `POST /rounds/:id/registrations/:campaign_id/confirm`
pub async fn confirm_registration(
    State(state): State<Arc<ApiState>>,
    Path((round_id, campaign_id)): Path<(i64, String)>,
    _actor: Actor,
    Json(req): Json<ConfirmRequest>,
) -> ApiResult<RecipientRegistration> {
    let registration = registry::confirm_on_chain(
        &state.pool,
        round_id,
        &campaign_id,
        &req.tx_ref,
        &req.onchain_recipient_id,
        &req.recipient_address,
        Utc::now(),
    )
    .await?;
    Ok(Json(registration))
}

/// `POST /rounds/:id/registrations/:campaign_id/reject`
pub async fn reject_registration(
    State(state): State<Arc<ApiState>>,
    Path((round_id, campaign_id)): Path<(i64, String)>,
    actor: Actor,
) -> ApiResult<RecipientRegistration> {
    let registration =
        registry::reject(&state.pool, round_id, &campaign_id, &actor, Utc::now()).await?;
    Ok(Json(registration))
}

/// `DELETE /rounds/:id/registrations/:campaign_id`
pub async fn remove_registration(
    State(state): State<Arc<ApiState>>,
    Path((round_id, campaign_id)): Path<(i64, String)>,
    actor: Actor,
) -> Result<StatusCode, SettlementError> {
    registry::remove(&state.pool, round_id, &campaign_id, &actor, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /rounds/:id/contributions`
pub async fn record_contribution(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<i64>,
    Json(req): Json<ContributionRequest>,
) -> Result<(StatusCode, Json<ContributionResponse>), SettlementError> {
    let amount = match req.amount {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        other => {
            return Err(SettlementError::InvalidInput(format!(
                "amount must be a decimal string, got {other}"
            )))
        }
    };

    let id = settlement::record_contribution(
        &state.pool,
        round_id,
        NewContribution {
            campaign_id: req.campaign_id,
            contributor: req.contributor,
            amount,
            payment_status: req.payment_status,
            humanity_score: req.humanity_score,
        },
        Utc::now(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(ContributionResponse { id })))
}

/// `GET /rounds/:id/results`
///
/// Computes scores and suggested matches without persisting anything.
pub async fn compute_results(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<i64>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<RoundResults> {
    let threshold = query
        .min_humanity_score
        .unwrap_or(state.config.min_humanity_score);
    let results = settlement::compute_results(&state.pool, round_id, threshold, Utc::now()).await?;
    Ok(Json(results))
}

/// `POST /rounds/:id/results/approve`
pub async fn approve_results(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<i64>,
    Query(query): Query<ResultsQuery>,
    actor: Actor,
) -> ApiResult<ApprovedResult> {
    let threshold = query
        .min_humanity_score
        .unwrap_or(state.config.min_humanity_score);
    let approved =
        settlement::approve_computed(&state.pool, round_id, threshold, &actor, Utc::now()).await?;
    Ok(Json(approved))
}

/// `GET /rounds/:id/approved-result`
pub async fn get_approved_result(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<i64>,
) -> ApiResult<ApprovedResult> {
    Ok(Json(settlement::approved_result(&state.pool, round_id).await?))
}

/// Turn a raw request body into an override payload based on its media type.
pub fn payload_from_body(
    headers: &HeaderMap,
    body: &[u8],
) -> Result<OverridePayload, SettlementError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    if overrides::is_object_notation(None, content_type) {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| SettlementError::InvalidInput(format!("body is not valid JSON: {e}")))?;
        Ok(OverridePayload::Json(value))
    } else {
        let text = std::str::from_utf8(body)
            .map_err(|_| SettlementError::InvalidInput("body is not UTF-8 text".into()))?;
        Ok(OverridePayload::Text(text.to_string()))
    }
}

/// `POST /rounds/:id/approved-result`
///
/// JSON bodies are taken as the campaign array; anything else is read as
/// delimited text.
pub async fn upload_approved_result(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<i64>,
    actor: Actor,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<ApprovedResult> {
    let payload = payload_from_body(&headers, &body)?;
    let approved = overrides::ingest(&state.pool, round_id, payload, &actor, Utc::now()).await?;
    Ok(Json(approved))
}

/// `POST /rounds/:id/approved-result/upload` (multipart, field `file`)
pub async fn upload_approved_result_file(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<i64>,
    actor: Actor,
    mut multipart: Multipart,
) -> ApiResult<ApprovedResult> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| SettlementError::InvalidInput(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().map(String::from);
        let content_type = field.content_type().map(String::from);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| SettlementError::InvalidInput(format!("failed to read upload: {e}")))?;
        upload = Some(OverridePayload::File {
            file_name,
            content_type,
            bytes: bytes.to_vec(),
        });
        break;
    }

    let payload = upload
        .ok_or_else(|| SettlementError::InvalidInput("multipart field `file` is required".into()))?;
    let approved = overrides::ingest(&state.pool, round_id, payload, &actor, Utc::now()).await?;
    Ok(Json(approved))
}

/// `POST /rounds/:id/payout`
pub async fn build_payout(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<i64>,
    Json(req): Json<PayoutRequest>,
) -> ApiResult<PayoutCallData> {
    let payout = settlement::build_round_payout(
        &state.pool,
        round_id,
        &req.strategy_address,
        state.config.token_decimals,
    )
    .await?;
    Ok(Json(payout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(content_type: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        map
    }

    #[test]
    fn json_body_becomes_json_payload() {
        let payload = payload_from_body(&headers("application/json"), br#"[{"a":1}]"#).unwrap();
        assert!(matches!(payload, OverridePayload::Json(Value::Array(_))));
    }

    #[test]
    fn text_body_becomes_delimited_payload() {
        let payload = payload_from_body(&headers("text/csv"), b"campaignId\n").unwrap();
        assert!(matches!(payload, OverridePayload::Text(t) if t == "campaignId\n"));
    }

    #[test]
    fn invalid_json_body_is_invalid_input() {
        let err = payload_from_body(&headers("application/json"), b"{oops").unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));
    }

    #[test]
    fn error_kinds_map_to_distinct_statuses() {
        let status = |e: SettlementError| e.into_response().status();
        assert_eq!(status(SettlementError::InvalidInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(SettlementError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(SettlementError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(status(SettlementError::Forbidden("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(
            status(SettlementError::NoValidRecipients),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[tokio::test]
    async fn actor_is_read_from_headers() {
        let request = axum::http::Request::builder()
            .header(ACTOR_HEADER, "alice")
            .header(ROLE_HEADER, "Operator")
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();
        let actor = Actor::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(actor.id, "alice");
        assert!(actor.is_operator);

        let request = axum::http::Request::builder().body(()).unwrap();
        let (mut parts, _) = request.into_parts();
        assert!(Actor::from_request_parts(&mut parts, &()).await.is_err());
    }
}

//! # Issuer JSON API
//!
//! The axum router in front of an [`Issuer`]. Request bodies are closed
//! camelCase types: unknown fields are rejected.
//!
//! ## Endpoints
//!
//! | Method | Path           | Description                                   |
//! |--------|----------------|-----------------------------------------------|
//! | GET    | `/health`      | Liveness probe                                |
//! | GET    | `/status`      | Issuer key and registry summary               |
//! | POST   | `/issue`       | Mint tokens against a paid-in amount          |
//! | POST   | `/validate`    | Four-flag check of a token by id              |
//! | POST   | `/divide`      | Online, issuer-signed division                |
//! | POST   | `/redeem`      | Atomic batch redemption into ledger value     |
//! | POST   | `/sync`        | Take in offline transfer records              |
//! | POST   | `/delegate`    | Certify an on-device division key             |
//! | GET    | `/tokens/:id`  | The issuer's copy of a token                  |
//!
//! ## Errors
//!
//! Failures come back as [`ErrorResponse`] with the HTTP status picked from
//! the error class: validation 400, insufficient funds 402, double spend 409,
//! expired 410, signature or redemption refusal 422, transport trouble 503.
//! Unknown token ids are 404.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use otm_protocol::crypto::{PublicKey, Signature};
use otm_protocol::issuer::{
    RecordSyncResult, RedemptionReceipt, RedemptionRequest, RegistryStats, Split,
};
use otm_protocol::token::{DelegationCertificate, SyncStatus, Token, TokenId, TransferRecord};
use otm_protocol::{ErrorClass, Issuer, IssuerError};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub issuer: Arc<Issuer>,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/issue", post(issue_handler))
        .route("/validate", post(validate_handler))
        .route("/divide", post(divide_handler))
        .route("/redeem", post(redeem_handler))
        .route("/sync", post(sync_handler))
        .route("/delegate", post(delegate_handler))
        .route("/tokens/:id", get(token_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IssueRequest {
    pub owner_id: PublicKey,
    pub amount: u64,
    /// What the purchaser paid into the ledger for this issuance.
    pub paid_amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ValidateRequest {
    pub token_id: TokenId,
    pub signature: Signature,
    pub amount: u64,
    #[serde(default)]
    pub holder: Option<PublicKey>,
}

/// All four flags are always present, plus their conjunction.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    pub signature_valid: bool,
    pub not_expired: bool,
    pub not_spent: bool,
    pub ownership_valid: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DivideRequest {
    pub token_id: TokenId,
    pub payment_amount: u64,
}

/// When the payment equals the token's amount nothing is divided:
/// `originalToken` and `paymentToken` are the same token and there is no
/// change.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivideResponse {
    pub original_token: Token,
    pub payment_token: Token,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_token: Option<Token>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RedeemRequest {
    pub presenter: PublicKey,
    pub tokens: Vec<Token>,
    #[serde(default)]
    pub provenance: Vec<TransferRecord>,
}

impl From<RedeemRequest> for RedemptionRequest {
    fn from(r: RedeemRequest) -> Self {
        RedemptionRequest {
            presenter: r.presenter,
            tokens: r.tokens,
            provenance: r.provenance,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SyncRequest {
    pub transfer_records: Vec<TransferRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub per_record: Vec<RecordSyncResult>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DelegateRequest {
    pub holder: PublicKey,
    pub delegate: PublicKey,
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub version: String,
    pub issuer_public_key: PublicKey,
    pub registry: RegistryStats,
    pub timestamp: String,
}

/// Error body for every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    /// Snake-case [`ErrorClass`], absent for plain request errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_invalid_token_id: Option<TokenId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Error Mapping
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse {
                error: message.into(),
                class: Some(ErrorClass::Validation.as_str().into()),
                first_invalid_token_id: None,
                reason: None,
            },
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorResponse {
                error: message.into(),
                class: None,
                first_invalid_token_id: None,
                reason: None,
            },
        }
    }
}

pub fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        ErrorClass::InsufficientFunds | ErrorClass::InsufficientOfflineBalance => {
            StatusCode::PAYMENT_REQUIRED
        }
        ErrorClass::DoubleSpendDetected => StatusCode::CONFLICT,
        ErrorClass::TokenExpired => StatusCode::GONE,
        ErrorClass::Signature | ErrorClass::RedemptionRejected => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorClass::TransportFailure => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl From<IssuerError> for ApiError {
    fn from(e: IssuerError) -> Self {
        if let IssuerError::UnknownToken(id) = &e {
            return ApiError::not_found(format!("token {id} not found"));
        }
        // A refused batch reports the reason's class, not the blanket one.
        let class = match e.rejection() {
            Some(r) => r.reason.class(),
            None => e.class(),
        };
        ApiError {
            status: status_for(class),
            body: ErrorResponse {
                error: e.to_string(),
                class: Some(class.as_str().into()),
                first_invalid_token_id: e.rejection().and_then(|r| r.first_invalid_token_id),
                reason: e.rejection().map(|r| r.reason.to_string()),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — liveness only.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let stats = state.issuer.stats();
    state.metrics.observe_stats(&stats);
    Json(StatusResponse {
        version: state.version.clone(),
        issuer_public_key: state.issuer.public_key(),
        registry: stats,
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// `POST /issue` — mint tokens for `ownerId`.
async fn issue_handler(
    State(state): State<AppState>,
    payload: Result<Json<IssueRequest>, JsonRejection>,
) -> ApiResult<Vec<Token>> {
    let _timer = state.metrics.request_latency_seconds.start_timer();
    let Json(req) = payload?;

    let tokens = state
        .issuer
        .issue_tokens(req.owner_id, req.amount, req.paid_amount, Utc::now())?;

    state.metrics.tokens_issued_total.inc_by(tokens.len() as u64);
    state.metrics.value_issued_total.inc_by(req.amount);
    state.metrics.observe_stats(&state.issuer.stats());
    Ok(Json(tokens))
}

/// `POST /validate` — check a caller-supplied signature and amount against
/// the issuer's copy of the token. Unknown ids fail every flag.
async fn validate_handler(
    State(state): State<AppState>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> ApiResult<ValidateResponse> {
    let _timer = state.metrics.request_latency_seconds.start_timer();
    let Json(req) = payload?;

    let outcome = state.issuer.validate_by_id(
        &req.token_id,
        &req.signature,
        req.amount,
        req.holder.as_ref(),
        Utc::now(),
    );
    Ok(Json(ValidateResponse {
        valid: outcome.is_valid(),
        signature_valid: outcome.signature_valid,
        not_expired: outcome.not_expired,
        not_spent: outcome.not_spent,
        ownership_valid: outcome.ownership_valid,
    }))
}

async fn divide_handler(
    State(state): State<AppState>,
    payload: Result<Json<DivideRequest>, JsonRejection>,
) -> ApiResult<DivideResponse> {
    let _timer = state.metrics.request_latency_seconds.start_timer();
    let Json(req) = payload?;

    let response = match state
        .issuer
        .divide(&req.token_id, req.payment_amount, Utc::now())?
    {
        Split::Whole(token) => DivideResponse {
            original_token: token.clone(),
            payment_token: token,
            change_token: None,
        },
        Split::Divided {
            original,
            payment,
            change,
        } => {
            state.metrics.divisions_total.inc();
            DivideResponse {
                original_token: original,
                payment_token: payment,
                change_token: Some(change),
            }
        }
    };
    Ok(Json(response))
}

/// `POST /redeem` — all tokens pass and the presenter is credited the sum,
/// or the whole batch is refused.
async fn redeem_handler(
    State(state): State<AppState>,
    payload: Result<Json<RedeemRequest>, JsonRejection>,
) -> ApiResult<RedemptionReceipt> {
    let _timer = state.metrics.request_latency_seconds.start_timer();
    let Json(req) = payload?;
    let request = RedemptionRequest::from(req);

    match state.issuer.redeem_tokens(&request, Utc::now()).await {
        Ok(receipt) => {
            state.metrics.value_redeemed_total.inc_by(receipt.redeemed_total);
            state.metrics.observe_stats(&state.issuer.stats());
            Ok(Json(receipt))
        }
        Err(e) => {
            if let Some(rejection) = e.rejection() {
                let class = rejection.reason.class();
                state
                    .metrics
                    .redemptions_rejected_total
                    .with_label_values(&[class.as_str()])
                    .inc();
                if class == ErrorClass::DoubleSpendDetected {
                    state.metrics.double_spends_total.inc();
                }
            }
            Err(e.into())
        }
    }
}

/// `POST /sync` — every record is judged on its own; the response lists a
/// verdict per record in request order.
async fn sync_handler(
    State(state): State<AppState>,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> ApiResult<SyncResponse> {
    let _timer = state.metrics.request_latency_seconds.start_timer();
    let Json(req) = payload?;

    let per_record = state.issuer.sync_transfer_records(&req.transfer_records);
    let synced = per_record
        .iter()
        .filter(|r| r.status == SyncStatus::Synced)
        .count();
    state.metrics.transfers_synced_total.inc_by(synced as u64);
    Ok(Json(SyncResponse { per_record }))
}

async fn delegate_handler(
    State(state): State<AppState>,
    payload: Result<Json<DelegateRequest>, JsonRejection>,
) -> ApiResult<DelegationCertificate> {
    let Json(req) = payload?;
    let cert =
        state
            .issuer
            .delegate_division(req.holder, req.delegate, req.valid_until, Utc::now())?;
    Ok(Json(cert))
}

async fn token_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Token> {
    let id: TokenId = id
        .parse()
        .map_err(|e| ApiError::bad_request(format!("invalid token id: {e}")))?;
    state
        .issuer
        .get_token(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("token {id} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use otm_protocol::config::IssuerConfig;
    use otm_protocol::crypto::Keypair;
    use otm_protocol::ports::InMemoryLedger;
    use otm_protocol::TokenStatus;
    use tower::ServiceExt;

    struct TestNode {
        router: Router,
        issuer: Arc<Issuer>,
        ledger: Arc<InMemoryLedger>,
    }

    fn test_node() -> TestNode {
        let ledger = Arc::new(InMemoryLedger::new());
        let issuer = Arc::new(Issuer::new(
            Keypair::generate(),
            IssuerConfig::default(),
            ledger.clone(),
        ));
        let state = AppState {
            version: "0.1.0-test".into(),
            issuer: issuer.clone(),
            metrics: Arc::new(crate::metrics::NodeMetrics::new().unwrap()),
        };
        TestNode {
            router: create_router(state),
            issuer,
            ledger,
        }
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn post_json(
        router: &Router,
        path: &str,
        body: serde_json::Value,
    ) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn issue(node: &TestNode, owner: &Keypair, amount: u64) -> Vec<Token> {
        let (status, body) = post_json(
            &node.router,
            "/issue",
            serde_json::json!({
                "ownerId": owner.public_key(),
                "amount": amount,
                "paidAmount": amount,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let node = test_node();
        let (status, body) = get(&node.router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_issuer_key_and_outstanding_value() {
        let node = test_node();
        issue(&node, &Keypair::generate(), 250).await;

        let (status, body) = get(&node.router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let resp: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.version, "0.1.0-test");
        assert_eq!(resp.issuer_public_key, node.issuer.public_key());
        assert_eq!(resp.registry.outstanding_value, 250);
    }

    #[tokio::test]
    async fn issue_mints_active_tokens_for_owner() {
        let node = test_node();
        let alice = Keypair::generate();
        let tokens = issue(&node, &alice, 100).await;

        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].amount, 100);
        assert_eq!(tokens[0].owner, alice.public_key());
        assert_eq!(tokens[0].status, TokenStatus::Active);
    }

    #[tokio::test]
    async fn underpaid_issue_is_402() {
        let node = test_node();
        let (status, body) = post_json(
            &node.router,
            "/issue",
            serde_json::json!({
                "ownerId": Keypair::generate().public_key(),
                "amount": 100,
                "paidAmount": 99,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.class.as_deref(), Some("insufficient_funds"));
    }

    #[tokio::test]
    async fn unknown_fields_are_rejected() {
        let node = test_node();
        let (status, _) = post_json(
            &node.router,
            "/issue",
            serde_json::json!({
                "ownerId": Keypair::generate().public_key(),
                "amount": 100,
                "paidAmount": 100,
                "discount": 5,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn validate_reports_all_flags() {
        let node = test_node();
        let alice = Keypair::generate();
        let token = issue(&node, &alice, 100).await.remove(0);

        let (status, body) = post_json(
            &node.router,
            "/validate",
            serde_json::json!({
                "tokenId": token.id,
                "signature": token.issuer_signature,
                "amount": 100,
                "holder": alice.public_key(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let resp: ValidateResponse = serde_json::from_slice(&body).unwrap();
        assert!(resp.valid);
        assert!(resp.signature_valid && resp.not_expired && resp.not_spent && resp.ownership_valid);

        // Same signature, inflated amount.
        let (_, body) = post_json(
            &node.router,
            "/validate",
            serde_json::json!({
                "tokenId": token.id,
                "signature": token.issuer_signature,
                "amount": 1000,
            }),
        )
        .await;
        let resp: ValidateResponse = serde_json::from_slice(&body).unwrap();
        assert!(!resp.valid);
        assert!(!resp.signature_valid);
        assert!(resp.not_expired);
    }

    #[tokio::test]
    async fn validate_unknown_token_fails_every_flag() {
        let node = test_node();
        let (status, body) = post_json(
            &node.router,
            "/validate",
            serde_json::json!({
                "tokenId": TokenId::random(),
                "signature": Keypair::generate().sign(b"x"),
                "amount": 5,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        for flag in ["valid", "signatureValid", "notExpired", "notSpent", "ownershipValid"] {
            assert_eq!(json[flag], false, "{flag}");
        }
    }

    #[tokio::test]
    async fn divide_returns_payment_and_change() {
        let node = test_node();
        let token = issue(&node, &Keypair::generate(), 100).await.remove(0);

        let (status, body) = post_json(
            &node.router,
            "/divide",
            serde_json::json!({ "tokenId": token.id, "paymentAmount": 30 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let resp: DivideResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.original_token.status, TokenStatus::Divided);
        assert_eq!(resp.payment_token.amount, 30);
        assert_eq!(resp.change_token.map(|c| c.amount), Some(70));

        // The parent is gone for good.
        let (status, _) = post_json(
            &node.router,
            "/divide",
            serde_json::json!({ "tokenId": token.id, "paymentAmount": 10 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn divide_whole_amount_has_no_change() {
        let node = test_node();
        let token = issue(&node, &Keypair::generate(), 40).await.remove(0);

        let (status, body) = post_json(
            &node.router,
            "/divide",
            serde_json::json!({ "tokenId": token.id, "paymentAmount": 40 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json.get("changeToken").is_none());
        assert_eq!(json["paymentToken"]["id"], json["originalToken"]["id"]);
    }

    #[tokio::test]
    async fn divide_unknown_token_is_404() {
        let node = test_node();
        let (status, _) = post_json(
            &node.router,
            "/divide",
            serde_json::json!({ "tokenId": TokenId::random(), "paymentAmount": 10 }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn redeem_credits_once_then_conflicts() {
        let node = test_node();
        let alice = Keypair::generate();
        let tokens = issue(&node, &alice, 100).await;
        let body = serde_json::json!({
            "presenter": alice.public_key(),
            "tokens": tokens,
        });

        let (status, resp) = post_json(&node.router, "/redeem", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let receipt: RedemptionReceipt = serde_json::from_slice(&resp).unwrap();
        assert_eq!(receipt.redeemed_total, 100);
        assert_eq!(node.ledger.balance_of(&alice.public_key()), 100);

        let (status, resp) = post_json(&node.router, "/redeem", body).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let err: ErrorResponse = serde_json::from_slice(&resp).unwrap();
        assert_eq!(err.class.as_deref(), Some("double_spend_detected"));
        assert_eq!(err.first_invalid_token_id, Some(tokens[0].id));
        assert_eq!(node.ledger.balance_of(&alice.public_key()), 100);
    }

    #[tokio::test]
    async fn redeem_by_stranger_is_refused() {
        let node = test_node();
        let alice = Keypair::generate();
        let tokens = issue(&node, &alice, 50).await;

        let (status, resp) = post_json(
            &node.router,
            "/redeem",
            serde_json::json!({
                "presenter": Keypair::generate().public_key(),
                "tokens": tokens,
                "provenance": [],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let err: ErrorResponse = serde_json::from_slice(&resp).unwrap();
        assert!(err.reason.is_some());
        assert_eq!(node.issuer.stats().redeemed_value, 0);
    }

    #[tokio::test]
    async fn sync_reports_per_record_verdicts() {
        let node = test_node();
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let tokens = issue(&node, &alice, 60).await;

        let good = TransferRecord::create(&alice, bob.public_key(), &tokens, Utc::now()).unwrap();
        let mut forged = good.clone();
        forged.id = uuid::Uuid::new_v4();
        forged.amount = 600;

        let (status, body) = post_json(
            &node.router,
            "/sync",
            serde_json::json!({ "transferRecords": [good, forged] }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let resp: SyncResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.per_record.len(), 2);
        assert_eq!(resp.per_record[0].status, SyncStatus::Synced);
        assert!(matches!(resp.per_record[1].status, SyncStatus::Failed { .. }));
        assert_eq!(
            node.issuer.get_token(&tokens[0].id).unwrap().status,
            TokenStatus::Spent
        );
    }

    #[tokio::test]
    async fn delegate_returns_verifiable_certificate() {
        let node = test_node();
        let holder = Keypair::generate().public_key();
        let delegate = Keypair::generate().public_key();

        let (status, body) = post_json(
            &node.router,
            "/delegate",
            serde_json::json!({
                "holder": holder,
                "delegate": delegate,
                "validUntil": Utc::now() + chrono::Duration::days(7),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let cert: DelegationCertificate = serde_json::from_slice(&body).unwrap();
        assert_eq!(cert.holder, holder);
        assert!(cert.verify(&node.issuer.public_key()));

        let (status, _) = post_json(
            &node.router,
            "/delegate",
            serde_json::json!({
                "holder": holder,
                "delegate": delegate,
                "validUntil": Utc::now() - chrono::Duration::days(1),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn token_lookup() {
        let node = test_node();
        let token = issue(&node, &Keypair::generate(), 10).await.remove(0);

        let (status, body) = get(&node.router, &format!("/tokens/{}", token.id)).await;
        assert_eq!(status, StatusCode::OK);
        let fetched: Token = serde_json::from_slice(&body).unwrap();
        assert_eq!(fetched, token);

        let (status, _) = get(&node.router, &format!("/tokens/{}", TokenId::random())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(&node.router, "/tokens/not-hex").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn class_to_status_mapping() {
        assert_eq!(status_for(ErrorClass::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorClass::InsufficientFunds), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(status_for(ErrorClass::DoubleSpendDetected), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorClass::TokenExpired), StatusCode::GONE);
        assert_eq!(status_for(ErrorClass::Signature), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            status_for(ErrorClass::TransportFailure),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}

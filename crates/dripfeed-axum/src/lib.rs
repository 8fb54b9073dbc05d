//! # dripfeed-axum
//!
//! HTTP surface for the payment channels and gift redemption. Handlers read
//! the raw request body so each gateway can authenticate it before a single
//! untrusted field is parsed. Once an event is durably recorded the response
//! is 2xx — replays included — so providers stop retrying; processing
//! failures after authentication are visible in logs, not in the response
//! (there is no dead-letter queue to park them in).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

use dripfeed_core::store::RedeemOutcome;
use dripfeed_engine::context::EngineContext;
use dripfeed_engine::gifts::GiftService;
use dripfeed_engine::reconciler::{PaymentReconciler, ReconcileOutcome};
use dripfeed_gateways::checkout::{self, CheckoutGateway};
use dripfeed_gateways::cryptopay::{self, CryptoPayGateway};
use dripfeed_gateways::external::{self, ExternalAction, ExternalGateway};
use dripfeed_gateways::GatewayError;

/// Shared handler state.
#[derive(Debug)]
pub struct WebhookState {
    ctx: Arc<EngineContext>,
    reconciler: PaymentReconciler,
    gifts: GiftService,
    checkout: CheckoutGateway,
    cryptopay: CryptoPayGateway,
    external: ExternalGateway,
}

/// The webhook application: construct once, mount its router.
pub struct DripWebhooks {
    state: Arc<WebhookState>,
}

impl DripWebhooks {
    pub fn new(
        ctx: Arc<EngineContext>,
        checkout: CheckoutGateway,
        cryptopay: CryptoPayGateway,
        external: ExternalGateway,
    ) -> Self {
        let state = Arc::new(WebhookState {
            reconciler: PaymentReconciler::new(ctx.clone()),
            gifts: GiftService::new(ctx.clone()),
            ctx,
            checkout,
            cryptopay,
            external,
        });
        Self { state }
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/webhooks/checkout", post(handle_checkout))
            .route("/webhooks/cryptopay", post(handle_cryptopay))
            .route("/webhooks/subscriptions", post(handle_external))
            .route("/gifts/redeem", post(handle_redeem))
            .with_state(self.state.clone())
    }

    /// Router with permissive CORS (development convenience).
    pub fn router_with_cors(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        self.router().layer(cors)
    }
}

// ─── Responses ───────────────────────────────────────────────────

fn ack(outcome: &ReconcileOutcome) -> Response {
    let label = match outcome {
        ReconcileOutcome::Granted => "granted",
        ReconcileOutcome::GiftMarkedPaid => "gift_paid",
        ReconcileOutcome::Replayed => "replayed",
        ReconcileOutcome::Rejected => "rejected",
    };
    (
        StatusCode::OK,
        Json(serde_json::json!({ "ok": true, "outcome": label })),
    )
        .into_response()
}

fn gateway_error_response(err: GatewayError) -> Response {
    let status = if err.is_auth_failure() {
        StatusCode::UNAUTHORIZED
    } else {
        match err {
            GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        }
    };
    (
        status,
        Json(serde_json::json!({ "ok": false, "error": err.code() })),
    )
        .into_response()
}

/// Apply a canonical event. Post-verification processing failures still ack
/// with 2xx so the provider does not retry forever; the failure lives in the
/// logs.
async fn apply_event(
    state: &WebhookState,
    event: dripfeed_core::event::GatewayEvent,
) -> Response {
    match state.reconciler.apply(event).await {
        Ok(outcome) => ack(&outcome),
        Err(e) => {
            error!(error = %e, "reconciliation failed after verification");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "ok": false, "error": "PROCESSING_FAILED" })),
            )
                .into_response()
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ─── Handlers ────────────────────────────────────────────────────

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_checkout(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = header(&headers, checkout::SIGNATURE_HEADER);
    match state.checkout.handle(signature, &body) {
        Ok(event) => apply_event(&state, event).await,
        Err(e) => {
            warn!(gateway = "checkout", error = %e, "webhook rejected");
            gateway_error_response(e)
        }
    }
}

async fn handle_cryptopay(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = header(&headers, cryptopay::SIGNATURE_HEADER);
    match state.cryptopay.handle(signature, &body) {
        Ok(Some(event)) => apply_event(&state, event).await,
        // Update types we do not process are acknowledged as-is.
        Ok(None) => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response(),
        Err(e) => {
            warn!(gateway = "cryptopay", error = %e, "webhook rejected");
            gateway_error_response(e)
        }
    }
}

async fn handle_external(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let now = state.ctx.clock.now();
    let signature = header(&headers, external::SIGNATURE_HEADER);
    let action = match state.external.handle(signature, &body, now) {
        Ok(action) => action,
        Err(e) => {
            warn!(gateway = "external", error = %e, "webhook rejected");
            return gateway_error_response(e);
        }
    };

    match action {
        ExternalAction::Acknowledge => {
            (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
        }
        ExternalAction::Grant {
            user_id,
            days,
            idempotency_key,
        } => {
            // A pending-external gift from this purchaser claims the payment.
            let event = match state
                .reconciler
                .resolve_external(&user_id, days, &idempotency_key)
                .await
            {
                Ok(event) => event,
                Err(e) => {
                    error!(error = %e, "external resolution failed");
                    return (
                        StatusCode::OK,
                        Json(serde_json::json!({ "ok": false, "error": "PROCESSING_FAILED" })),
                    )
                        .into_response();
                }
            };
            apply_event(&state, event).await
        }
    }
}

/// Gift redemption entry point — the deep-link payload lands here.
#[derive(Debug, Deserialize)]
struct RedeemRequest {
    token: String,
    user_id: String,
}

async fn handle_redeem(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<RedeemRequest>,
) -> Response {
    match state.gifts.redeem(&body.token, &body.user_id).await {
        Ok(RedeemOutcome::Redeemed(gift)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ok": true,
                "status": "redeemed",
                "days": gift.days,
            })),
        )
            .into_response(),
        Ok(RedeemOutcome::AlreadyRedeemed) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "ok": false, "error": "GIFT_ALREADY_REDEEMED" })),
        )
            .into_response(),
        Ok(RedeemOutcome::NotPaid) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "ok": false, "error": "GIFT_NOT_PAID" })),
        )
            .into_response(),
        Ok(RedeemOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "ok": false, "error": "GIFT_NOT_FOUND" })),
        )
            .into_response(),
        Err(dripfeed_core::error::DripError::Store(
            dripfeed_core::error::StoreError::NotFound(_),
        )) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "ok": false, "error": "USER_NOT_FOUND" })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "gift redemption failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "ok": false, "error": "INTERNAL_ERROR" })),
            )
                .into_response()
        }
    }
}

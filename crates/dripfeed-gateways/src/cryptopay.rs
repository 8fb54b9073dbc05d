// Crypto invoice gateway.
//
// Webhook signature scheme: the HMAC key is SHA256(api_token), the signature
// is HMAC-SHA256 over the raw body, hex-encoded, in the
// `crypto-pay-api-signature` header. Invoices carry our own JSON payload
// describing what the payment buys; the invoice id is the idempotency key.
//
// Invoice creation is an outbound HTTP call with a bounded timeout and runs
// from request contexts, never inside the scheduler tick.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use dripfeed_core::event::GatewayEvent;
use dripfeed_core::models::Plan;

use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "crypto-pay-api-signature";

const DEFAULT_API_URL: &str = "https://pay.crypt.bot/api";

/// Crypto gateway configuration.
#[derive(Debug, Clone)]
pub struct CryptoPayConfig {
    pub api_token: String,
    pub api_url: String,
}

impl CryptoPayConfig {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }
}

/// Verify a webhook body: `HMAC-SHA256(SHA256(token), body)` in hex.
pub fn verify_signature(
    body: &[u8],
    signature_hex: &str,
    api_token: &str,
) -> Result<(), GatewayError> {
    let secret = Sha256::digest(api_token.as_bytes());
    let mut mac =
        HmacSha256::new_from_slice(&secret).map_err(|_| GatewayError::InvalidSignature)?;
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature_hex.as_bytes()).into() {
        Ok(())
    } else {
        Err(GatewayError::InvalidSignature)
    }
}

/// What an invoice pays for. Serialized into the invoice's `payload` field
/// at creation time and read back on the paid webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Subscription,
    Gift,
}

/// Our own payload embedded in each invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicePayload {
    pub kind: PayloadKind,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gift_token: Option<String>,
}

/// A webhook update from the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoPayUpdate {
    pub update_type: String,
    pub payload: InvoiceObject,
}

/// The invoice object inside an update.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub invoice_id: i64,
    #[serde(default)]
    pub status: Option<String>,
    /// Our serialized [`InvoicePayload`].
    #[serde(default)]
    pub payload: Option<String>,
}

/// Parse the (already authenticated) webhook body.
pub fn parse_update(body: &[u8]) -> Result<CryptoPayUpdate, GatewayError> {
    serde_json::from_slice(body).map_err(|e| GatewayError::MalformedPayload(e.to_string()))
}

/// Map an update to the canonical event. `Ok(None)` acknowledges update
/// types we do not process.
pub fn map_event(
    update: &CryptoPayUpdate,
    plans: &[Plan],
) -> Result<Option<GatewayEvent>, GatewayError> {
    if update.update_type != "invoice_paid" {
        return Ok(None);
    }

    let raw = update
        .payload
        .payload
        .as_deref()
        .ok_or_else(|| GatewayError::MalformedPayload("invoice has no payload".into()))?;
    let payload: InvoicePayload =
        serde_json::from_str(raw).map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;

    let idempotency_key = format!("cryptopay:{}", update.payload.invoice_id);

    match payload.kind {
        PayloadKind::Subscription => {
            let days = match (payload.days, payload.plan_id.as_deref()) {
                (Some(days), _) => days,
                (None, Some(plan_id)) => {
                    plans
                        .iter()
                        .find(|p| p.id == plan_id)
                        .ok_or_else(|| GatewayError::UnknownPlan(plan_id.to_string()))?
                        .days
                }
                (None, None) => {
                    return Err(GatewayError::MalformedPayload(
                        "subscription payload without days or plan_id".into(),
                    ))
                }
            };
            Ok(Some(GatewayEvent::SubscriptionGrant {
                user_id: payload.user_id,
                days,
                idempotency_key,
            }))
        }
        PayloadKind::Gift => {
            let token = payload
                .gift_token
                .ok_or_else(|| GatewayError::MalformedPayload("gift payload without token".into()))?;
            Ok(Some(GatewayEvent::GiftPurchase {
                token,
                idempotency_key,
            }))
        }
    }
}

/// The full verify → parse → map pipeline.
#[derive(Debug, Clone)]
pub struct CryptoPayGateway {
    config: CryptoPayConfig,
    plans: Vec<Plan>,
}

impl CryptoPayGateway {
    pub fn new(config: CryptoPayConfig, plans: Vec<Plan>) -> Self {
        Self { config, plans }
    }

    /// Handle an inbound webhook. `Ok(None)` means "acknowledge, nothing to
    /// apply".
    pub fn handle(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<Option<GatewayEvent>, GatewayError> {
        let signature = signature.ok_or(GatewayError::MissingSignature)?;
        verify_signature(body, signature, &self.config.api_token).inspect_err(|_| {
            warn!(gateway = "cryptopay", "security: rejected unverifiable payload");
        })?;
        let update = parse_update(body)?;
        map_event(&update, &self.plans)
    }
}

// ─── Invoice creation client ─────────────────────────────────────

/// Parameters for a new invoice.
#[derive(Debug, Clone)]
pub struct CreateInvoiceRequest {
    /// Price in minor units of `currency`.
    pub amount_minor: i64,
    pub currency: String,
    pub description: String,
    pub payload: InvoicePayload,
    /// URL for the provider's "return to app" button.
    pub return_url: Option<String>,
}

/// A created invoice.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedInvoice {
    pub invoice_id: i64,
    #[serde(rename = "bot_invoice_url")]
    pub pay_url: String,
    #[serde(default, rename = "mini_app_invoice_url")]
    pub mini_app_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

/// Outbound client for the invoice API. Requests use a 10-second timeout so
/// a stalled provider can never stall the caller indefinitely.
#[derive(Debug, Clone)]
pub struct CryptoPayClient {
    http: reqwest::Client,
    config: CryptoPayConfig,
}

impl CryptoPayClient {
    pub fn new(config: CryptoPayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        Ok(Self { http, config })
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, GatewayError> {
        let url = format!("{}/{}", self.config.api_url, method);
        let response = self
            .http
            .post(&url)
            .header("Crypto-Pay-API-Token", &self.config.api_token)
            .json(&params)
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(gateway = "cryptopay", %status, "invoice API error: {body}");
            return Err(GatewayError::Http(format!("{method}: HTTP {status}")));
        }

        let envelope: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        if !envelope.ok {
            return Err(GatewayError::Http(
                envelope.error.unwrap_or_else(|| format!("{method} failed")),
            ));
        }
        envelope
            .result
            .ok_or_else(|| GatewayError::Http(format!("{method}: empty result")))
    }

    /// Create a fiat-denominated invoice payable in crypto.
    pub async fn create_invoice(
        &self,
        request: CreateInvoiceRequest,
    ) -> Result<CreatedInvoice, GatewayError> {
        let payload = serde_json::to_string(&request.payload)
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        let params = serde_json::json!({
            "currency_type": "fiat",
            "fiat": request.currency,
            "amount": format!("{}.{:02}", request.amount_minor / 100, request.amount_minor % 100),
            "description": request.description,
            "payload": payload,
            "paid_btn_name": "callback",
            "paid_btn_url": request.return_url.unwrap_or_else(|| "https://t.me".to_string()),
        });

        let invoice: CreatedInvoice = self.request("createInvoice", params).await?;
        info!(gateway = "cryptopay", invoice = invoice.invoice_id, "invoice created");
        Ok(invoice)
    }

    /// Connectivity probe.
    pub async fn test_connection(&self) -> bool {
        self.request::<serde_json::Value>("getMe", serde_json::json!({}))
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dripfeed_core::options::default_plans;

    fn sign(body: &[u8], token: &str) -> String {
        let secret = Sha256::digest(token.as_bytes());
        let mut mac = HmacSha256::new_from_slice(&secret).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn paid_update(payload: &InvoicePayload) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "update_type": "invoice_paid",
            "payload": {
                "invoice_id": 42,
                "status": "paid",
                "payload": serde_json::to_string(payload).unwrap(),
            }
        }))
        .unwrap()
    }

    #[test]
    fn signature_round_trip() {
        let body = br#"{"update_type":"invoice_paid"}"#;
        let sig = sign(body, "token-1");
        assert!(verify_signature(body, &sig, "token-1").is_ok());
        // Wrong token, wrong body: both rejected.
        assert!(verify_signature(body, &sig, "token-2").is_err());
        assert!(verify_signature(b"{}", &sig, "token-1").is_err());
    }

    #[test]
    fn subscription_payload_maps_to_grant() {
        let payload = InvoicePayload {
            kind: PayloadKind::Subscription,
            user_id: "u1".into(),
            plan_id: Some("month".into()),
            days: Some(30),
            gift_token: None,
        };
        let body = paid_update(&payload);
        let update = parse_update(&body).unwrap();
        let event = map_event(&update, &default_plans()).unwrap().unwrap();
        assert_eq!(
            event,
            GatewayEvent::SubscriptionGrant {
                user_id: "u1".into(),
                days: 30,
                idempotency_key: "cryptopay:42".into(),
            }
        );
    }

    #[test]
    fn days_fall_back_to_plan_catalog() {
        let payload = InvoicePayload {
            kind: PayloadKind::Subscription,
            user_id: "u1".into(),
            plan_id: Some("week".into()),
            days: None,
            gift_token: None,
        };
        let update = parse_update(&paid_update(&payload)).unwrap();
        let event = map_event(&update, &default_plans()).unwrap().unwrap();
        assert!(matches!(
            event,
            GatewayEvent::SubscriptionGrant { days: 7, .. }
        ));
    }

    #[test]
    fn gift_payload_maps_to_gift_purchase() {
        let payload = InvoicePayload {
            kind: PayloadKind::Gift,
            user_id: "buyer".into(),
            plan_id: None,
            days: None,
            gift_token: Some("tok1".into()),
        };
        let update = parse_update(&paid_update(&payload)).unwrap();
        let event = map_event(&update, &default_plans()).unwrap().unwrap();
        assert_eq!(
            event,
            GatewayEvent::GiftPurchase {
                token: "tok1".into(),
                idempotency_key: "cryptopay:42".into(),
            }
        );
    }

    #[test]
    fn non_paid_updates_are_acknowledged_without_event() {
        let body = serde_json::to_vec(&serde_json::json!({
            "update_type": "invoice_expired",
            "payload": { "invoice_id": 7 }
        }))
        .unwrap();
        let update = parse_update(&body).unwrap();
        assert!(map_event(&update, &default_plans()).unwrap().is_none());
    }

    #[test]
    fn missing_inner_payload_is_malformed() {
        let body = serde_json::to_vec(&serde_json::json!({
            "update_type": "invoice_paid",
            "payload": { "invoice_id": 7 }
        }))
        .unwrap();
        let update = parse_update(&body).unwrap();
        assert!(matches!(
            map_event(&update, &default_plans()),
            Err(GatewayError::MalformedPayload(_))
        ));
    }

    #[test]
    fn gateway_rejects_missing_or_bad_signature() {
        let gateway = CryptoPayGateway::new(CryptoPayConfig::new("token-1"), default_plans());
        let payload = InvoicePayload {
            kind: PayloadKind::Subscription,
            user_id: "u1".into(),
            plan_id: None,
            days: Some(30),
            gift_token: None,
        };
        let body = paid_update(&payload);

        assert!(matches!(
            gateway.handle(None, &body),
            Err(GatewayError::MissingSignature)
        ));
        assert!(matches!(
            gateway.handle(Some("deadbeef"), &body),
            Err(GatewayError::InvalidSignature)
        ));

        let sig = sign(&body, "token-1");
        assert!(gateway.handle(Some(&sig), &body).unwrap().is_some());
    }

    #[test]
    fn invoice_amount_formatting() {
        // 15900 minor units render as "159.00".
        assert_eq!(format!("{}.{:02}", 15900 / 100, 15900 % 100), "159.00");
        assert_eq!(format!("{}.{:02}", 99905 / 100, 99905 % 100), "999.05");
    }
}

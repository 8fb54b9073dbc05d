// External subscription-provider gateway.
//
// The provider runs its own checkout and notifies us over a webhook signed
// with HMAC-SHA256(api_key, body), hex-encoded. Grant length prefers the
// explicit expiry in the payload over the named period; cancellations are
// acknowledged without touching the ledger — access runs to its paid expiry.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::warn;

use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "x-provider-signature";

/// Longest grant a single confirmation can produce, in days.
const MAX_GRANT_DAYS: i64 = 365;

/// External gateway configuration.
#[derive(Debug, Clone)]
pub struct ExternalConfig {
    pub api_key: String,
}

/// Verify a webhook body: `HMAC-SHA256(api_key, body)` in hex.
pub fn verify_signature(
    body: &[u8],
    signature_hex: &str,
    api_key: &str,
) -> Result<(), GatewayError> {
    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .map_err(|_| GatewayError::InvalidSignature)?;
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature_hex.as_bytes()).into() {
        Ok(())
    } else {
        Err(GatewayError::InvalidSignature)
    }
}

/// Webhook envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalWebhook {
    /// `new_subscription`, `subscription_renewed`, `subscription_canceled`.
    pub name: String,
    pub payload: ExternalPayload,
}

/// Subscription payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalPayload {
    pub subscription_id: i64,
    pub period_id: i64,
    /// Named billing period: `week`, `month`, `3months`, `year`, `onetime`.
    pub period: String,
    /// The subscriber in our user space.
    pub user_id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// What an authenticated webhook asks us to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalAction {
    Grant {
        user_id: String,
        days: i64,
        idempotency_key: String,
    },
    /// Event acknowledged, nothing to apply.
    Acknowledge,
}

/// Days to grant for a period, preferring the explicit expiry. Clamped to
/// `1..=365` so an "until forever" one-time period cannot mint a century.
pub fn period_to_days(period: &str, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    if let Some(expires) = expires_at {
        let seconds = (expires - now).num_seconds();
        let days = (seconds + 86_399).div_euclid(86_400); // ceil
        return days.clamp(1, MAX_GRANT_DAYS);
    }

    match period.to_lowercase().as_str() {
        "week" => 7,
        "month" => 30,
        "3months" => 90,
        "year" => 365,
        "onetime" => 365,
        _ => 30,
    }
}

/// Parse the (already authenticated) webhook body.
pub fn parse_webhook(body: &[u8]) -> Result<ExternalWebhook, GatewayError> {
    serde_json::from_slice(body).map_err(|e| GatewayError::MalformedPayload(e.to_string()))
}

/// Decide the action for a webhook.
pub fn map_action(webhook: &ExternalWebhook, now: DateTime<Utc>) -> ExternalAction {
    match webhook.name.as_str() {
        "new_subscription" | "subscription_renewed" => {
            let payload = &webhook.payload;
            ExternalAction::Grant {
                user_id: payload.user_id.clone(),
                days: period_to_days(&payload.period, payload.expires_at, now),
                idempotency_key: format!(
                    "extsub:{}:{}",
                    payload.subscription_id, payload.period_id
                ),
            }
        }
        // Cancellation keeps access until the already-paid expiry.
        _ => ExternalAction::Acknowledge,
    }
}

/// The full verify → parse → map pipeline.
#[derive(Debug, Clone)]
pub struct ExternalGateway {
    config: ExternalConfig,
}

impl ExternalGateway {
    pub fn new(config: ExternalConfig) -> Self {
        Self { config }
    }

    pub fn handle(
        &self,
        signature: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<ExternalAction, GatewayError> {
        let signature = signature.ok_or(GatewayError::MissingSignature)?;
        verify_signature(body, signature, &self.config.api_key).inspect_err(|_| {
            warn!(gateway = "external", "security: rejected unverifiable payload");
        })?;
        let webhook = parse_webhook(body)?;
        Ok(map_action(&webhook, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn sign(body: &[u8], key: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn webhook_body(name: &str, period: &str, expires_at: Option<&str>) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "name": name,
            "payload": {
                "subscription_id": 11,
                "period_id": 3,
                "period": period,
                "user_id": "u1",
                "expires_at": expires_at,
            }
        }))
        .unwrap()
    }

    #[test]
    fn signature_round_trip() {
        let body = webhook_body("new_subscription", "month", None);
        let sig = sign(&body, "key-1");
        assert!(verify_signature(&body, &sig, "key-1").is_ok());
        assert!(verify_signature(&body, &sig, "key-2").is_err());
        assert!(verify_signature(&body, "00ff", "key-1").is_err());
    }

    #[test]
    fn explicit_expiry_beats_named_period() {
        let now = at("2025-06-01T00:00:00Z");
        // 10 days out, period says "month": expiry wins.
        assert_eq!(
            period_to_days("month", Some(at("2025-06-11T00:00:00Z")), now),
            10
        );
        // Partial day rounds up.
        assert_eq!(
            period_to_days("month", Some(at("2025-06-02T06:00:00Z")), now),
            2
        );
    }

    #[test]
    fn expiry_is_clamped() {
        let now = at("2025-06-01T00:00:00Z");
        // "Forever" one-time periods cap at a year.
        assert_eq!(
            period_to_days("onetime", Some(at("2125-06-01T00:00:00Z")), now),
            365
        );
        // Already-past expiry still grants the minimum single day.
        assert_eq!(
            period_to_days("month", Some(at("2025-05-01T00:00:00Z")), now),
            1
        );
    }

    #[test]
    fn named_period_fallbacks() {
        let now = at("2025-06-01T00:00:00Z");
        assert_eq!(period_to_days("week", None, now), 7);
        assert_eq!(period_to_days("MONTH", None, now), 30);
        assert_eq!(period_to_days("3months", None, now), 90);
        assert_eq!(period_to_days("year", None, now), 365);
        assert_eq!(period_to_days("onetime", None, now), 365);
        assert_eq!(period_to_days("fortnight", None, now), 30);
    }

    #[test]
    fn renewal_maps_to_grant_with_stable_key() {
        let now = at("2025-06-01T00:00:00Z");
        let body = webhook_body("subscription_renewed", "week", None);
        let webhook = parse_webhook(&body).unwrap();
        assert_eq!(
            map_action(&webhook, now),
            ExternalAction::Grant {
                user_id: "u1".into(),
                days: 7,
                idempotency_key: "extsub:11:3".into(),
            }
        );
    }

    #[test]
    fn cancellation_is_acknowledged_only() {
        let now = at("2025-06-01T00:00:00Z");
        let body = webhook_body("subscription_canceled", "month", None);
        let webhook = parse_webhook(&body).unwrap();
        assert_eq!(map_action(&webhook, now), ExternalAction::Acknowledge);

        let body = webhook_body("some_future_event", "month", None);
        let webhook = parse_webhook(&body).unwrap();
        assert_eq!(map_action(&webhook, now), ExternalAction::Acknowledge);
    }

    #[test]
    fn gateway_pipeline_requires_authentication() {
        let gateway = ExternalGateway::new(ExternalConfig {
            api_key: "key-1".into(),
        });
        let now = at("2025-06-01T00:00:00Z");
        let body = webhook_body("new_subscription", "month", None);

        assert!(matches!(
            gateway.handle(None, &body, now),
            Err(GatewayError::MissingSignature)
        ));
        assert!(matches!(
            gateway.handle(Some("bad"), &body, now),
            Err(GatewayError::InvalidSignature)
        ));

        let sig = sign(&body, "key-1");
        assert!(matches!(
            gateway.handle(Some(&sig), &body, now).unwrap(),
            ExternalAction::Grant { days: 30, .. }
        ));
    }
}

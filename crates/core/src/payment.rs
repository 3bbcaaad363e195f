//! Payment verification
//!
//! Settlement itself happens off-relay. The [`PaymentVerifier`] contract is
//! `verify → settle → record`: the relay asks the facilitator to verify and
//! settle a payment payload, then records the returned receipt in the
//! ledger row the payment funded.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{CoreError, Result};

/// Outcome of a verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Settled { receipt: String },
    Insufficient,
    Expired,
    Fraudulent,
}

#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    /// Verifies and settles `payload` against the required amount.
    async fn verify(
        &self,
        required_atomic: u128,
        payload: &serde_json::Value,
    ) -> Result<PaymentOutcome>;
}

#[derive(Debug, Deserialize)]
struct FacilitatorResponse {
    settled: bool,
    #[serde(default)]
    receipt: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Facilitator speaking the x402 verify/settle flow over HTTP.
#[derive(Clone)]
pub struct HttpFacilitator {
    base_url: String,
    http: reqwest::Client,
}

impl HttpFacilitator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn post(
        &self,
        endpoint: &str,
        required_atomic: u128,
        payload: &serde_json::Value,
    ) -> Result<FacilitatorResponse> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let body = serde_json::json!({
            "requiredAtomic": required_atomic.to_string(),
            "payload": payload,
        });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("facilitator {endpoint}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                CoreError::Transient(format!("facilitator {endpoint}: {status} {message}"))
            } else {
                CoreError::PaymentInvalid(format!("facilitator {endpoint}: {status} {message}"))
            });
        }
        resp.json()
            .await
            .map_err(|e| CoreError::Backend(format!("facilitator {endpoint} response: {e}")))
    }
}

#[async_trait]
impl PaymentVerifier for HttpFacilitator {
    async fn verify(
        &self,
        required_atomic: u128,
        payload: &serde_json::Value,
    ) -> Result<PaymentOutcome> {
        let verified = self.post("verify", required_atomic, payload).await?;
        if !verified.settled {
            debug!(reason = ?verified.reason, "payment verify rejected");
            return Ok(match verified.reason.as_deref() {
                Some("insufficient") => PaymentOutcome::Insufficient,
                Some("expired") => PaymentOutcome::Expired,
                _ => PaymentOutcome::Fraudulent,
            });
        }

        let settled = self.post("settle", required_atomic, payload).await?;
        match (settled.settled, settled.receipt) {
            (true, Some(receipt)) => Ok(PaymentOutcome::Settled { receipt }),
            (true, None) => Err(CoreError::Backend(
                "facilitator settled without a receipt".into(),
            )),
            (false, _) => Ok(match settled.reason.as_deref() {
                Some("insufficient") => PaymentOutcome::Insufficient,
                Some("expired") => PaymentOutcome::Expired,
                _ => PaymentOutcome::Fraudulent,
            }),
        }
    }
}

/// Verifier with a fixed outcome; test wiring only.
pub struct StaticVerifier(pub PaymentOutcome);

#[async_trait]
impl PaymentVerifier for StaticVerifier {
    async fn verify(&self, _required: u128, _payload: &serde_json::Value) -> Result<PaymentOutcome> {
        Ok(self.0.clone())
    }
}

/// Verifier used when no facilitator is configured: every paid flow fails.
pub struct DisabledVerifier;

#[async_trait]
impl PaymentVerifier for DisabledVerifier {
    async fn verify(&self, _required: u128, _payload: &serde_json::Value) -> Result<PaymentOutcome> {
        Err(CoreError::Disabled("payment facilitator".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn settled_flow_returns_receipt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .and(body_partial_json(
                serde_json::json!({"requiredAtomic": "1000"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"settled":true}"#))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"settled":true,"receipt":"rcpt-1"}"#),
            )
            .mount(&server)
            .await;

        let verifier = HttpFacilitator::new(server.uri());
        let outcome = verifier
            .verify(1000, &serde_json::json!({"tx": "0xabc"}))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PaymentOutcome::Settled {
                receipt: "rcpt-1".into()
            }
        );
    }

    #[tokio::test]
    async fn insufficient_payment_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"settled":false,"reason":"insufficient"}"#),
            )
            .mount(&server)
            .await;

        let verifier = HttpFacilitator::new(server.uri());
        let outcome = verifier.verify(1000, &serde_json::json!({})).await.unwrap();
        assert_eq!(outcome, PaymentOutcome::Insufficient);
    }

    #[tokio::test]
    async fn facilitator_5xx_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let verifier = HttpFacilitator::new(server.uri());
        let err = verifier.verify(1, &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, CoreError::Transient(_)));
    }

    #[tokio::test]
    async fn unknown_rejection_reason_is_fraudulent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"settled":false}"#),
            )
            .mount(&server)
            .await;

        let verifier = HttpFacilitator::new(server.uri());
        let outcome = verifier.verify(1, &serde_json::json!({})).await.unwrap();
        assert_eq!(outcome, PaymentOutcome::Fraudulent);
    }
}

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::WebhookError;
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

/// The subset of a GitHub `pull_request` webhook payload the daemon acts
/// on. Every other field GitHub sends is ignored by `serde`'s default
/// "unknown fields are dropped" behavior.
#[derive(Debug, Deserialize)]
pub struct PullRequestWebhookPayload {
    pub action: String,
    pub repository: RepositoryPayload,
    pub pull_request: PullRequestPayload,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryPayload {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestPayload {
    pub number: u64,
}

/// The response shape a caller renders back to GitHub: `{message,
/// tasksArchived}` exactly as spec §6/§8 scenario 6 names it.
#[derive(Debug, serde::Serialize)]
pub struct WebhookResult {
    pub message: String,
    #[serde(rename = "tasksArchived")]
    pub tasks_archived: u32,
}

/// Verifies GitHub's `X-Hub-Signature-256` header (`sha256=<hex hmac>`)
/// against the raw request body using the configured webhook secret, in
/// constant time. A mismatched or malformed header is indistinguishable
/// from a missing one to the caller — both are `InvalidSignature`.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> Result<(), WebhookError> {
    let hex_digest = signature_header
        .strip_prefix("sha256=")
        .ok_or(WebhookError::InvalidSignature)?;

    let expected = hex::decode(hex_digest).map_err(|_| WebhookError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    if computed.ct_eq(&expected).into() {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

/// Handles a signature-verified `pull_request` webhook body: on `closed`,
/// archives every Variant tied to the closed PR number on that repository
/// (spec §8 scenario 6). Any other action is a no-op that still reports
/// zero archived tasks rather than an error — GitHub sends many
/// `pull_request` actions the daemon doesn't care about.
pub async fn handle_pull_request_event(
    store: &dyn Store,
    body: &[u8],
) -> Result<WebhookResult, WebhookError> {
    let payload: PullRequestWebhookPayload =
        serde_json::from_slice(body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

    if payload.action != "closed" {
        return Ok(WebhookResult {
            message: "Ignored".to_string(),
            tasks_archived: 0,
        });
    }

    let archived = store
        .archive_by_pull_request(&payload.repository.full_name, payload.pull_request.number)
        .await?;

    Ok(WebhookResult {
        message: "Success".to_string(),
        tasks_archived: archived,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_a_correctly_signed_body() {
        let body = br#"{"action":"closed"}"#;
        let header = sign("shh", body);
        assert!(verify_signature("shh", body, &header).is_ok());
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = br#"{"action":"closed"}"#;
        let header = sign("shh", body);
        assert!(verify_signature("other", body, &header).is_err());
    }

    #[test]
    fn rejects_malformed_header() {
        let body = br#"{"action":"closed"}"#;
        assert!(verify_signature("shh", body, "not-a-signature").is_err());
    }

    #[test]
    fn rejects_tampered_body() {
        let body = br#"{"action":"closed"}"#;
        let header = sign("shh", body);
        let tampered = br#"{"action":"opened"}"#;
        assert!(verify_signature("shh", tampered, &header).is_err());
    }
}

//! Telephony provider boundary (§6): the REST client that starts outbound calls, and
//! signature verification for the provider's inbound status webhook. The inbound/outbound
//! WebSocket media protocol lives in [`crate::web::telephony_ws`] — this module only covers
//! the plain-HTTP surfaces.
//!
//! [`TelephonyClient::start_call`] uses a request-with-retry HTTP adapter shape, and webhook
//! signatures are checked with the same hand-rolled constant-time HMAC comparison the
//! admin transport's sign-then-verify handshake uses.

use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::admin::vault::{decrypt_credentials, VaultKey};
use crate::ai::UpstreamError;
use crate::db::models::Phone;
use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TelephonyError {
    #[error("invalid stored credential envelope: {0}")]
    InvalidCredentials(String),
    #[error("malformed basic-auth credential string: expected \"user:pass\"")]
    MalformedCredentialString,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Validate a phone number against E.164 (`+` followed by 2-15 digits, first digit 1-9):
/// `^\+[1-9]\d{1,14}$`. The orchestrator refuses any non-conforming number (§3, §7).
pub fn is_valid_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    if digits.is_empty() || digits.len() > 15 {
        return false;
    }
    let mut chars = digits.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() && c != '0' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_digit())
}

/// Decrypted `Phone.encrypted_credentials`, split into the Basic-auth user/pass pair used
/// against the provider's REST API (§6).
pub struct PhoneCredentials {
    pub account_sid: String,
    pub auth_token: String,
}

/// Decrypt a [`Phone`]'s at-rest credentials using the master key delivered through the
/// admin bootstrap transport (§1a, §6a).
pub fn decrypt_phone_credentials(phone: &Phone, vault_key: &VaultKey) -> Result<PhoneCredentials, TelephonyError> {
    let plaintext = decrypt_credentials(vault_key, &phone.encrypted_credentials)
        .map_err(|e| TelephonyError::InvalidCredentials(e.to_string()))?;
    let (account_sid, auth_token) = plaintext
        .split_once(':')
        .ok_or(TelephonyError::MalformedCredentialString)?;
    Ok(PhoneCredentials {
        account_sid: account_sid.to_string(),
        auth_token: auth_token.to_string(),
    })
}

#[derive(Debug, Serialize)]
struct StartCallRequest<'a> {
    #[serde(rename = "From")]
    from: &'a str,
    #[serde(rename = "To")]
    to: &'a str,
    #[serde(rename = "CallerId")]
    caller_id: &'a str,
    #[serde(rename = "Url")]
    url: &'a str,
    #[serde(rename = "StatusCallback")]
    status_callback: &'a str,
    #[serde(rename = "StatusCallbackMethod")]
    status_callback_method: &'a str,
    #[serde(rename = "StatusCallbackEvent")]
    status_callback_event: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
pub struct StartCallResponse {
    #[serde(rename = "Sid")]
    pub sid: String,
}

/// REST client for `Calls/connect` (§6). One instance is shared across the Outbound
/// Controller; authentication is passed per-call since each [`Phone`] carries its own
/// provider credentials.
#[derive(Debug)]
pub struct TelephonyClient {
    http: Client,
    base_url: String,
}

const STATUS_CALLBACK_EVENTS: &[&str] = &["initiated", "ringing", "answered", "completed"];

impl TelephonyClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Start an outbound call. `callback_url` is this orchestrator's public telephony-WS
    /// endpoint; `status_callback_url` is the status-webhook endpoint verified in
    /// [`verify_webhook_signature`].
    pub async fn start_call(
        &self,
        credentials: &PhoneCredentials,
        from: &str,
        to: &str,
        callback_url: &str,
        status_callback_url: &str,
    ) -> Result<StartCallResponse, TelephonyError> {
        let request = StartCallRequest {
            from,
            to,
            caller_id: from,
            url: callback_url,
            status_callback: status_callback_url,
            status_callback_method: "POST",
            status_callback_event: STATUS_CALLBACK_EVENTS,
        };

        let response = self
            .http
            .post(format!("{}/Calls/connect", self.base_url))
            .basic_auth(&credentials.account_sid, Some(&credentials.auth_token))
            .form(&request)
            .send()
            .await
            .map_err(|e| TelephonyError::Upstream(UpstreamError::from_reqwest(&e)))?;

        if response.status().is_success() {
            response
                .json::<StartCallResponse>()
                .await
                .map_err(|e| TelephonyError::Upstream(UpstreamError::Fatal(format!("unparseable response: {e}"))))
        } else {
            let status = response.status();
            let transient = status.is_server_error() || status.as_u16() == 429;
            Err(TelephonyError::Upstream(if transient {
                UpstreamError::Transient(format!("http {status}"))
            } else {
                UpstreamError::Fatal(format!("http {status}"))
            }))
        }
    }
}

/// Raw telephony status-webhook body, sufficient to drive [`crate::scheduler::classify_failure`]
/// and [`crate::db::CallRepo::mark_ended`] (§6).
#[derive(Debug, Deserialize)]
pub struct StatusCallback {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
    #[serde(rename = "CallDuration")]
    pub call_duration: Option<i64>,
    #[serde(rename = "RecordingUrl")]
    pub recording_url: Option<String>,
}

/// Verify the HMAC-SHA256 signature of a status-webhook body against the per-[`Phone`]
/// `webhook_secret`, comparing constant-time (§6). The caller passes the raw request body
/// bytes, not a re-serialized form, since re-serialization can silently change byte layout.
pub fn verify_webhook_signature(webhook_secret: &str, raw_body: &[u8], signature_header: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(webhook_secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    let expected = mac.finalize().into_bytes();

    let Ok(provided) = hex::decode(signature_header) else {
        return false;
    };
    if provided.len() != expected.len() {
        return false;
    }

    // Constant-time comparison: XOR every byte and OR the results together so execution
    // time doesn't depend on where the first mismatch occurs.
    let mut diff: u8 = 0;
    for (a, b) in expected.iter().zip(provided.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

impl From<TelephonyError> for AppError {
    fn from(err: TelephonyError) -> Self {
        match err {
            TelephonyError::InvalidCredentials(_) | TelephonyError::MalformedCredentialString => {
                AppError::internal(err.to_string())
            }
            TelephonyError::Upstream(e) => AppError::from(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::vault::encrypt_credentials;

    #[test]
    fn e164_accepts_conforming_numbers() {
        assert!(is_valid_e164("+15551234567"));
        assert!(is_valid_e164("+447911123456"));
        assert!(is_valid_e164("+1"));
    }

    #[test]
    fn e164_rejects_malformed_numbers() {
        assert!(!is_valid_e164("15551234567")); // missing leading +
        assert!(!is_valid_e164("+0123456789")); // leading zero after +
        assert!(!is_valid_e164("+1 555 123 4567")); // spaces
        assert!(!is_valid_e164("+")); // no digits
        assert!(!is_valid_e164("+1234567890123456")); // 16 digits, over the cap
        assert!(!is_valid_e164("")); // empty
    }

    #[test]
    fn decrypt_phone_credentials_splits_user_and_password() {
        let key = VaultKey::from_bytes(&[3u8; 32]).unwrap();
        let envelope = encrypt_credentials(&key, "ACxxxx:secret-token").unwrap();
        let phone = Phone {
            id: "p1".into(),
            e164: "+15551234567".into(),
            provider: "test".into(),
            encrypted_credentials: envelope,
            webhook_secret_ref: "ref".into(),
            active: true,
            created_at: chrono::Utc::now(),
        };
        let creds = decrypt_phone_credentials(&phone, &key).unwrap();
        assert_eq!(creds.account_sid, "ACxxxx");
        assert_eq!(creds.auth_token, "secret-token");
    }

    #[test]
    fn webhook_signature_roundtrips_and_rejects_tampering() {
        let secret = "whsec_test";
        let body = br#"{"CallSid":"CA123","CallStatus":"completed"}"#;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig_hex: String = mac.finalize().into_bytes().iter().map(|b| format!("{b:02x}")).collect();

        assert!(verify_webhook_signature(secret, body, &sig_hex));
        assert!(!verify_webhook_signature(secret, body, "00"));
        assert!(!verify_webhook_signature("wrong-secret", body, &sig_hex));
    }
}

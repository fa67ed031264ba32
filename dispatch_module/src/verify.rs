use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::payload::WebhookPayload;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("bad_json")]
    Decode(#[source] serde_json::Error),
    #[error("{0}")]
    Authentication(&'static str),
}

impl VerifyError {
    pub fn status_code(&self) -> u16 {
        match self {
            VerifyError::Decode(_) => 400,
            VerifyError::Authentication(_) => 403,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            VerifyError::Decode(_) => "bad_json",
            VerifyError::Authentication(reason) => reason,
        }
    }
}

/// Decodes the body, then checks its `<algo>=<hex>` signature when a
/// secret is configured.
pub fn verify_payload(
    secret: Option<&str>,
    signature_header: Option<&str>,
    raw_body: &[u8],
) -> Result<WebhookPayload, VerifyError> {
    let payload: WebhookPayload = serde_json::from_slice(raw_body).map_err(|err| {
        debug!("cannot decode payload: {}", err);
        VerifyError::Decode(err)
    })?;

    match secret.filter(|secret| !secret.is_empty()) {
        Some(secret) => verify_signature(secret, signature_header, raw_body)
            .map_err(VerifyError::Authentication)?,
        None => warn!("payload signature can't be verified without a secret"),
    }
    Ok(payload)
}

pub fn verify_signature(
    secret: &str,
    signature_header: Option<&str>,
    raw_body: &[u8],
) -> Result<(), &'static str> {
    let header = signature_header
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or("missing_signature")?;
    let (algorithm, signature) = header.split_once('=').ok_or("invalid_signature")?;
    let signature = hex::decode(signature).map_err(|_| "invalid_signature")?;

    let verified = match algorithm.to_ascii_lowercase().as_str() {
        "sha1" => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(secret.as_bytes()).map_err(|_| "bad_secret")?;
            mac.update(raw_body);
            mac.verify_slice(&signature).is_ok()
        }
        "sha256" => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| "bad_secret")?;
            mac.update(raw_body);
            mac.verify_slice(&signature).is_ok()
        }
        _ => return Err("unsupported_digest"),
    };
    if !verified {
        debug!("invalid {} signature", algorithm);
        return Err("invalid_signature");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"foo":"bar"}"#;

    fn sign_sha256(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_correct_sha1_signature() {
        let header = "sha1=0926645a0a0c02e16da2bc6c4a66b5ca1a2eba93";
        assert!(verify_signature("s", Some(header), BODY).is_ok());
        assert!(verify_payload(Some("s"), Some(header), BODY).is_ok());
    }

    #[test]
    fn rejects_wrong_sha1_signature() {
        let err = verify_payload(Some("s"), Some("sha1=deadbeef"), BODY).unwrap_err();
        assert!(matches!(err, VerifyError::Authentication("invalid_signature")));
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn accepts_sha256_signature() {
        let header = sign_sha256("s", BODY);
        assert!(verify_signature("s", Some(&header), BODY).is_ok());
        assert_eq!(
            verify_signature("other", Some(&header), BODY),
            Err("invalid_signature")
        );
    }

    #[test]
    fn bad_json_is_reported_before_signature() {
        let err = verify_payload(Some("s"), Some("sha1=deadbeef"), b"{not json").unwrap_err();
        assert_eq!(err.reason(), "bad_json");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn missing_or_malformed_headers_are_rejected() {
        assert_eq!(verify_signature("s", None, BODY), Err("missing_signature"));
        assert_eq!(
            verify_signature("s", Some("deadbeef"), BODY),
            Err("invalid_signature")
        );
        assert_eq!(
            verify_signature("s", Some("md5=deadbeef"), BODY),
            Err("unsupported_digest")
        );
        assert_eq!(
            verify_signature("s", Some("sha1=not-hex"), BODY),
            Err("invalid_signature")
        );
    }

    #[test]
    fn without_secret_any_payload_is_accepted() {
        assert!(verify_payload(None, None, BODY).is_ok());
        assert!(verify_payload(Some(""), Some("sha1=deadbeef"), BODY).is_ok());
    }
}

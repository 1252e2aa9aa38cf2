//! Webhook signature verification
//!
//! The provider signs each delivery with HMAC-SHA256 over
//! `notification_url ++ raw_body` (or the body alone when no URL is
//! configured) and sends the base64 digest in a header. Verification runs
//! over the exact bytes received, before any parsing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::WebhookConfig;
use crate::error::ConfigError;

type HmacSha256 = Hmac<Sha256>;

/// Verify `signature_header` against `raw_body` signed with `secret`
///
/// An empty secret is a configuration error, never a silent pass. A missing,
/// undecodable or mismatched signature yields `Ok(false)`.
pub fn verify(
    raw_body: &[u8],
    signature_header: Option<&str>,
    secret: &str,
) -> Result<bool, ConfigError> {
    SignatureVerifier::new(secret, None).verify(raw_body, signature_header)
}

/// Signs and verifies webhook bodies with a shared secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    notification_url: Option<String>,
}

impl SignatureVerifier {
    /// Create a verifier; `notification_url` is prepended to the body when signing
    pub fn new(secret: impl Into<String>, notification_url: Option<String>) -> Self {
        Self {
            secret: secret.into(),
            notification_url,
        }
    }

    /// Build from config; fails when no secret is configured
    pub fn from_config(config: &WebhookConfig) -> Result<Self, ConfigError> {
        let secret = config
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSecret)?;
        Ok(Self::new(secret, config.notification_url.clone()))
    }

    fn mac(&self, raw_body: &[u8]) -> Result<HmacSha256, ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|e| ConfigError::Invalid {
                name: "SHOP_SYNC_WEBHOOK_SECRET",
                message: e.to_string(),
            })?;
        if let Some(url) = &self.notification_url {
            mac.update(url.as_bytes());
        }
        mac.update(raw_body);
        Ok(mac)
    }

    /// Header value the provider would send for `raw_body`
    pub fn sign(&self, raw_body: &[u8]) -> Result<String, ConfigError> {
        let digest = self.mac(raw_body)?.finalize().into_bytes();
        Ok(STANDARD.encode(digest))
    }

    /// Check a received signature in constant time
    pub fn verify(&self, raw_body: &[u8], signature: Option<&str>) -> Result<bool, ConfigError> {
        let mac = self.mac(raw_body)?;

        let Some(signature) = signature.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(false);
        };
        let Ok(received) = STANDARD.decode(signature) else {
            return Ok(false);
        };

        Ok(mac.verify_slice(&received).is_ok())
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .field("notification_url", &self.notification_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BODY: &[u8] = br#"{"type":"payment.updated","event_id":"evt-1"}"#;

    #[test]
    fn test_sign_then_verify() {
        let verifier = SignatureVerifier::new("whsec", None);
        let sig = verifier.sign(BODY).unwrap();
        assert!(verifier.verify(BODY, Some(&sig)).unwrap());
        assert!(verify(BODY, Some(&sig), "whsec").unwrap());
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let body = b"The quick brown fox jumps over the lazy dog";
        let expected = "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=";
        assert_eq!(SignatureVerifier::new("key", None).sign(body).unwrap(), expected);
        assert!(verify(body, Some(expected), "key").unwrap());
    }

    #[test]
    fn test_rejects_wrong_secret_and_tampering() {
        let sig = SignatureVerifier::new("whsec", None).sign(BODY).unwrap();
        assert!(!verify(BODY, Some(&sig), "other").unwrap());

        let mut tampered = BODY.to_vec();
        tampered[2] ^= 0x01;
        assert!(!verify(&tampered, Some(&sig), "whsec").unwrap());
    }

    #[test]
    fn test_missing_or_garbage_signature_is_false() {
        assert!(!verify(BODY, None, "whsec").unwrap());
        assert!(!verify(BODY, Some(""), "whsec").unwrap());
        assert!(!verify(BODY, Some("not base64!!"), "whsec").unwrap());
    }

    #[test]
    fn test_empty_secret_is_config_error() {
        assert_eq!(verify(BODY, Some("abc"), ""), Err(ConfigError::MissingSecret));
        assert_eq!(
            SignatureVerifier::from_config(&WebhookConfig::default()).unwrap_err(),
            ConfigError::MissingSecret
        );
    }

    #[test]
    fn test_notification_url_binds_signature() {
        let url = "https://shop.example/webhooks/provider".to_string();
        let bound = SignatureVerifier::new("whsec", Some(url));
        let body_only = SignatureVerifier::new("whsec", None);

        let sig = bound.sign(BODY).unwrap();
        assert!(bound.verify(BODY, Some(&sig)).unwrap());
        assert!(!body_only.verify(BODY, Some(&sig)).unwrap());
    }

    proptest! {
        #[test]
        fn prop_any_body_round_trips(body in proptest::collection::vec(any::<u8>(), 0..512)) {
            let verifier = SignatureVerifier::new("prop-secret", None);
            let sig = verifier.sign(&body).unwrap();
            prop_assert!(verifier.verify(&body, Some(&sig)).unwrap());
        }

        #[test]
        fn prop_single_bit_flip_rejected(
            body in proptest::collection::vec(any::<u8>(), 1..256),
            idx in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let verifier = SignatureVerifier::new("prop-secret", None);
            let sig = verifier.sign(&body).unwrap();
            let mut flipped = body.clone();
            let i = idx.index(flipped.len());
            flipped[i] ^= 1 << bit;
            prop_assert!(!verifier.verify(&flipped, Some(&sig)).unwrap());
        }
    }
}

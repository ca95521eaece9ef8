//! Webhook signature verification
//!
//! Every inbound webhook carries an HMAC-SHA256 signature over the raw
//! request body, base64-encoded in the `X-Dastak-Signature` header. The
//! same signer produces the token embedded in outbound callback URLs so
//! the provider's callbacks verify against the deployment secret.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header the Telephony Provider and Core Backend sign requests with
pub const SIGNATURE_HEADER: &str = "x-dastak-signature";

#[derive(Clone)]
pub struct WebhookSigner {
    secret: Vec<u8>,
}

impl WebhookSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Sign a raw body, returning the base64 signature.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(body);
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// Verify a base64 signature against a raw body (constant time).
    pub fn verify(&self, body: &[u8], signature: &str) -> bool {
        let Ok(expected) = BASE64.decode(signature.trim()) else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let signer = WebhookSigner::new(b"deployment-secret".to_vec());
        let body = b"callId=C-1&status=answered";
        let sig = signer.sign(body);
        assert!(signer.verify(body, &sig));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let signer = WebhookSigner::new(b"deployment-secret".to_vec());
        let sig = signer.sign(b"callId=C-1&status=answered");
        assert!(!signer.verify(b"callId=C-1&status=completed", &sig));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let signer = WebhookSigner::new(b"secret-a".to_vec());
        let other = WebhookSigner::new(b"secret-b".to_vec());
        let body = b"payload";
        assert!(!other.verify(body, &signer.sign(body)));
    }

    #[test]
    fn verify_rejects_garbage_signature() {
        let signer = WebhookSigner::new(b"secret".to_vec());
        assert!(!signer.verify(b"payload", "not base64 !!!"));
        assert!(!signer.verify(b"payload", ""));
    }
}

// =============================================================================
// Broker Session — access-token cell and checksum generation
// =============================================================================
//
// The broker issues a daily access token against a request token. Renewal
// signs api_key + request_token + api_secret with SHA-256; the resulting
// token is shared by every in-flight request through a lock-protected cell.
// The secret is never logged or serialised.
// =============================================================================

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

/// Token state for one broker connection.
pub struct Session {
    api_key: String,
    api_secret: String,
    request_token: String,
    access_token: RwLock<Option<String>>,
}

impl Session {
    pub fn new(api_key: String, api_secret: String, request_token: String) -> Self {
        Self {
            api_key,
            api_secret,
            request_token,
            access_token: RwLock::new(None),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn request_token(&self) -> &str {
        &self.request_token
    }

    /// SHA-256 hex digest of api_key + request_token + api_secret, required
    /// by the token-exchange endpoint.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.api_key.as_bytes());
        hasher.update(self.request_token.as_bytes());
        hasher.update(self.api_secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn set_access_token(&self, token: String) {
        *self.access_token.write() = Some(token);
    }

    /// `Authorization` header value, or None before the first renewal.
    pub fn auth_header(&self) -> Option<String> {
        self.access_token
            .read()
            .as_ref()
            .map(|token| format!("token {}:{}", self.api_key, token))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("request_token", &"<redacted>")
            .field("has_access_token", &self.access_token.read().is_some())
            .finish()
    }
}

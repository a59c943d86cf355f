//! Device identity used by the handshake.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signer, SigningKey};

/// Immutable device identity: id, signing key, role, and scopes.
///
/// Supplied once at client construction and used only to sign the handshake
/// challenge; never mutated and never read from ambient state.
#[derive(Clone)]
pub struct DeviceIdentity {
    device_id: String,
    signing_key: SigningKey,
    role: String,
    scopes: Vec<String>,
}

impl DeviceIdentity {
    /// Create an identity from an existing signing key.
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        signing_key: SigningKey,
        role: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            signing_key,
            role: role.into(),
            scopes,
        }
    }

    /// Create an identity with a freshly generated key pair.
    #[must_use]
    pub fn generate(
        device_id: impl Into<String>,
        role: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        Self::new(device_id, signing_key, role, scopes)
    }

    /// Device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Role presented to the gateway.
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Scopes presented to the gateway.
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Public key, base64-encoded for the wire.
    #[must_use]
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message, returning the base64-encoded signature.
    pub(crate) fn sign_b64(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("role", &self.role)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    #[test]
    fn test_signature_verifies_against_public_key() {
        let identity = DeviceIdentity::generate("dev-1", "agent", vec!["runs".to_string()]);

        let message = b"v1|dev-1|...|n1";
        let sig_bytes = BASE64.decode(identity.sign_b64(message)).unwrap();
        let key_bytes = BASE64.decode(identity.public_key_b64()).unwrap();

        let key = VerifyingKey::from_bytes(&key_bytes.try_into().unwrap()).unwrap();
        let signature = Signature::from_bytes(&sig_bytes.try_into().unwrap());
        key.verify(message, &signature).unwrap();
    }

    #[test]
    fn test_debug_hides_key_material() {
        let identity = DeviceIdentity::generate("dev-1", "agent", vec![]);
        let debug = format!("{identity:?}");
        assert!(debug.contains("dev-1"));
        assert!(!debug.contains("signing_key"));
    }
}

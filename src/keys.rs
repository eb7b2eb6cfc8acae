//! Node signing identity (FED-19).
//!
//! Every node holds one Ed25519 keypair. The 32-byte seed lives at
//! `<data_dir>/node_key` as base64, created on first run with owner-only
//! permissions. Rotation is a manual operation: replace the file and
//! re-register the public key with every peer.

use std::path::{Path, PathBuf};

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::Rng;

use crate::error::FederationError;

/// Domain separator for connectivity-test challenges. Challenge responses
/// sign `CHALLENGE_PREFIX + nonce`, never the raw nonce, so the endpoint
/// cannot be used to obtain signatures over arbitrary bytes.
pub const CHALLENGE_PREFIX: &str = "impactos-challenge:";

const KEY_FILE: &str = "node_key";

pub struct NodeIdentity {
    signing_key: SigningKey,
}

impl NodeIdentity {
    /// Load the node key from `<data_dir>/node_key`, generating one on first
    /// run.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self, FederationError> {
        let path = Self::key_path(data_dir);

        if path.exists() {
            let encoded = std::fs::read_to_string(&path)
                .map_err(|e| FederationError::Key(format!("Failed to read node key: {}", e)))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| FederationError::Key(format!("Node key is not valid base64: {}", e)))?;
            let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                FederationError::Key(format!(
                    "Node key must be 32 bytes, found {}",
                    bytes.len()
                ))
            })?;
            return Ok(Self {
                signing_key: SigningKey::from_bytes(&seed),
            });
        }

        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);

        let encoded = base64::engine::general_purpose::STANDARD.encode(seed);
        crate::util::atomic_write_str(&path, &encoded).map_err(FederationError::Key)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| FederationError::Key(format!("Failed to restrict node key: {}", e)))?;
        }

        log::info!("Generated new node key at {}", path.display());
        Ok(Self { signing_key })
    }

    fn key_path(data_dir: &Path) -> PathBuf {
        data_dir.join(KEY_FILE)
    }

    /// Sign a payload, returning the signature as base64.
    pub fn sign_payload(&self, payload: &[u8]) -> String {
        let signature = self.signing_key.sign(payload);
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    }

    /// Answer a connectivity challenge.
    pub fn sign_challenge(&self, nonce: &str) -> String {
        self.sign_payload(format!("{}{}", CHALLENGE_PREFIX, nonce).as_bytes())
    }

    /// This node's public key as base64, the form peers register.
    pub fn public_key_b64(&self) -> String {
        base64::engine::general_purpose::STANDARD
            .encode(self.signing_key.verifying_key().as_bytes())
    }
}

/// Parse a base64-encoded Ed25519 public key.
pub fn parse_public_key(encoded: &str) -> Result<VerifyingKey, FederationError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| FederationError::Key(format!("Public key is not valid base64: {}", e)))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| FederationError::Key(format!("Public key must be 32 bytes, found {}", bytes.len())))?;
    VerifyingKey::from_bytes(&arr)
        .map_err(|e| FederationError::Key(format!("Invalid Ed25519 public key: {}", e)))
}

/// Verify a base64 signature over a payload. Any parse failure counts as an
/// invalid signature; the caller decides how loudly to react.
pub fn verify_signature(public_key_b64: &str, payload: &[u8], signature_b64: &str) -> bool {
    let verifying_key = match parse_public_key(public_key_b64) {
        Ok(key) => key,
        Err(e) => {
            log::debug!("Signature check failed to parse public key: {}", e);
            return false;
        }
    };
    let sig_bytes = match base64::engine::general_purpose::STANDARD.decode(signature_b64.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::debug!("Signature check failed to decode signature: {}", e);
            return false;
        }
    };
    let sig_arr: [u8; 64] = match sig_bytes.as_slice().try_into() {
        Ok(arr) => arr,
        Err(_) => {
            log::debug!(
                "Signature check got {} bytes, expected 64",
                sig_bytes.len()
            );
            return false;
        }
    };
    let signature = Signature::from_bytes(&sig_arr);
    verifying_key.verify_strict(payload, &signature).is_ok()
}

/// Verify a challenge response against a peer's registered key.
pub fn verify_challenge(public_key_b64: &str, nonce: &str, signature_b64: &str) -> bool {
    verify_signature(
        public_key_b64,
        format!("{}{}", CHALLENGE_PREFIX, nonce).as_bytes(),
        signature_b64,
    )
}

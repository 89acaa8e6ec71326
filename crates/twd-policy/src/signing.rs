// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 policy signatures over exact policy bytes.

use crate::config::PolicyConfig;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::warn;
use twd_types::{Submodel, SubmodelElement};

/// Errors from policy signature handling.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A PEM key could not be parsed.
    #[error("invalid policy key: {0}")]
    Key(String),
    /// The signature is not valid Base64 or has the wrong length.
    #[error("malformed policy signature: {0}")]
    MalformedSignature(String),
    /// The signature does not verify and verification is required.
    #[error("policy signature is invalid")]
    InvalidSignature,
    /// An unsigned policy was presented while verification is required.
    #[error("unsigned policy rejected")]
    UnsignedRejected,
    /// No policy was found while verification is required.
    #[error("signed policy not found")]
    NotFound,
    /// The policy JSON could not be parsed into a policy object.
    #[error("policy JSON is invalid: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The signed policy triple extracted from the PolicyTwin submodel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPolicy {
    /// Raw policy JSON, byte-exact as stored.
    pub policy_json: String,
    /// PEM-encoded Ed25519 public key.
    pub public_key_pem: String,
    /// Base64-encoded detached signature.
    pub signature_b64: String,
}

/// SHA-256 hex digest of the raw policy bytes, for audit entries.
#[must_use]
pub fn policy_hash(policy_json: &str) -> String {
    let digest = Sha256::digest(policy_json.as_bytes());
    format!("{digest:x}")
}

/// Verify the Ed25519 signature over the exact UTF-8 bytes of the policy.
///
/// Returns `Ok(false)` for a well-formed signature that simply does not
/// verify; malformed keys or signatures are errors.
///
/// # Errors
///
/// [`PolicyError::Key`] or [`PolicyError::MalformedSignature`] when the
/// material cannot be parsed at all.
pub fn verify_policy_signature(
    policy_json: &str,
    public_key_pem: &str,
    signature_b64: &str,
) -> Result<bool, PolicyError> {
    let verifying_key = VerifyingKey::from_public_key_pem(public_key_pem)
        .map_err(|e| PolicyError::Key(e.to_string()))?;

    let signature_bytes = BASE64
        .decode(signature_b64)
        .map_err(|e| PolicyError::MalformedSignature(e.to_string()))?;
    let signature_array: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| PolicyError::MalformedSignature("expected 64 bytes".into()))?;
    let signature = Signature::from_bytes(&signature_array);

    match verifying_key.verify_strict(policy_json.as_bytes(), &signature) {
        Ok(()) => Ok(true),
        Err(_) => {
            warn!("policy signature verification failed");
            Ok(false)
        }
    }
}

/// Sign a policy with a PEM-encoded Ed25519 private key.
///
/// # Errors
///
/// [`PolicyError::Key`] when the private key cannot be parsed.
pub fn sign_policy(policy_json: &str, private_key_pem: &str) -> Result<String, PolicyError> {
    let signing_key = SigningKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| PolicyError::Key(e.to_string()))?;
    let signature = signing_key.sign(policy_json.as_bytes());
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Generate a fresh Ed25519 keypair as `(private_pem, public_pem)`.
///
/// # Errors
///
/// [`PolicyError::Key`] when PEM encoding fails.
pub fn generate_keypair() -> Result<(String, String), PolicyError> {
    let signing_key = SigningKey::generate(&mut OsRng);
    let private_pem = ed25519_dalek::pkcs8::EncodePrivateKey::to_pkcs8_pem(
        &signing_key,
        LineEnding::LF,
    )
    .map_err(|e| PolicyError::Key(e.to_string()))?
    .to_string();
    let public_pem = signing_key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| PolicyError::Key(e.to_string()))?;
    Ok((private_pem, public_pem))
}

fn string_property(submodel: &Submodel, id_short: &str) -> Option<String> {
    submodel.submodel_elements.iter().find_map(|element| {
        if element.id_short() != Some(id_short) {
            return None;
        }
        match element {
            SubmodelElement::Property(p) => p.value.as_ref()?.as_str().map(str::to_string),
            _ => None,
        }
    })
}

/// Extract the signed policy triple from a PolicyTwin submodel, if complete.
#[must_use]
pub fn extract_signed_policy(submodel: &Submodel) -> Option<SignedPolicy> {
    Some(SignedPolicy {
        policy_json: string_property(submodel, "PolicyJson")?,
        public_key_pem: string_property(submodel, "PolicyPublicKeyPem")?,
        signature_b64: string_property(submodel, "PolicySignature")?,
    })
}

/// Extract a bare `PolicyJson` property, for the unsigned fallback path.
///
/// Only usable when signature verification is disabled.
#[must_use]
pub fn extract_unsigned_policy(submodel: &Submodel) -> Option<String> {
    string_property(submodel, "PolicyJson")
}

/// Verify a signed policy and parse it.
///
/// Returns the parsed configuration and whether the signature verified.
///
/// # Errors
///
/// [`PolicyError::InvalidSignature`] when verification is required and
/// fails; parse errors when the JSON is not a policy object.
pub fn verify_and_parse(
    signed: &SignedPolicy,
    require_verification: bool,
) -> Result<(PolicyConfig, bool), PolicyError> {
    let verified = verify_policy_signature(
        &signed.policy_json,
        &signed.public_key_pem,
        &signed.signature_b64,
    )?;
    if !verified && require_verification {
        return Err(PolicyError::InvalidSignature);
    }
    let config: PolicyConfig = serde_json::from_str(&signed.policy_json)?;
    Ok((config, verified))
}

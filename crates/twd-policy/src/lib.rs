// SPDX-License-Identifier: MIT OR Apache-2.0

//! Policy model and signature verification.
//!
//! Policies are distributed through the twin itself: a dedicated PolicyTwin
//! submodel exposes `PolicyJson`, `PolicyPublicKeyPem` and `PolicySignature`
//! properties. The Ed25519 signature is computed over the **exact UTF-8
//! bytes** of `PolicyJson` — never a re-canonicalized form — so there is no
//! canonicalization ambiguity to exploit.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod signing;

pub use config::{CompareOp, DenyWhen, InterlockRule, PolicyConfig, RoleBinding, violates};
pub use signing::{
    PolicyError, SignedPolicy, extract_signed_policy, extract_unsigned_policy, generate_keypair,
    policy_hash, sign_policy, verify_and_parse, verify_policy_signature,
};

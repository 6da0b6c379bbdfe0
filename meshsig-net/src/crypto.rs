// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Interface to the MuSig2 implementation.
//!
//! The coordinator never touches nonce or signature internals; it moves the
//! opaque byte strings defined here between participants and the backend.
//! Secret nonces are consumed by value so that each is used at most once.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::encoding::{hex_bytes_64, hex_vec};
use crate::error::{MeshSigError, Result};
use crate::types::CompressedPublicKey;

pub const PUBLIC_NONCE_LENGTH: usize = 66;
pub const PARTIAL_SIGNATURE_LENGTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyAggContext {
    pub aggregated_key: CompressedPublicKey,
    /// Participant keys in the order they were aggregated.
    pub public_keys: Vec<CompressedPublicKey>,
    /// Backend-specific state (tweaks, coefficients).
    pub state: Vec<u8>,
}

impl KeyAggContext {
    pub fn signer_index(&self, public_key: &CompressedPublicKey) -> Option<usize> {
        self.public_keys.iter().position(|k| k == public_key)
    }
}

pub struct SecretNonce(Zeroizing<Vec<u8>>);

impl SecretNonce {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretNonce([REDACTED])")
    }
}

macro_rules! fixed_bytes {
    ($name:ident, $len:expr, $what:literal) => {
        #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(try_from = "HexBytes", into = "HexBytes")]
        pub struct $name(Vec<u8>);

        impl $name {
            pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
                if bytes.len() != $len {
                    return Err(MeshSigError::Protocol(format!(
                        concat!("Malformed ", $what, ": expected {} bytes, got {}"),
                        $len,
                        bytes.len()
                    )));
                }
                Ok(Self(bytes))
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl TryFrom<HexBytes> for $name {
            type Error = MeshSigError;

            fn try_from(value: HexBytes) -> Result<Self> {
                Self::from_bytes(value.0)
            }
        }

        impl From<$name> for HexBytes {
            fn from(value: $name) -> Self {
                HexBytes(value.0)
            }
        }
    };
}

#[doc(hidden)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct HexBytes(#[serde(with = "hex_vec")] Vec<u8>);

fixed_bytes!(PublicNonce, PUBLIC_NONCE_LENGTH, "public nonce");
fixed_bytes!(AggregatedNonce, PUBLIC_NONCE_LENGTH, "aggregated nonce");
fixed_bytes!(PartialSignature, PARTIAL_SIGNATURE_LENGTH, "partial signature");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinalSignature(#[serde(with = "hex_bytes_64")] pub [u8; 64]);

impl FinalSignature {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// n-of-n MuSig2 primitives. Keys passed to `aggregate_keys` are already
/// sorted; signer indices refer to that order.
pub trait MusigBackend: Send + Sync {
    fn aggregate_keys(&self, sorted_keys: &[CompressedPublicKey]) -> Result<KeyAggContext>;

    fn generate_nonce(
        &self,
        secret_key: &[u8; 32],
        aggregated_key: &CompressedPublicKey,
        message: &[u8],
    ) -> Result<(SecretNonce, PublicNonce)>;

    fn aggregate_nonces(&self, public_nonces: &[PublicNonce]) -> Result<AggregatedNonce>;

    fn partial_sign(
        &self,
        secret_nonce: SecretNonce,
        secret_key: &[u8; 32],
        key_agg_ctx: &KeyAggContext,
        signer_index: usize,
        aggregated_nonce: &AggregatedNonce,
        message: &[u8],
    ) -> Result<PartialSignature>;

    fn aggregate_signatures(
        &self,
        partials: &[PartialSignature],
        aggregated_nonce: &AggregatedNonce,
        message: &[u8],
        key_agg_ctx: &KeyAggContext,
    ) -> Result<FinalSignature>;

    fn verify(
        &self,
        signature: &FinalSignature,
        aggregated_key: &CompressedPublicKey,
        message: &[u8],
    ) -> Result<()>;
}

// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use bech32::{Bech32m, Hrp};
use k256::schnorr::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{MeshSigError, Result};
use crate::types::CompressedPublicKey;

const ADDRESS_HRP: &str = "ms";

/// Signing identity of this peer. The same secret backs advertisement
/// signatures and the MuSig2 secret key handed to the crypto backend.
#[derive(Clone)]
pub struct SignerKeys {
    signing_key: SigningKey,
}

impl SignerKeys {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(secret)
            .map_err(|e| MeshSigError::Crypto(format!("Invalid secret key: {e}")))?;
        Ok(Self { signing_key })
    }

    pub fn from_secret_hex(s: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim())
                .map_err(|e| MeshSigError::Crypto(format!("Invalid secret key hex: {e}")))?,
        );
        let secret: Zeroizing<[u8; 32]> = Zeroizing::new(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| MeshSigError::Crypto("Secret key must be 32 bytes".into()))?,
        );
        Self::from_secret_bytes(&secret)
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&self.signing_key.to_bytes());
        out
    }

    /// BIP-340 keys have even y, so the compressed form always uses 0x02.
    pub fn public_key(&self) -> CompressedPublicKey {
        let mut bytes = [0u8; 33];
        bytes[0] = 0x02;
        bytes[1..33].copy_from_slice(&self.signing_key.verifying_key().to_bytes());
        CompressedPublicKey::from_bytes(bytes).expect("0x02 prefix is valid")
    }

    pub fn sign_digest(&self, digest: &[u8; 32]) -> [u8; 64] {
        let signature: Signature = self.signing_key.sign(digest);
        signature.to_bytes()
    }
}

impl std::fmt::Debug for SignerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerKeys")
            .field("public_key", &self.public_key())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

pub fn verify_digest(
    public_key: &CompressedPublicKey,
    digest: &[u8; 32],
    signature: &[u8; 64],
) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(&public_key.x_only())
        .map_err(|e| MeshSigError::SignatureInvalid(format!("Invalid public key: {e}")))?;
    let signature = Signature::try_from(signature.as_slice())
        .map_err(|e| MeshSigError::SignatureInvalid(format!("Malformed signature: {e}")))?;
    verifying_key
        .verify(digest, &signature)
        .map_err(|_| MeshSigError::SignatureInvalid("Signature verification failed".into()))
}

/// On-chain address for a public key: bech32m over the first 20 bytes of
/// SHA-256(pubkey).
pub fn derive_address(public_key: &CompressedPublicKey) -> String {
    let digest = Sha256::digest(public_key.as_bytes());
    let hrp = Hrp::parse(ADDRESS_HRP).expect("static hrp is valid");
    bech32::encode::<Bech32m>(hrp, &digest[..20]).expect("20-byte payload fits bech32m")
}

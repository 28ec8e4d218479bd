//! Account-bound key signatures.
//!
//! Proves control of a secp256k1 key pair tied to a console account. The
//! message and hashing follow the common wallet convention so users can sign
//! with off-the-shelf tooling: keccak256 over the "\x19Ethereum Signed
//! Message:\n" prefix, a 65-byte `r||s||v` signature, and a recovery byte
//! offset by 27 in transit.

use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};

use crate::error::{Error, Result};

const MESSAGE_TEMPLATE: &str = "Here I prove that my Storj account uses email {email} on Satellite X";
const SIGNED_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";

fn account_message(email: &str) -> String {
    MESSAGE_TEMPLATE.replace("{email}", email)
}

fn hash_message(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(SIGNED_MESSAGE_PREFIX.as_bytes());
    hasher.update(message.len().to_string().as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Sign the account message for `email`, returning the 65-byte wallet-style
/// signature with the recovery byte already offset by 27.
pub fn create_signature(email: &str, private_key: &SigningKey) -> Result<Vec<u8>> {
    let hash = hash_message(account_message(email).as_bytes());
    let (signature, recovery_id) = private_key
        .sign_prehash_recoverable(&hash)
        .map_err(|e| Error::MalformedSignature(e.to_string()))?;

    let mut out = Vec::with_capacity(65);
    out.extend_from_slice(&signature.to_bytes());
    out.push(recovery_id.to_byte() + 27);
    Ok(out)
}

/// Recover the public key that produced `signature` over the account message
/// for `email`. The trailing recovery byte is expected in wallet convention
/// (offset by 27).
pub fn public_key_from_signature(email: &str, signature: &[u8]) -> Result<VerifyingKey> {
    if signature.len() != 65 {
        return Err(Error::MalformedSignature(format!(
            "expected 65 bytes, got {}",
            signature.len()
        )));
    }
    let hash = hash_message(account_message(email).as_bytes());

    let sig = EcdsaSignature::from_slice(&signature[..64])
        .map_err(|e| Error::MalformedSignature(e.to_string()))?;
    let v = signature[64]
        .checked_sub(27)
        .ok_or_else(|| Error::MalformedSignature("recovery byte below 27".into()))?;
    let recovery_id =
        RecoveryId::from_byte(v).ok_or_else(|| Error::MalformedSignature("bad recovery byte".into()))?;

    VerifyingKey::recover_from_prehash(&hash, &sig, recovery_id).map_err(|_| Error::BadSignature)
}

/// Verify `signature` over the account message for `email` against the
/// stored SEC1-compressed public key.
pub fn check_signature(email: &str, public_key: &[u8], signature: &[u8]) -> Result<()> {
    let recovered = public_key_from_signature(email, signature)?;
    let compressed = recovered.to_encoded_point(true);
    if compressed.as_bytes() != public_key {
        return Err(Error::BadSignature);
    }
    Ok(())
}

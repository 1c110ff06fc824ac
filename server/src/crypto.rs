//! Ed25519 key handling and digest computation.
//!
//! Public keys travel as base64 of their DER `SubjectPublicKeyInfo` encoding,
//! private keys as base64 of a passphrase-protected PKCS#8 document. Both
//! sides sign the SHA-256 digest of the canonical preimage, never the raw
//! message, and signatures are base64 of the raw Ed25519 signature bytes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey},
    Signature, Signer, SigningKey, Verifier, VerifyingKey,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Load a public key from its base64 DER `SubjectPublicKeyInfo` encoding.
pub fn load_public_key(b64_der: &str) -> Result<VerifyingKey, CryptoError> {
    let der = BASE64.decode(b64_der)?;
    VerifyingKey::from_public_key_der(&der).map_err(|e| CryptoError::Key(e.to_string()))
}

/// Dump a public key as base64 DER `SubjectPublicKeyInfo`.
pub fn dump_public_key(pubkey: &VerifyingKey) -> Result<String, CryptoError> {
    let der = pubkey
        .to_public_key_der()
        .map_err(|e| CryptoError::Key(e.to_string()))?;
    Ok(BASE64.encode(der.as_bytes()))
}

/// Load a private key from base64 PKCS#8 DER, decrypting when a passphrase
/// is supplied.
pub fn load_private_key(b64_der: &str, secret: Option<&[u8]>) -> Result<SigningKey, CryptoError> {
    let der = BASE64.decode(b64_der)?;
    match secret {
        Some(secret) => SigningKey::from_pkcs8_encrypted_der(&der, secret),
        None => SigningKey::from_pkcs8_der(&der),
    }
    .map_err(|e| CryptoError::Key(e.to_string()))
}

/// Dump a private key as base64 PKCS#8 DER, encrypted when a passphrase is
/// supplied.
pub fn dump_private_key(
    prikey: &SigningKey,
    secret: Option<&[u8]>,
) -> Result<String, CryptoError> {
    let doc = match secret {
        Some(secret) => prikey.to_pkcs8_encrypted_der(OsRng, secret),
        None => prikey.to_pkcs8_der(),
    }
    .map_err(|e| CryptoError::Key(e.to_string()))?;
    Ok(BASE64.encode(doc.as_bytes()))
}

/// Generate a fresh private key.
pub fn generate_private_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// SHA-256 digest of arbitrary data.
pub fn hash_data(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Digest of a multi-channel listen request.
///
/// The preimage is `guid | channel | channel | ...` with channels sorted, the
/// single canonical serialization shared by client and server.
pub fn hash_listen_params(guid: &str, channels: &[String]) -> [u8; 32] {
    let mut channels: Vec<&str> = channels.iter().map(String::as_str).collect();
    channels.sort_unstable();
    let mut data = String::from(guid);
    for channel in channels {
        data.push('|');
        data.push_str(channel);
    }
    hash_data(data.as_bytes())
}

/// Sign a digest, returning base64 of the raw signature bytes.
pub fn sign_digest(prikey: &SigningKey, digest: &[u8]) -> String {
    BASE64.encode(prikey.sign(digest).to_bytes())
}

/// Verify a base64 signature over a digest.
pub fn verify_digest(pubkey: &VerifyingKey, digest: &[u8], signature: &str) -> bool {
    let Ok(bytes) = BASE64.decode(signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    pubkey.verify(digest, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_round_trip() {
        let prikey = generate_private_key();
        let dumped = dump_public_key(&prikey.verifying_key()).unwrap();
        let loaded = load_public_key(&dumped).unwrap();
        assert_eq!(loaded, prikey.verifying_key());
    }

    #[test]
    fn public_key_rejects_garbage() {
        assert!(load_public_key("not base64!").is_err());
        let b64_garbage = BASE64.encode(b"not a der document");
        assert!(load_public_key(&b64_garbage).is_err());
    }

    #[test]
    fn private_key_encrypted_round_trip() {
        let prikey = generate_private_key();
        let dumped = dump_private_key(&prikey, Some(b"hunter2")).unwrap();
        let loaded = load_private_key(&dumped, Some(b"hunter2")).unwrap();
        assert_eq!(loaded.to_bytes(), prikey.to_bytes());
    }

    #[test]
    fn private_key_wrong_passphrase() {
        let prikey = generate_private_key();
        let dumped = dump_private_key(&prikey, Some(b"hunter2")).unwrap();
        assert!(load_private_key(&dumped, Some(b"*******")).is_err());
    }

    #[test]
    fn private_key_plain_round_trip() {
        let prikey = generate_private_key();
        let dumped = dump_private_key(&prikey, None).unwrap();
        let loaded = load_private_key(&dumped, None).unwrap();
        assert_eq!(loaded.to_bytes(), prikey.to_bytes());
    }

    #[test]
    fn sign_verify_round_trip() {
        let prikey = generate_private_key();
        let digest = hash_data(b"some payload");
        let signature = sign_digest(&prikey, &digest);
        assert!(verify_digest(&prikey.verifying_key(), &digest, &signature));

        let other = hash_data(b"another payload");
        assert!(!verify_digest(&prikey.verifying_key(), &other, &signature));
        assert!(!verify_digest(&prikey.verifying_key(), &digest, "@@@"));
    }

    #[test]
    fn listen_digest_is_order_insensitive() {
        let forward = hash_listen_params("alice", &["a".into(), "b".into()]);
        let backward = hash_listen_params("alice", &["b".into(), "a".into()]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn listen_digest_matches_canonical_preimage() {
        let digest = hash_listen_params("alice", &["b".into(), "a".into()]);
        assert_eq!(digest, hash_data(b"alice|a|b"));

        let digest = hash_listen_params("alice", &[]);
        assert_eq!(digest, hash_data(b"alice"));
    }
}

//! Verification of manifest signatures.

use std::fmt;

use base64::Engine as _;
use p256::ecdsa::signature::Verifier;
use thiserror::Error;
use tracing::error;

/// Error verifying a manifest signature.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("artifact is not signed but a verification key is configured")]
    Missing,
    #[error("unable to decode manifest signature")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid manifest signature")]
    Invalid,
    #[error("unsupported verification key, expected an Ed25519 or ECDSA P-256 public key")]
    UnsupportedKey,
}

/// Public key for verifying artifact signatures.
#[derive(Clone)]
pub enum VerificationKey {
    Ed25519(ed25519_dalek::VerifyingKey),
    EcdsaP256(p256::ecdsa::VerifyingKey),
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ed25519(_) => f.write_str("VerificationKey::Ed25519"),
            Self::EcdsaP256(_) => f.write_str("VerificationKey::EcdsaP256"),
        }
    }
}

impl VerificationKey {
    /// Parse a PEM encoded public key.
    pub fn from_pem(pem: &str) -> Result<Self, SignatureError> {
        if let Ok(key) =
            <ed25519_dalek::VerifyingKey as ed25519_dalek::pkcs8::DecodePublicKey>::from_public_key_pem(pem)
        {
            return Ok(Self::Ed25519(key));
        }
        <p256::ecdsa::VerifyingKey as p256::pkcs8::DecodePublicKey>::from_public_key_pem(pem)
            .map(Self::EcdsaP256)
            .map_err(|_| SignatureError::UnsupportedKey)
    }

    /// Name of the signature algorithm.
    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Ed25519(_) => "ed25519",
            Self::EcdsaP256(_) => "ecdsa-p256",
        }
    }

    /// Verify the base64 encoded `signature` of `message`.
    pub fn verify(&self, message: &[u8], signature: &str) -> Result<(), SignatureError> {
        let signature = base64::prelude::BASE64_STANDARD.decode(signature.trim())?;
        let result = match self {
            Self::Ed25519(key) => verify_ed25519(key, message, &signature),
            Self::EcdsaP256(key) => verify_p256(key, message, &signature),
        };
        result.inspect_err(|_| error!(algorithm = self.algorithm(), "signature was invalid"))
    }
}

fn verify_ed25519(
    key: &ed25519_dalek::VerifyingKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let signature =
        ed25519_dalek::Signature::from_slice(signature).map_err(|_| SignatureError::Invalid)?;
    key.verify_strict(message, &signature)
        .map_err(|_| SignatureError::Invalid)
}

/// Signatures are accepted both DER encoded and as raw `r || s` pair.
fn verify_p256(
    key: &p256::ecdsa::VerifyingKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let signature = if signature.len() == 64 {
        p256::ecdsa::Signature::from_slice(signature)
    } else {
        p256::ecdsa::Signature::from_der(signature)
    }
    .map_err(|_| SignatureError::Invalid)?;
    let signature = signature.normalize_s().unwrap_or(signature);
    key.verify(message, &signature)
        .map_err(|_| SignatureError::Invalid)
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    const RFC8410_KEY: &str = "-----BEGIN PUBLIC KEY-----\n\
        MCowBQYDK2VwAyEAGb9ECWmEzf6FQbrBZ9w7lshQhqowtrbLDFw4rXAxZuE=\n\
        -----END PUBLIC KEY-----\n";

    #[test]
    fn test_parse_ed25519_key() {
        let key = VerificationKey::from_pem(RFC8410_KEY).unwrap();
        assert_eq!(key.algorithm(), "ed25519");
        assert!(matches!(
            VerificationKey::from_pem("not a key"),
            Err(SignatureError::UnsupportedKey)
        ));
    }

    #[test]
    fn test_verify_ed25519() {
        let signing_key = SigningKey::from_bytes(&[7; 32]);
        let key = VerificationKey::Ed25519(signing_key.verifying_key());
        let signature = signing_key.sign(b"manifest");
        let encoded = base64::prelude::BASE64_STANDARD.encode(signature.to_bytes());
        key.verify(b"manifest", &encoded).unwrap();
        assert!(matches!(
            key.verify(b"tampered", &encoded),
            Err(SignatureError::Invalid)
        ));
        assert!(matches!(
            key.verify(b"manifest", "%%%"),
            Err(SignatureError::Base64(_))
        ));
    }

    #[test]
    fn test_verify_p256() {
        use p256::ecdsa::signature::Signer as _;

        let signing_key = p256::ecdsa::SigningKey::from_slice(&[3; 32]).unwrap();
        let key = VerificationKey::EcdsaP256(p256::ecdsa::VerifyingKey::from(&signing_key));
        let signature: p256::ecdsa::Signature = signing_key.sign(b"manifest");
        let raw = base64::prelude::BASE64_STANDARD.encode(signature.to_bytes());
        let der = base64::prelude::BASE64_STANDARD.encode(signature.to_der().as_bytes());
        key.verify(b"manifest", &raw).unwrap();
        key.verify(b"manifest", &der).unwrap();
        assert!(key.verify(b"tampered", &der).is_err());
    }
}

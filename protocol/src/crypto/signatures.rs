//! # Digital Signatures
//!
//! Free-function wrappers around Ed25519 signing and verification.
//!
//! Every token mint, every division output, every delegation certificate and
//! every transfer authorization passes through here. Keeping the calls in one
//! place means there is exactly one spot to audit when someone asks "where do
//! we sign things?"
//!
//! The rule for verification is simple: it answers yes or no. Malformed keys,
//! truncated signatures and plain forgeries all come back as `false` (or
//! `VerificationFailed` from the `Result` variants). A verifier never panics.

use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};
use thiserror::Error;

use super::keys::{KeyError, Keypair, PublicKey, Signature};

/// Errors during signature operations.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature verification failed")]
    VerificationFailed,

    #[error("invalid signature bytes: expected 64 bytes")]
    InvalidSignatureBytes,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("secret key unavailable: {0}")]
    MissingSecret(#[from] KeyError),
}

/// Sign a message with a typed keypair. Cannot fail.
///
/// ```
/// use otm_protocol::crypto::{sign, verify, Keypair};
///
/// let keypair = Keypair::generate();
/// let sig = sign(&keypair, b"otm");
/// assert!(verify(&keypair.public_key(), b"otm", &sig));
/// ```
pub fn sign(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

/// Sign with raw secret bytes, e.g. freshly loaded from a key file.
///
/// This is the only signing path that can fail: when the secret is absent or
/// the wrong length there is nothing to sign with.
pub fn sign_with_secret(secret: &[u8], message: &[u8]) -> Result<Signature, SignatureError> {
    let keypair = Keypair::from_secret_slice(secret)?;
    Ok(keypair.sign(message))
}

/// Verify a signature. Returns `false` for anything other than a valid match.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    public_key.verify(message, signature)
}

/// Verify from raw wire bytes, distinguishing a bad key from a bad signature.
pub fn verify_raw(
    public_key_bytes: &[u8; 32],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), SignatureError> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key_bytes).map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_arr: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| SignatureError::InvalidSignatureBytes)?;
    let signature = DalekSignature::from_bytes(&sig_arr);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Verify a batch. All must pass; the first failure fails the batch.
///
/// Sequential under the hood. Callers that need to know *which* item failed
/// verify individually (the issuer does, to report `firstInvalidTokenId`).
pub fn batch_verify(items: &[(PublicKey, Vec<u8>, Signature)]) -> Result<(), SignatureError> {
    for (pubkey, message, signature) in items {
        if !verify(pubkey, message, signature) {
            return Err(SignatureError::VerificationFailed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let sig = sign(&kp, b"mint 100");
        assert!(verify(&kp.public_key(), b"mint 100", &sig));
    }

    #[test]
    fn single_bit_flip_in_message_fails() {
        let kp = Keypair::generate();
        let msg = b"amount=100".to_vec();
        let sig = sign(&kp, &msg);

        for byte in 0..msg.len() {
            for bit in 0..8 {
                let mut tampered = msg.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    !verify(&kp.public_key(), &tampered, &sig),
                    "bit {bit} of byte {byte} flipped but signature still verified"
                );
            }
        }
    }

    #[test]
    fn single_bit_flip_in_signature_fails() {
        let kp = Keypair::generate();
        let sig = sign(&kp, b"payload");
        let raw = sig.as_bytes().to_vec();

        for byte in [0usize, 13, 31, 32, 63] {
            let mut tampered = raw.clone();
            tampered[byte] ^= 0x01;
            assert!(!verify(&kp.public_key(), b"payload", &Signature::from_slice(&tampered)));
        }
    }

    #[test]
    fn sign_with_secret_requires_secret() {
        assert!(matches!(
            sign_with_secret(&[], b"x"),
            Err(SignatureError::MissingSecret(_))
        ));

        let kp = Keypair::from_seed(&[3u8; 32]);
        let sig = sign_with_secret(&kp.secret_key_bytes(), b"x").unwrap();
        assert_eq!(sig, kp.sign(b"x"));
    }

    #[test]
    fn verify_raw_reports_specific_errors() {
        let kp = Keypair::generate();
        let sig = sign(&kp, b"m");
        let pk = *kp.public_key().as_bytes();

        assert!(verify_raw(&pk, b"m", sig.as_bytes()).is_ok());
        assert!(matches!(
            verify_raw(&pk, b"m", &sig.as_bytes()[..40]),
            Err(SignatureError::InvalidSignatureBytes)
        ));
        assert!(matches!(
            verify_raw(&pk, b"other", sig.as_bytes()),
            Err(SignatureError::VerificationFailed)
        ));
    }

    #[test]
    fn batch_verify_fails_on_one_bad_item() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let good = vec![
            (a.public_key(), b"one".to_vec(), a.sign(b"one")),
            (b.public_key(), b"two".to_vec(), b.sign(b"two")),
        ];
        assert!(batch_verify(&good).is_ok());

        let mut bad = good.clone();
        bad[1].2 = a.sign(b"two");
        assert!(batch_verify(&bad).is_err());
    }
}

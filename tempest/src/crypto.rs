//! Cryptographic primitives.
//!
//! Everything signature-related in the node is ECDSA over secp256k1, with
//! message digests computed as a double-SHA256 over the canonical encoding
//! of the signed payload.
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::secp256k1;
use once_cell::sync::Lazy;
use thiserror::Error;

pub use bitcoin::secp256k1::ecdsa::Signature;
pub use bitcoin::secp256k1::{PublicKey, SecretKey};

/// Shared secp256k1 context.
static SECP: Lazy<secp256k1::Secp256k1<secp256k1::All>> = Lazy::new(secp256k1::Secp256k1::new);

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid signature for key {0}")]
    InvalidSignature(PublicKey),
}

/// A message digest ready to be signed or verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digest(secp256k1::Message);

impl Digest {
    /// Double-SHA256 the given payload.
    pub fn hash(payload: &[u8]) -> Self {
        let hash = sha256d::Hash::hash(payload);

        Self::from_bytes(hash.to_byte_array())
    }

    /// Wrap an already-computed 32-byte hash, eg. a transaction sighash.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let msg = secp256k1::Message::from_slice(&bytes)
            .expect("Digest::from_bytes: input is exactly 32 bytes");

        Self(msg)
    }
}

/// Verify an ECDSA signature over a digest.
pub fn verify(digest: &Digest, sig: &Signature, key: &PublicKey) -> Result<(), Error> {
    SECP.verify_ecdsa(&digest.0, sig, key)
        .map_err(|_| Error::InvalidSignature(*key))
}

/// Sign a digest with a raw secret key.
pub fn sign(digest: &Digest, key: &SecretKey) -> Signature {
    SECP.sign_ecdsa(&digest.0, key)
}

/// Derive the public key of a secret key.
pub fn public_key(key: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(&SECP, key)
}

/// Objects that can produce signatures with an identity key.
///
/// The funding manager and the wallet implement this; tests use a key pair
/// held in memory.
pub trait Signer {
    /// The public key signatures verify under.
    fn public_key(&self) -> PublicKey;
    /// Sign the given digest.
    fn sign(&self, digest: &Digest) -> Signature;
}

impl<T: Signer + ?Sized> Signer for &T {
    fn public_key(&self) -> PublicKey {
        (**self).public_key()
    }

    fn sign(&self, digest: &Digest) -> Signature {
        (**self).sign(digest)
    }
}

/// An in-memory key pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn new(secret: SecretKey) -> Self {
        let public = public_key(&secret);

        Self { secret, public }
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

impl Signer for KeyPair {
    fn public_key(&self) -> PublicKey {
        self.public
    }

    fn sign(&self, digest: &Digest) -> Signature {
        sign(digest, &self.secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed: u8) -> KeyPair {
        KeyPair::new(SecretKey::from_slice(&[seed; 32]).unwrap())
    }

    #[test]
    fn test_sign_and_verify() {
        let alice = keypair(1);
        let bob = keypair(2);
        let digest = Digest::hash(b"channel announcement");
        let sig = alice.sign(&digest);

        assert!(verify(&digest, &sig, &alice.public_key()).is_ok());
        assert!(verify(&digest, &sig, &bob.public_key()).is_err());
        assert!(verify(&Digest::hash(b"other"), &sig, &alice.public_key()).is_err());
    }
}

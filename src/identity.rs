use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::{Error, random_bytes};

/// Usernames are non-empty and made only of alphanumeric characters.
pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty() && name.chars().all(char::is_alphanumeric)
}

/// The long-lived key material of one user (or of the server).
///
/// Holds an X25519 key for box encryption and an Ed25519 key for
/// signatures. Loaded once at startup and never mutated.
pub struct Identity {
    name: String,
    dh_key: StaticSecret,
    signing_key: SigningKey,
}

impl Identity {
    /// Builds an identity from raw 32-byte private keys.
    pub fn from_bytes(name: &str, dh_key: [u8; 32], signing_key: [u8; 32]) -> Result<Self, Error> {
        if !is_valid_username(name) {
            return Err(Error::KeyStore(format!("Invalid identity name {name:?}")));
        }

        Ok(Self {
            name: name.to_string(),
            dh_key: StaticSecret::from(dh_key),
            signing_key: SigningKey::from_bytes(&signing_key),
        })
    }

    /// Generates fresh key material. Intended for provisioning tools and
    /// tests; the protocol itself only ever loads keys.
    pub fn generate(name: &str) -> Result<Self, Error> {
        Self::from_bytes(name, random_bytes()?, random_bytes()?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// The public half, as other parties would load it from their store.
    pub fn public_info(&self) -> PeerPublicInfo {
        PeerPublicInfo {
            name: self.name.clone(),
            encryption_key: PublicKey::from(&self.dh_key),
            verify_key: self.signing_key.verifying_key(),
        }
    }

    pub(crate) fn dh(&self, public_key: &PublicKey) -> SharedSecret {
        self.dh_key.diffie_hellman(public_key)
    }

    /// Returns `(dh_private, signing_seed)`.
    pub fn to_bytes(&self) -> ([u8; 32], [u8; 32]) {
        (self.dh_key.to_bytes(), self.signing_key.to_bytes())
    }
}

/// The public keys of a remote party.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerPublicInfo {
    name: String,
    encryption_key: PublicKey,
    verify_key: VerifyingKey,
}

impl PeerPublicInfo {
    pub fn from_bytes(
        name: &str,
        encryption_key: [u8; 32],
        verify_key: [u8; 32],
    ) -> Result<Self, Error> {
        if !is_valid_username(name) {
            return Err(Error::KeyStore(format!("Invalid peer name {name:?}")));
        }

        let verify_key = VerifyingKey::from_bytes(&verify_key)
            .map_err(|e| Error::KeyStore(format!("Bad verify key for {name}: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            encryption_key: PublicKey::from(encryption_key),
            verify_key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encryption_key(&self) -> &PublicKey {
        &self.encryption_key
    }

    pub fn verify_key(&self) -> &VerifyingKey {
        &self.verify_key
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), Error> {
        self.verify_key.verify(message, signature)?;
        Ok(())
    }
}

use aes_gcm_siv::aead::Aead;
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{Error, Identity, PeerPublicInfo};

/// Length of every symmetric session key, server or peer.
pub const SESSION_KEY_SIZE: usize = 32;

/// Length of the random value the server challenges a client with.
pub const CHALLENGE_SIZE: usize = 24;

/// Length of a detached Ed25519 signature.
pub const SIGNATURE_SIZE: usize = ed25519_dalek::SIGNATURE_LENGTH;

const NONCE_SIZE: usize = 12; // AES-GCM-SIV uses 96-bit nonces
const TAG_SIZE: usize = 16;

/// Bytes a sealed message carries on top of its plaintext.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

const BOX_SALT: &[u8] = b"Rendezchat-DH-Box";

/// Fills an `N` byte array from the operating system RNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], Error> {
    let mut bytes = [0u8; N];
    OsRng.try_fill_bytes(&mut bytes).map_err(|_| Error::Random)?;
    Ok(bytes)
}

/// Encrypts `plaintext` under `key`, returning `nonce || ciphertext || tag`.
fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let nonce_bytes = random_bytes::<NONCE_SIZE>()?;

    let cipher = Aes256GcmSiv::new(aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(key.as_slice()));
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut ciphertext = cipher.encrypt(nonce, plaintext)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.append(&mut ciphertext);

    Ok(sealed)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, Error> {
    if sealed.len() < NONCE_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

    let cipher = Aes256GcmSiv::new(aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(key.as_slice()));
    let plaintext = cipher.decrypt(Nonce::from_slice(nonce), ciphertext)?;

    Ok(plaintext)
}

/// A symmetric secret shared by exactly two parties.
///
/// Used both as the server session key of an authenticated connection and
/// as the peer session key of a single chat.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Generates a fresh key from the OS RNG.
    pub fn random() -> Result<Self, Error> {
        Ok(Self(random_bytes()?))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let key = <[u8; SESSION_KEY_SIZE]>::try_from(bytes).map_err(|_| {
            Error::Protocol(format!(
                "Session key must be {SESSION_KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    /// Authenticated encryption of `plaintext`. An empty plaintext still
    /// produces a non-empty, authenticated ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        seal(&self.0, plaintext)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        open(&self.0, sealed)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Public-key authenticated encryption between one local identity and one
/// remote party.
///
/// The X25519 shared secret of the two keys is expanded with HKDF into an
/// AES-256-GCM-SIV key, so both sides of a pairing build the same box.
pub struct DhBox {
    key: [u8; 32],
}

impl DhBox {
    pub fn new(identity: &Identity, peer: &PeerPublicInfo, info: &[u8]) -> Result<Self, Error> {
        let shared = identity.dh(peer.encryption_key());
        if !shared.was_contributory() {
            return Err(Error::Crypto("Non-contributory DH output".to_string()));
        }

        let mut shared_bytes = shared.to_bytes();
        let hkdf = Hkdf::<Sha256>::new(Some(BOX_SALT), &shared_bytes);
        shared_bytes.zeroize();

        let mut key = [0u8; 32];
        hkdf.expand(info, &mut key)
            .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;

        Ok(Self { key })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        seal(&self.key, plaintext)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        open(&self.key, sealed)
    }
}

impl Drop for DhBox {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

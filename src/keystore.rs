use std::collections::HashMap;
use std::path::PathBuf;

use crate::{Error, Identity, PeerPublicInfo, is_valid_username};

/// Lookup of key material by user name.
///
/// The protocol only consumes keys; generating and persisting them is the
/// job of whatever provisions the store.
pub trait KeyStore: Send + Sync {
    /// Loads the private identity of `name`.
    fn identity(&self, name: &str) -> Result<Identity, Error>;

    /// Loads the public keys of `name`.
    fn public_info(&self, name: &str) -> Result<PeerPublicInfo, Error>;
}

/// A key store held in memory.
#[derive(Default)]
pub struct MemoryKeyStore {
    identities: HashMap<String, ([u8; 32], [u8; 32])>,
    public: HashMap<String, PeerPublicInfo>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores both halves of `identity`.
    pub fn insert_identity(&mut self, identity: &Identity) {
        self.identities
            .insert(identity.name().to_string(), identity.to_bytes());
        self.insert_public(identity.public_info());
    }

    /// Stores only the public half of a party.
    pub fn insert_public(&mut self, info: PeerPublicInfo) {
        self.public.insert(info.name().to_string(), info);
    }
}

impl KeyStore for MemoryKeyStore {
    fn identity(&self, name: &str) -> Result<Identity, Error> {
        let (dh, sign) = self
            .identities
            .get(name)
            .ok_or_else(|| Error::KeyStore(format!("No private keys for {name}")))?;
        Identity::from_bytes(name, *dh, *sign)
    }

    fn public_info(&self, name: &str) -> Result<PeerPublicInfo, Error> {
        self.public
            .get(name)
            .cloned()
            .ok_or_else(|| Error::KeyStore(format!("No public keys for {name}")))
    }
}

/// A directory of hex-encoded key files.
///
/// For a user `name` the directory holds `name` (X25519 private key),
/// `name_dsa` (Ed25519 signing seed), `name.pub` (X25519 public key) and
/// `name_dsa.pub` (Ed25519 verify key).
pub struct DirKeyStore {
    root: PathBuf,
}

impl DirKeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_key(&self, name: &str, suffix: &str) -> Result<[u8; 32], Error> {
        // The name ends up in a path, so it is checked before anything else.
        if !is_valid_username(name) {
            return Err(Error::KeyStore(format!("Invalid key name {name:?}")));
        }

        let path = self.root.join(format!("{name}{suffix}"));
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::KeyStore(format!("{}: {e}", path.display())))?;
        let bytes = hex::decode(text.trim())
            .map_err(|e| Error::KeyStore(format!("{}: {e}", path.display())))?;

        <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
            Error::KeyStore(format!(
                "{}: expected 32 bytes, got {}",
                path.display(),
                bytes.len()
            ))
        })
    }
}

impl KeyStore for DirKeyStore {
    fn identity(&self, name: &str) -> Result<Identity, Error> {
        let dh = self.read_key(name, "")?;
        let sign = self.read_key(name, "_dsa")?;
        Identity::from_bytes(name, dh, sign)
    }

    fn public_info(&self, name: &str) -> Result<PeerPublicInfo, Error> {
        let encryption = self.read_key(name, ".pub")?;
        let verify = self.read_key(name, "_dsa.pub")?;
        PeerPublicInfo::from_bytes(name, encryption, verify)
    }
}

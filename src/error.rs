/// Errors that can occur while authenticating, brokering or chatting.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cryptographic operation failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// The login handshake did not complete. The message is deliberately
    /// generic so that no detail about the failure leaks to the user.
    #[error("Username must be alphanumeric")]
    Authentication,

    /// A protocol rule was violated.
    #[error("Protocol Violation: {0}")]
    Protocol(String),

    /// The remote end closed the stream.
    #[error("Connection closed")]
    Closed,

    /// A frame announced more bytes than the configured limit.
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The named user is not in the local directory snapshot.
    #[error("No user {0}")]
    UnknownPeer(String),

    /// The named user declined, is mid-connection, or is unreachable.
    #[error("{0} is busy")]
    Busy(String),

    /// No port in the listening range could be bound.
    #[error("No free port in range {min}..={max}")]
    PortsExhausted { min: u16, max: u16 },

    /// Key material could not be loaded.
    #[error("Key store error: {0}")]
    KeyStore(String),

    /// The configuration is unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,

    /// The server channel is gone.
    #[error("Not logged in")]
    NotLoggedIn,
}

impl From<aes_gcm_siv::Error> for Error {
    fn from(value: aes_gcm_siv::Error) -> Self {
        Self::Crypto(value.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(value: ed25519_dalek::SignatureError) -> Self {
        Self::Crypto(value.to_string())
    }
}

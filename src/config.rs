use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::Error;

/// Host the entry points talk to when none is given.
pub const DEFAULT_HOST: &str = "localhost";

/// Port the directory server listens on when none is given.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Settings shared by the directory server and its clients.
///
/// Both sides must agree on `max_port`, since it is the modulus of the
/// key-port convention.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Address a client's key and chat listeners bind to. When unset, the
    /// client uses the local address of its server connection, so the
    /// server and peers can reach it at the address the server sees.
    pub bind_ip: Option<IpAddr>,
    /// Lowest port a client may listen on for a peer.
    pub min_port: u16,
    /// Highest port a client may listen on for a peer.
    pub max_port: u16,
    pub max_username_len: usize,
    pub max_frame_len: usize,
    /// How long the key listener blocks in `accept` before re-checking
    /// the running flag.
    pub accept_poll_interval: Duration,
    /// Context string for deriving box keys.
    pub protocol_info: Vec<u8>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bind_ip: None,
            min_port: 49152,
            max_port: 65535,
            max_username_len: 32,
            max_frame_len: 64 * 1024,
            accept_poll_interval: Duration::from_secs(1),
            protocol_info: b"Rendezchat-Box-v1".to_vec(),
        }
    }
}

impl ChatConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_port == 0 {
            return Err(Error::Config("max_port must be non-zero".to_string()));
        }
        if self.min_port > self.max_port {
            return Err(Error::Config(format!(
                "min_port {} is above max_port {}",
                self.min_port, self.max_port
            )));
        }
        if self.accept_poll_interval.is_zero() {
            return Err(Error::Config(
                "accept_poll_interval must be non-zero".to_string(),
            ));
        }
        if self.max_username_len == 0 || self.max_frame_len == 0 {
            return Err(Error::Config("frame limits must be non-zero".to_string()));
        }
        Ok(())
    }

    /// The ports a client scans when binding a peer listener.
    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.min_port..=self.max_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ChatConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_port_range_is_rejected() {
        let config = ChatConfig {
            min_port: 9000,
            max_port: 8000,
            ..ChatConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let config = ChatConfig {
            accept_poll_interval: Duration::ZERO,
            ..ChatConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

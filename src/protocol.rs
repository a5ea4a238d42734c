//! Message kinds exchanged over authenticated channels.
//!
//! The wire encodings are byte-compatible with the historic format (single
//! command bytes, `:` separated records), but inside the crate every
//! message is one of the tagged variants below.

use std::net::IpAddr;
use std::ops::RangeInclusive;

use crate::{Error, SessionKey};

const QUERY: &[u8] = b"?";
const UNAVAILABLE: &[u8] = b":";
const DECLINE: &[u8] = b"n";
const SEPARATOR: u8 = b':';

/// The key-listener port a client derives from its outbound port.
///
/// `(port + 1) mod max_port`. Both the server and the client compute it,
/// so it must not change.
pub fn key_port(port: u16, max_port: u16) -> u16 {
    let next = u32::from(port) + 1;
    match next.checked_rem(u32::from(max_port)) {
        Some(derived) => u16::try_from(derived).unwrap_or(0),
        None => 0,
    }
}

fn parse_port(text: &[u8], range: &RangeInclusive<u16>) -> Option<u16> {
    let port: u16 = std::str::from_utf8(text).ok()?.parse().ok()?;
    range.contains(&port).then_some(port)
}

/// A request a logged-in client sends to the directory server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Fetch the directory (`?`).
    ListClients,
    /// Log out (the empty message).
    Disconnect,
    /// Start a chat with the named user.
    Connect(String),
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::ListClients => QUERY.to_vec(),
            Command::Disconnect => Vec::new(),
            Command::Connect(name) => name.as_bytes().to_vec(),
        }
    }

    /// Every payload is a valid command; anything that is not a query or a
    /// close is a session request.
    pub fn decode(bytes: &[u8]) -> Self {
        match bytes {
            [] => Command::Disconnect,
            QUERY => Command::ListClients,
            name => Command::Connect(String::from_utf8_lossy(name).into_owned()),
        }
    }
}

/// One record of the directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub ip: IpAddr,
    pub key_port: u16,
}

impl DirectoryEntry {
    /// Newline-joined `name:ip:key_port` records.
    pub fn encode_list(entries: &[DirectoryEntry]) -> Vec<u8> {
        entries
            .iter()
            .map(|entry| format!("{}:{}:{}", entry.name, entry.ip, entry.key_port))
            .collect::<Vec<_>>()
            .join("\n")
            .into_bytes()
    }

    pub fn decode_list(bytes: &[u8]) -> Result<Vec<DirectoryEntry>, Error> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::Protocol("Directory listing is not UTF-8".to_string()))?;

        text.split('\n')
            .filter(|line| !line.is_empty())
            .map(Self::decode_line)
            .collect()
    }

    fn decode_line(line: &str) -> Result<DirectoryEntry, Error> {
        let malformed = || Error::Protocol(format!("Malformed directory record {line:?}"));

        // Name up to the first separator, port after the last, so IPv6
        // addresses keep their colons.
        let (name, rest) = line.split_once(':').ok_or_else(malformed)?;
        let (ip, port) = rest.rsplit_once(':').ok_or_else(malformed)?;

        Ok(DirectoryEntry {
            name: name.to_string(),
            ip: ip.parse().map_err(|_| malformed())?,
            key_port: port.parse().map_err(|_| malformed())?,
        })
    }
}

/// The server's push to a key listener: `from` wants to chat, using `key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPush {
    pub from: String,
    pub key: SessionKey,
}

impl KeyPush {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.from.len() + 1 + self.key.as_bytes().len());
        bytes.extend_from_slice(self.from.as_bytes());
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(self.key.as_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        // Names never contain the separator; key bytes may.
        let split = bytes
            .iter()
            .position(|&b| b == SEPARATOR)
            .ok_or_else(|| Error::Protocol("Key push without separator".to_string()))?;
        let (from, key) = (&bytes[..split], &bytes[split + 1..]);

        let from = std::str::from_utf8(from)
            .map_err(|_| Error::Protocol("Key push name is not UTF-8".to_string()))?;

        Ok(Self {
            from: from.to_string(),
            key: SessionKey::from_slice(key)?,
        })
    }
}

/// A key listener's answer to a [`KeyPush`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushReply {
    Decline,
    /// The port the peer is now listening on.
    Accept(u16),
}

impl PushReply {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            PushReply::Decline => DECLINE.to_vec(),
            PushReply::Accept(port) => port.to_string().into_bytes(),
        }
    }

    /// Anything other than a decimal port inside `range` is a decline.
    pub fn decode(bytes: &[u8], range: &RangeInclusive<u16>) -> Self {
        match parse_port(bytes, range) {
            Some(port) => PushReply::Accept(port),
            None => PushReply::Decline,
        }
    }
}

/// The server's answer to [`Command::Connect`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayReply {
    /// Unknown, busy, or declining target.
    Unavailable,
    /// The target listens on `port` and expects the chat under `key`.
    Ready { port: u16, key: SessionKey },
}

impl RelayReply {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RelayReply::Unavailable => UNAVAILABLE.to_vec(),
            RelayReply::Ready { port, key } => {
                let mut bytes = port.to_string().into_bytes();
                bytes.push(SEPARATOR);
                bytes.extend_from_slice(key.as_bytes());
                bytes
            }
        }
    }

    /// Empty, malformed or out-of-range ports and wrong-length keys are all
    /// read as [`RelayReply::Unavailable`].
    pub fn decode(bytes: &[u8], range: &RangeInclusive<u16>) -> Self {
        let Some(split) = bytes.iter().position(|&b| b == SEPARATOR) else {
            return RelayReply::Unavailable;
        };
        let (port, key) = (&bytes[..split], &bytes[split + 1..]);

        match (parse_port(port, range), SessionKey::from_slice(key)) {
            (Some(port), Ok(key)) => RelayReply::Ready { port, key },
            _ => RelayReply::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SESSION_KEY_SIZE;

    const RANGE: RangeInclusive<u16> = 49152..=65535;

    #[test]
    fn test_key_port_convention() {
        assert_eq!(key_port(50000, 65535), 50001);
        assert_eq!(key_port(65533, 65535), 65534);
        assert_eq!(key_port(65534, 65535), 0);
        assert_eq!(key_port(65535, 65535), 1);
        assert_eq!(key_port(8000, 0), 0);
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!(Command::ListClients.encode(), b"?");
        assert!(Command::Disconnect.encode().is_empty());
        assert_eq!(Command::Connect("bob".into()).encode(), b"bob");

        assert_eq!(Command::decode(b"?"), Command::ListClients);
        assert_eq!(Command::decode(b""), Command::Disconnect);
        assert_eq!(Command::decode(b"bob"), Command::Connect("bob".into()));
        assert_eq!(Command::decode(b"??"), Command::Connect("??".into()));
    }

    #[test]
    fn test_directory_listing() {
        let entries = vec![
            DirectoryEntry {
                name: "alice".into(),
                ip: "127.0.0.1".parse().unwrap(),
                key_port: 50001,
            },
            DirectoryEntry {
                name: "bob".into(),
                ip: "::1".parse().unwrap(),
                key_port: 50003,
            },
        ];

        let encoded = DirectoryEntry::encode_list(&entries);
        assert_eq!(encoded, b"alice:127.0.0.1:50001\nbob:::1:50003");
        assert_eq!(DirectoryEntry::decode_list(&encoded).unwrap(), entries);
    }

    #[test]
    fn test_malformed_directory_is_rejected() {
        assert!(DirectoryEntry::decode_list(b"alice:127.0.0.1").is_err());
        assert!(DirectoryEntry::decode_list(b"alice:nowhere:5").is_err());
        assert!(DirectoryEntry::decode_list(b"alice:127.0.0.1:99999").is_err());
        assert!(DirectoryEntry::decode_list(b"").unwrap().is_empty());
    }

    #[test]
    fn test_key_push_allows_separator_in_key() {
        let key = SessionKey::from_slice(&[SEPARATOR; SESSION_KEY_SIZE]).unwrap();
        let push = KeyPush {
            from: "alice".into(),
            key,
        };

        assert_eq!(KeyPush::decode(&push.encode()).unwrap(), push);
        assert!(KeyPush::decode(b"alice").is_err());
        assert!(KeyPush::decode(b"alice:short").is_err());
    }

    #[test]
    fn test_push_reply_decoding() {
        assert_eq!(PushReply::decode(b"n", &RANGE), PushReply::Decline);
        assert_eq!(PushReply::decode(b"", &RANGE), PushReply::Decline);
        assert_eq!(PushReply::decode(b"80", &RANGE), PushReply::Decline);
        assert_eq!(PushReply::decode(b"50000", &RANGE), PushReply::Accept(50000));
        assert_eq!(PushReply::Accept(50000).encode(), b"50000");
        assert_eq!(PushReply::Decline.encode(), b"n");
    }

    #[test]
    fn test_relay_reply_decoding() {
        let key = SessionKey::random().unwrap();
        let ready = RelayReply::Ready {
            port: 50000,
            key: key.clone(),
        };

        assert_eq!(RelayReply::decode(&ready.encode(), &RANGE), ready);
        assert_eq!(RelayReply::Unavailable.encode(), b":");
        assert_eq!(RelayReply::decode(b":", &RANGE), RelayReply::Unavailable);
        assert_eq!(RelayReply::decode(b"", &RANGE), RelayReply::Unavailable);

        // Historic failure shape: empty port followed by the key.
        let mut empty_port = vec![SEPARATOR];
        empty_port.extend_from_slice(key.as_bytes());
        assert_eq!(RelayReply::decode(&empty_port, &RANGE), RelayReply::Unavailable);

        let mut low_port = b"1024:".to_vec();
        low_port.extend_from_slice(key.as_bytes());
        assert_eq!(RelayReply::decode(&low_port, &RANGE), RelayReply::Unavailable);

        assert_eq!(RelayReply::decode(b"50000:tooshort", &RANGE), RelayReply::Unavailable);
    }
}

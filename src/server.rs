//! The rendezvous/directory server.
//!
//! Each accepted connection runs in its own task and walks through
//! `AwaitingName -> ChallengeSent -> Authenticated -> ServingCommands ->
//! Closed`. The only state the tasks share is the [`Registry`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    CHALLENGE_SIZE, ChatConfig, Command, DhBox, DirectoryEntry, Error, Identity, KeyPush,
    KeyStore, PushReply, RelayReply, SessionKey, TcpChannel, is_valid_username, key_port,
    random_bytes,
};

/// What the server knows about one logged-in client.
#[derive(Clone, Debug)]
pub struct ClientRecord {
    ip: IpAddr,
    key_port: u16,
    session_key: SessionKey,
}

impl ClientRecord {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn key_port(&self) -> u16 {
        self.key_port
    }
}

/// The live map of logged-in users, shared by every connection task.
///
/// A name maps to at most one record; a later login under the same name
/// replaces the earlier record.
#[derive(Clone, Default)]
pub struct Registry {
    clients: Arc<RwLock<HashMap<String, ClientRecord>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str, ip: IpAddr, key_port: u16, session_key: SessionKey) {
        let record = ClientRecord {
            ip,
            key_port,
            session_key,
        };

        let previous = self.clients.write().await.insert(name.to_string(), record);
        if previous.is_some() {
            info!(user = name, "replaced existing registration");
        }
    }

    /// Removes `name` if its record still belongs to the connection that
    /// holds `session_key`. Returns whether anything was removed.
    pub async fn deregister(&self, name: &str, session_key: &SessionKey) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(name) {
            Some(record) if record.session_key == *session_key => {
                clients.remove(name);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, name: &str) -> Option<ClientRecord> {
        self.clients.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.clients.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Snapshot of the directory, ordered by name.
    pub async fn entries(&self) -> Vec<DirectoryEntry> {
        let mut entries: Vec<DirectoryEntry> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(name, record)| DirectoryEntry {
                name: name.clone(),
                ip: record.ip,
                key_port: record.key_port,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

struct Shared {
    identity: Identity,
    keys: Arc<dyn KeyStore>,
    registry: Registry,
    config: ChatConfig,
}

/// Accepts clients, authenticates them and brokers introductions.
pub struct DirectoryServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl DirectoryServer {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        identity: Identity,
        keys: Arc<dyn KeyStore>,
        config: ChatConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                identity,
                keys,
                registry: Registry::new(),
                config,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle on the live registry.
    pub fn registry(&self) -> Registry {
        self.shared.registry.clone()
    }

    /// Runs the accept loop forever, one task per connection.
    pub async fn run(self) -> Result<(), Error> {
        info!(addr = %self.local_addr()?, "waiting for connections");

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };

            let connection = Connection {
                shared: Arc::clone(&self.shared),
                addr,
            };
            tokio::spawn(async move {
                if let Err(err) = connection.serve(stream).await {
                    debug!(%addr, error = %err, "connection ended with an error");
                }
            });
        }
    }
}

/// One accepted client connection.
struct Connection {
    shared: Arc<Shared>,
    addr: SocketAddr,
}

impl Connection {
    async fn serve(self, stream: TcpStream) -> Result<(), Error> {
        let config = &self.shared.config;
        let mut channel = TcpChannel::from_stream(stream, config.max_frame_len);

        // Anything but a well-formed name is dropped without a word.
        let name = match channel.read_frame_limited(config.max_username_len).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(name) if is_valid_username(&name) => name,
                _ => {
                    debug!(addr = %self.addr, "dropping connection with malformed username");
                    return Ok(());
                }
            },
            Err(err) => {
                debug!(addr = %self.addr, error = %err, "no username received");
                return Ok(());
            }
        };
        info!(addr = %self.addr, user = %name, "received connection request");

        let Some(session_key) = self.authenticate(&mut channel, &name).await? else {
            return Ok(());
        };

        let registry = &self.shared.registry;
        let port = key_port(self.addr.port(), config.max_port);
        registry
            .register(&name, self.addr.ip(), port, session_key.clone())
            .await;

        let result = self.serve_commands(&mut channel, &name, &session_key).await;

        if registry.deregister(&name, &session_key).await {
            info!(user = %name, "user disconnected");
        }
        // The peer may already be gone.
        let _ = channel.shutdown().await;

        result
    }

    /// Challenges the client to prove it holds the private keys of `name`.
    /// Returns the fresh session key on success and `None` when the
    /// connection must be dropped.
    async fn authenticate(
        &self,
        channel: &mut TcpChannel,
        name: &str,
    ) -> Result<Option<SessionKey>, Error> {
        let shared = &self.shared;

        let client = match shared.keys.public_info(name) {
            Ok(client) => client,
            Err(err) => {
                warn!(user = name, error = %err, "no keys for user");
                return Ok(None);
            }
        };
        let dh_box = DhBox::new(&shared.identity, &client, &shared.config.protocol_info)?;

        let challenge = random_bytes::<CHALLENGE_SIZE>()?;
        channel.asym_send(&challenge, &shared.identity, &dh_box).await?;

        let response = channel.recv_verify(&client).await;
        if response != challenge {
            warn!(user = name, addr = %self.addr, "failed login");
            return Ok(None);
        }
        info!(user = name, "authenticated");

        let session_key = SessionKey::random()?;
        channel
            .asym_send(session_key.as_bytes(), &shared.identity, &dh_box)
            .await?;

        Ok(Some(session_key))
    }

    async fn serve_commands(
        &self,
        channel: &mut TcpChannel,
        name: &str,
        session_key: &SessionKey,
    ) -> Result<(), Error> {
        loop {
            let payload = channel.mac_recv(session_key).await;

            match Command::decode(&payload) {
                Command::ListClients => {
                    let entries = self.shared.registry.entries().await;
                    debug!(user = name, count = entries.len(), "directory query");
                    channel
                        .mac_send(&DirectoryEntry::encode_list(&entries), session_key)
                        .await?;
                }
                Command::Disconnect => return Ok(()),
                Command::Connect(target) => {
                    let reply = self.rendezvous(name, &target).await;
                    channel.mac_send(&reply.encode(), session_key).await?;
                }
            }
        }
    }

    /// Introduces `requester` to `target`: mints a peer session key, pushes
    /// it to the target's key listener and relays the target's answer.
    async fn rendezvous(&self, requester: &str, target: &str) -> RelayReply {
        let Some(record) = self.shared.registry.lookup(target).await else {
            debug!(user = requester, peer = target, "session request for unknown user");
            return RelayReply::Unavailable;
        };

        match self.push_key(requester, &record).await {
            Ok(reply) => {
                let accepted = matches!(reply, RelayReply::Ready { .. });
                info!(user = requester, peer = target, accepted, "session request relayed");
                reply
            }
            Err(err) => {
                info!(
                    user = requester,
                    peer = target,
                    error = %err,
                    "could not reach key listener"
                );
                RelayReply::Unavailable
            }
        }
    }

    async fn push_key(&self, requester: &str, record: &ClientRecord) -> Result<RelayReply, Error> {
        let config = &self.shared.config;
        let peer_key = SessionKey::random()?;

        let stream = TcpStream::connect((record.ip, record.key_port)).await?;
        let mut key_channel = TcpChannel::from_stream(stream, config.max_frame_len);

        let push = KeyPush {
            from: requester.to_string(),
            key: peer_key.clone(),
        };
        key_channel
            .mac_send(&push.encode(), &record.session_key)
            .await?;
        let answer = key_channel.mac_recv(&record.session_key).await;
        drop(key_channel);

        Ok(match PushReply::decode(&answer, &config.port_range()) {
            PushReply::Accept(port) => RelayReply::Ready {
                port,
                key: peer_key,
            },
            PushReply::Decline => RelayReply::Unavailable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryKeyStore, PeerPublicInfo};

    struct TestServer {
        addr: SocketAddr,
        registry: Registry,
        server_public: PeerPublicInfo,
        config: ChatConfig,
    }

    async fn start_server(users: &[&Identity]) -> TestServer {
        let server = Identity::generate("server").unwrap();
        let server_public = server.public_info();

        let mut keys = MemoryKeyStore::new();
        for user in users {
            keys.insert_public(user.public_info());
        }

        let config = ChatConfig::default();
        let directory = DirectoryServer::bind("127.0.0.1:0", server, Arc::new(keys), config.clone())
            .await
            .unwrap();
        let addr = directory.local_addr().unwrap();
        let registry = directory.registry();
        tokio::spawn(directory.run());

        TestServer {
            addr,
            registry,
            server_public,
            config,
        }
    }

    async fn connect(server: &TestServer, name: &str) -> TcpChannel {
        let stream = TcpStream::connect(server.addr).await.unwrap();
        let mut channel = TcpChannel::from_stream(stream, server.config.max_frame_len);
        channel.write_frame(name.as_bytes()).await.unwrap();
        channel
    }

    /// Runs the client half of the handshake by hand.
    async fn login(server: &TestServer, identity: &Identity) -> (TcpChannel, SessionKey) {
        let mut channel = connect(server, identity.name()).await;
        let dh_box =
            DhBox::new(identity, &server.server_public, &server.config.protocol_info).unwrap();

        let challenge = channel.asym_recv(&server.server_public, &dh_box).await;
        assert_eq!(challenge.len(), CHALLENGE_SIZE);
        channel.sign_send(&challenge, identity).await.unwrap();

        let key = channel.asym_recv(&server.server_public, &dh_box).await;
        (channel, SessionKey::from_slice(&key).unwrap())
    }

    async fn query(channel: &mut TcpChannel, key: &SessionKey) -> Vec<DirectoryEntry> {
        channel.mac_send(&Command::ListClients.encode(), key).await.unwrap();
        DirectoryEntry::decode_list(&channel.mac_recv(key).await).unwrap()
    }

    #[tokio::test]
    async fn test_registry_last_writer_wins() {
        let registry = Registry::new();
        let first = SessionKey::random().unwrap();
        let second = SessionKey::random().unwrap();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        registry.register("alice", ip, 50001, first.clone()).await;
        registry.register("alice", ip, 50003, second.clone()).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.lookup("alice").await.unwrap().key_port(), 50003);

        // The stale connection's teardown leaves the newer login alone.
        assert!(!registry.deregister("alice", &first).await);
        assert!(registry.contains("alice").await);

        assert!(registry.deregister("alice", &second).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_registry_entries_are_sorted() {
        let registry = Registry::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for (name, port) in [("carol", 3), ("alice", 1), ("bob", 2)] {
            registry.register(name, ip, port, SessionKey::random().unwrap()).await;
        }

        let names: Vec<String> = registry.entries().await.into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_successful_login_registers_user() {
        let alice = Identity::generate("alice").unwrap();
        let server = start_server(&[&alice]).await;

        let (mut channel, key) = login(&server, &alice).await;
        let entries = query(&mut channel, &key).await;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "alice");
        assert_eq!(entries[0].ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_non_alphanumeric_name_is_dropped_silently() {
        let server = start_server(&[]).await;
        let mut channel = connect(&server, "bad name!").await;

        assert!(matches!(channel.read_frame().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_unknown_user_is_dropped() {
        let server = start_server(&[]).await;
        let mut channel = connect(&server, "nobody").await;

        assert!(matches!(channel.read_frame().await, Err(Error::Closed)));
        assert!(server.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_wrong_private_key_never_gets_session_key() {
        let alice = Identity::generate("alice").unwrap();
        let server = start_server(&[&alice]).await;

        // Same name, different keys.
        let mallory = Identity::generate("alice").unwrap();
        let mut channel = connect(&server, "alice").await;
        let dh_box =
            DhBox::new(&mallory, &server.server_public, &server.config.protocol_info).unwrap();

        let challenge = channel.asym_recv(&server.server_public, &dh_box).await;
        assert!(challenge.is_empty(), "Mallory cannot open the challenge");

        channel
            .sign_send(&random_bytes::<CHALLENGE_SIZE>().unwrap(), &mallory)
            .await
            .unwrap();

        assert!(channel.asym_recv(&server.server_public, &dh_box).await.is_empty());
        assert!(matches!(channel.read_frame().await, Err(Error::Closed)));
        assert!(!server.registry.contains("alice").await);
    }

    #[tokio::test]
    async fn test_wrong_echo_closes_connection() {
        let alice = Identity::generate("alice").unwrap();
        let server = start_server(&[&alice]).await;

        let mut channel = connect(&server, "alice").await;
        let dh_box =
            DhBox::new(&alice, &server.server_public, &server.config.protocol_info).unwrap();

        let mut challenge = channel.asym_recv(&server.server_public, &dh_box).await;
        challenge[0] ^= 0xFF;
        channel.sign_send(&challenge, &alice).await.unwrap();

        assert!(matches!(channel.read_frame().await, Err(Error::Closed)));
        assert!(!server.registry.contains("alice").await);
    }

    #[tokio::test]
    async fn test_unregistered_target_gets_sentinel() {
        let alice = Identity::generate("alice").unwrap();
        let server = start_server(&[&alice]).await;
        let (mut channel, key) = login(&server, &alice).await;

        channel
            .mac_send(&Command::Connect("carol".into()).encode(), &key)
            .await
            .unwrap();
        assert_eq!(channel.mac_recv(&key).await, b":");

        // The loop keeps serving afterwards.
        assert_eq!(query(&mut channel, &key).await.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_command_deregisters() {
        let alice = Identity::generate("alice").unwrap();
        let bob = Identity::generate("bob").unwrap();
        let server = start_server(&[&alice, &bob]).await;

        let (mut alice_channel, alice_key) = login(&server, &alice).await;
        let (mut bob_channel, bob_key) = login(&server, &bob).await;
        assert_eq!(query(&mut bob_channel, &bob_key).await.len(), 2);

        alice_channel
            .mac_send(&Command::Disconnect.encode(), &alice_key)
            .await
            .unwrap();
        assert!(matches!(alice_channel.read_frame().await, Err(Error::Closed)));

        let names: Vec<String> = query(&mut bob_channel, &bob_key)
            .await
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["bob"]);
    }

    #[tokio::test]
    async fn test_dropped_connection_deregisters() {
        let alice = Identity::generate("alice").unwrap();
        let bob = Identity::generate("bob").unwrap();
        let server = start_server(&[&alice, &bob]).await;

        let (mut alice_channel, alice_key) = login(&server, &alice).await;
        let (mut bob_channel, bob_key) = login(&server, &bob).await;
        assert_eq!(query(&mut alice_channel, &alice_key).await.len(), 2);

        drop(alice_channel);
        for _ in 0..50 {
            if !server.registry.contains("alice").await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(query(&mut bob_channel, &bob_key).await.len(), 1);
    }
}

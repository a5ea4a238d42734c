//! The client side of the protocol.
//!
//! A [`ClientSession`] owns the authenticated server channel, the directory
//! snapshot and the one chat the client may have open. The key listener
//! runs in its own task and hands session requests to the owner of the
//! session over a channel instead of touching its state.

mod listener;
mod registry;
mod state;

pub use listener::RendezvousRequest;
pub use registry::{PeerEntry, PeerRegistry};
pub use state::ConnectionMode;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    ChatConfig, ChatHandle, Command, DhBox, DirectoryEntry, Error, Identity, PeerLink,
    PeerPublicInfo, RelayReply, SessionKey, TcpChannel, key_port,
};
use listener::{KeyListener, ListenerContext};
use state::ConnectionState;

/// Session requests that may wait for an answer at once.
const REQUEST_QUEUE: usize = 4;

/// A logged-in client.
pub struct ClientSession {
    identity: Identity,
    config: ChatConfig,
    server: TcpChannel,
    server_key: SessionKey,
    key_addr: SocketAddr,
    peers: PeerRegistry,
    state: ConnectionState,
    running: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// Connects to the directory server at `addr` and proves ownership of
    /// `identity`.
    ///
    /// The key listener is bound before the username goes out, so the
    /// server can reach it as soon as the login completes. It binds to
    /// `config.bind_ip`, or else to the local address of the server
    /// connection, which is the address the server records for this
    /// client. Session requests pushed to it arrive on the returned
    /// receiver.
    pub async fn login<A: ToSocketAddrs>(
        addr: A,
        identity: Identity,
        server: &PeerPublicInfo,
        config: ChatConfig,
    ) -> Result<(Self, mpsc::Receiver<RendezvousRequest>), Error> {
        config.validate()?;

        let stream = TcpStream::connect(addr).await?;
        let local = stream.local_addr()?;
        let bind_ip = config.bind_ip.unwrap_or(local.ip());
        let key_listener =
            KeyListener::bind(bind_ip, key_port(local.port(), config.max_port)).await?;
        let key_addr = key_listener.local_addr()?;

        let mut channel = TcpChannel::from_stream(stream, config.max_frame_len);
        channel.write_frame(identity.name().as_bytes()).await?;

        let dh_box = DhBox::new(&identity, server, &config.protocol_info)?;
        let challenge = channel.asym_recv(server, &dh_box).await;
        if challenge.is_empty() {
            warn!(user = identity.name(), "server did not send a valid challenge");
            return Err(Error::Authentication);
        }
        channel.sign_send(&challenge, &identity).await?;

        let server_key = SessionKey::from_slice(&channel.asym_recv(server, &dh_box).await)
            .map_err(|_| Error::Authentication)?;
        info!(user = identity.name(), "logged in");

        let state = ConnectionState::default();
        let running = Arc::new(AtomicBool::new(true));
        let (requests_tx, requests) = mpsc::channel(REQUEST_QUEUE);

        let listener = key_listener.spawn(ListenerContext {
            relay_key: server_key.clone(),
            mode: state.mode().clone(),
            running: Arc::clone(&running),
            requests: requests_tx,
            poll_interval: config.accept_poll_interval,
            max_frame_len: config.max_frame_len,
        });

        let mut session = Self {
            identity,
            config,
            server: channel,
            server_key,
            key_addr,
            peers: PeerRegistry::new(),
            state,
            running,
            listener: Some(listener),
        };
        session.get_clients().await?;

        Ok((session, requests))
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    /// Where the key listener accepts pushes. Chat ports open on the same
    /// address.
    pub fn key_listener_addr(&self) -> SocketAddr {
        self.key_addr
    }

    /// The key this client shares with the server.
    pub fn server_key(&self) -> &SessionKey {
        &self.server_key
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn mode(&self) -> &ConnectionMode {
        self.state.mode()
    }

    /// The peer of the chat last started through this session.
    pub fn chatting_with(&self) -> Option<&str> {
        self.state.peer()
    }

    /// Refreshes the directory snapshot and returns every other user.
    pub async fn get_clients(&mut self) -> Result<Vec<String>, Error> {
        self.server
            .mac_send(&Command::ListClients.encode(), &self.server_key)
            .await?;

        let listing = self.server.mac_recv(&self.server_key).await;
        if listing.is_empty() {
            return Err(Error::NotLoggedIn);
        }

        self.peers.refresh(DirectoryEntry::decode_list(&listing)?);
        Ok(self.peers.names_except(self.identity.name()))
    }

    /// Asks the server to broker a chat with `target` and connects to it.
    ///
    /// Names missing from the snapshot fail without contacting the server.
    /// A decline, a malformed answer or a refused connection are all
    /// reported as [`Error::Busy`]; nothing is retried.
    pub async fn request_session(&mut self, target: &str) -> Result<PeerLink, Error> {
        let Some(entry) = self.peers.get(target) else {
            return Err(Error::UnknownPeer(target.to_string()));
        };
        let ip = entry.ip();

        let _connecting = self.state.mode().begin_connecting();

        self.server
            .mac_send(&Command::Connect(target.to_string()).encode(), &self.server_key)
            .await?;
        let answer = self.server.mac_recv(&self.server_key).await;
        if answer.is_empty() {
            return Err(Error::NotLoggedIn);
        }

        let (port, key) = match RelayReply::decode(&answer, &self.config.port_range()) {
            RelayReply::Ready { port, key } => (port, key),
            RelayReply::Unavailable => {
                info!(peer = target, "session request refused");
                return Err(Error::Busy(target.to_string()));
            }
        };
        self.peers.remember_key(target, key.clone());
        self.state.teardown();

        let stream = match TcpStream::connect((ip, port)).await {
            Ok(stream) => stream,
            Err(err) => {
                info!(peer = target, port, error = %err, "could not reach peer");
                return Err(Error::Busy(target.to_string()));
            }
        };
        info!(peer = target, port, "connected to peer");

        Ok(PeerLink::new(
            stream,
            target.to_string(),
            key,
            self.config.max_frame_len,
        ))
    }

    /// Accepts a pushed session request and waits for the requester to
    /// connect.
    pub async fn accept(&mut self, request: RendezvousRequest) -> Result<PeerLink, Error> {
        self.state.teardown();

        let link = request.accept(self.key_addr.ip(), &self.config).await?;
        self.peers
            .remember_key(link.peer(), link.session_key().clone());
        Ok(link)
    }

    /// Starts chatting over `link`, replacing any chat this session had
    /// open. Events of the replaced chat never reach the new handle.
    pub fn start_chat(&mut self, link: PeerLink) -> ChatHandle {
        self.state.teardown();
        self.state.install(link.peer());

        let handle = link.spawn();
        self.state.attach(handle.abort_handles());
        handle
    }

    /// Tells the server goodbye and stops the key listener.
    ///
    /// Returns within about one poll interval even while a session request
    /// is still held unanswered.
    pub async fn logout(mut self) -> Result<(), Error> {
        self.state.teardown();

        let result = self
            .server
            .mac_send(&Command::Disconnect.encode(), &self.server_key)
            .await;
        let _ = self.server.shutdown().await;

        self.running.store(false, Ordering::Release);
        if let Some(listener) = self.listener.take() {
            let _ = listener.await;
        }
        debug!(user = self.identity.name(), "logged out");

        result
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

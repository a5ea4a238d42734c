use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ConnectionMode;
use crate::{ChatConfig, Error, KeyPush, PeerLink, PushReply, SessionKey, TcpChannel};

/// A session request the server pushed to this client.
///
/// The key listener waits until the request is accepted, declined or
/// dropped before taking the next one. Dropping it declines implicitly:
/// the server reads the closed socket as a refusal.
#[derive(Debug)]
pub struct RendezvousRequest {
    requester: String,
    peer_key: SessionKey,
    relay_key: SessionKey,
    channel: TcpChannel,
    done: oneshot::Sender<()>,
}

impl RendezvousRequest {
    /// The user who wants to chat.
    pub fn requester(&self) -> &str {
        &self.requester
    }

    pub async fn decline(mut self) -> Result<(), Error> {
        info!(peer = %self.requester, "declining session request");
        self.channel
            .mac_send(&PushReply::Decline.encode(), &self.relay_key)
            .await
    }

    /// Opens a chat port on `ip`, tells the server where it is and waits
    /// for the requester to connect.
    pub(crate) async fn accept(self, ip: IpAddr, config: &ChatConfig) -> Result<PeerLink, Error> {
        let RendezvousRequest {
            requester,
            peer_key,
            relay_key,
            mut channel,
            done,
        } = self;

        let (listener, port) = match bind_in_range(ip, config.port_range()).await {
            Ok(bound) => bound,
            Err(err) => {
                warn!(peer = %requester, error = %err, "no free chat port");
                let _ = channel.mac_send(&PushReply::Decline.encode(), &relay_key).await;
                return Err(err);
            }
        };

        channel
            .mac_send(&PushReply::Accept(port).encode(), &relay_key)
            .await?;
        drop(channel);
        drop(done);

        let (stream, addr) = listener.accept().await?;
        info!(peer = %requester, %addr, "accepted chat connection");

        Ok(PeerLink::new(stream, requester, peer_key, config.max_frame_len))
    }
}

/// Binds the first free port of `range` on `ip`.
pub(crate) async fn bind_in_range(
    ip: IpAddr,
    range: RangeInclusive<u16>,
) -> Result<(TcpListener, u16), Error> {
    let (min, max) = (*range.start(), *range.end());

    for port in range {
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(err) => debug!(port, error = %err, "chat port unavailable"),
        }
    }

    Err(Error::PortsExhausted { min, max })
}

/// Everything the key listener task needs.
pub(crate) struct ListenerContext {
    pub(crate) relay_key: SessionKey,
    pub(crate) mode: ConnectionMode,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) requests: mpsc::Sender<RendezvousRequest>,
    pub(crate) poll_interval: Duration,
    pub(crate) max_frame_len: usize,
}

/// The socket the server pushes session requests to.
pub(crate) struct KeyListener {
    listener: TcpListener,
}

impl KeyListener {
    pub(crate) async fn bind(ip: IpAddr, port: u16) -> Result<Self, Error> {
        let listener = TcpListener::bind((ip, port)).await?;
        debug!(%ip, port, "key listener bound");
        Ok(Self { listener })
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    pub(crate) fn spawn(self, context: ListenerContext) -> JoinHandle<()> {
        tokio::spawn(self.run(context))
    }

    /// Accepts until the running flag clears. The flag is checked at least
    /// once per poll interval.
    async fn run(self, context: ListenerContext) {
        while context.running.load(Ordering::Acquire) {
            let poll = context.poll_interval;
            let stream = match tokio::time::timeout(poll, self.listener.accept()).await {
                Err(_) => continue,
                Ok(Err(err)) => {
                    warn!(error = %err, "key listener accept failed");
                    continue;
                }
                Ok(Ok((stream, _))) => stream,
            };

            if !context.handle(stream).await {
                break;
            }
        }
        debug!("key listener stopped");
    }
}

impl ListenerContext {
    /// Handles one push. Returns `false` once nobody is taking requests.
    async fn handle(&self, stream: TcpStream) -> bool {
        let mut channel = TcpChannel::from_stream(stream, self.max_frame_len);

        let push = match KeyPush::decode(&channel.mac_recv(&self.relay_key).await) {
            Ok(push) => push,
            Err(err) => {
                debug!(error = %err, "ignoring malformed key push");
                return true;
            }
        };

        if self.mode.is_connecting() {
            info!(peer = %push.from, "busy connecting, rejecting session request");
            let _ = channel
                .mac_send(&PushReply::Decline.encode(), &self.relay_key)
                .await;
            return true;
        }

        info!(peer = %push.from, "session request received");
        let (done, mut finished) = oneshot::channel();
        let request = RendezvousRequest {
            requester: push.from,
            peer_key: push.key,
            relay_key: self.relay_key.clone(),
            channel,
            done,
        };
        if self.requests.send(request).await.is_err() {
            return false;
        }

        // Resolves when the request is answered or dropped. A request still
        // unanswered at shutdown is declined when its owner drops it.
        loop {
            match tokio::time::timeout(self.poll_interval, &mut finished).await {
                Ok(_) => return true,
                Err(_) if !self.running.load(Ordering::Acquire) => {
                    debug!("shutting down with a session request unanswered");
                    return false;
                }
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_bind_in_range_skips_taken_ports() {
        let (taken, port) = bind_in_range(LOCALHOST, 49500..=49600).await.unwrap();
        let (_next, next_port) = bind_in_range(LOCALHOST, port..=49600).await.unwrap();

        assert!(next_port > port);
        drop(taken);
    }

    #[tokio::test]
    async fn test_bind_in_range_reports_exhaustion() {
        let (_taken, port) = bind_in_range(LOCALHOST, 49700..=49800).await.unwrap();

        let err = bind_in_range(LOCALHOST, port..=port).await.unwrap_err();
        assert!(matches!(err, Error::PortsExhausted { min, max } if min == port && max == port));
    }

    struct Harness {
        addr: SocketAddr,
        relay_key: SessionKey,
        mode: ConnectionMode,
        running: Arc<AtomicBool>,
        requests: mpsc::Receiver<RendezvousRequest>,
        task: JoinHandle<()>,
    }

    async fn spawn_listener() -> Harness {
        let listener = KeyListener::bind(LOCALHOST, 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay_key = SessionKey::random().unwrap();
        let mode = ConnectionMode::default();
        let running = Arc::new(AtomicBool::new(true));
        let (tx, requests) = mpsc::channel(1);

        let task = listener.spawn(ListenerContext {
            relay_key: relay_key.clone(),
            mode: mode.clone(),
            running: Arc::clone(&running),
            requests: tx,
            poll_interval: Duration::from_millis(50),
            max_frame_len: 4096,
        });

        Harness {
            addr,
            relay_key,
            mode,
            running,
            requests,
            task,
        }
    }

    /// Plays the server: pushes a key and returns the listener's reply.
    async fn push(harness: &Harness, from: &str) -> (TcpChannel, SessionKey) {
        let stream = TcpStream::connect(harness.addr).await.unwrap();
        let mut channel = TcpChannel::from_stream(stream, 4096);
        let key = SessionKey::random().unwrap();
        let push = KeyPush {
            from: from.to_string(),
            key: key.clone(),
        };
        channel
            .mac_send(&push.encode(), &harness.relay_key)
            .await
            .unwrap();
        (channel, key)
    }

    #[tokio::test]
    async fn test_request_is_forwarded_and_declined() {
        let mut harness = spawn_listener().await;
        let (mut channel, _) = push(&harness, "alice").await;

        let request = harness.requests.recv().await.unwrap();
        assert_eq!(request.requester(), "alice");
        request.decline().await.unwrap();

        let reply = channel.mac_recv(&harness.relay_key).await;
        assert_eq!(reply, PushReply::Decline.encode());
    }

    #[tokio::test]
    async fn test_accept_replies_with_port_and_links() {
        let mut harness = spawn_listener().await;
        let (mut channel, key) = push(&harness, "alice").await;
        let config = ChatConfig::default();

        let request = harness.requests.recv().await.unwrap();
        let accepting = tokio::spawn(async move { request.accept(LOCALHOST, &config).await });

        let reply = channel.mac_recv(&harness.relay_key).await;
        let port = match PushReply::decode(&reply, &ChatConfig::default().port_range()) {
            PushReply::Accept(port) => port,
            PushReply::Decline => 0,
        };
        assert_ne!(port, 0, "expected a port, got {reply:?}");

        let _stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let link = accepting.await.unwrap().unwrap();
        assert_eq!(link.peer(), "alice");
        assert_eq!(link.session_key(), &key);
    }

    #[tokio::test]
    async fn test_connecting_client_auto_rejects() {
        let harness = spawn_listener().await;
        let _guard = harness.mode.begin_connecting();

        let (mut channel, _) = push(&harness, "alice").await;
        let reply = channel.mac_recv(&harness.relay_key).await;
        assert_eq!(reply, PushReply::Decline.encode());
    }

    #[tokio::test]
    async fn test_dropped_request_reads_as_refusal() {
        let mut harness = spawn_listener().await;
        let (mut channel, _) = push(&harness, "alice").await;

        drop(harness.requests.recv().await.unwrap());
        let reply = channel.mac_recv(&harness.relay_key).await;
        assert_eq!(PushReply::decode(&reply, &(49152..=65535)), PushReply::Decline);
    }

    #[tokio::test]
    async fn test_listener_stops_with_request_unanswered() {
        let mut harness = spawn_listener().await;
        let (mut channel, _) = push(&harness, "alice").await;
        let request = harness.requests.recv().await.unwrap();

        harness.running.store(false, Ordering::Release);
        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .unwrap()
            .unwrap();

        drop(request);
        let reply = channel.mac_recv(&harness.relay_key).await;
        assert_eq!(PushReply::decode(&reply, &(49152..=65535)), PushReply::Decline);
    }

    #[tokio::test]
    async fn test_listener_stops_when_flag_clears() {
        let harness = spawn_listener().await;
        harness.running.store(false, Ordering::Release);
        harness.task.await.unwrap();
    }
}

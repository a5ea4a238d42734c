//! Direct peer-to-peer chat once a rendezvous has succeeded.
//!
//! A link is full duplex: one task drains the socket while the caller's
//! task feeds it lines. Every message travels under the peer session key;
//! an empty message on either side ends the chat.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

use crate::{Error, FrameReader, FrameWriter, SessionKey};

/// Something that happened on a chat link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    Message { from: String, text: String },
    /// The peer sent the close message, or the link failed.
    Disconnected { peer: String },
}

/// An established connection to a peer, keyed with the session key the
/// server handed out for it.
#[derive(Debug)]
pub struct PeerLink {
    stream: TcpStream,
    peer: String,
    key: SessionKey,
    max_frame_len: usize,
}

impl PeerLink {
    pub(crate) fn new(
        stream: TcpStream,
        peer: String,
        key: SessionKey,
        max_frame_len: usize,
    ) -> Self {
        Self {
            stream,
            peer,
            key,
            max_frame_len,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.stream.peer_addr()?)
    }

    /// Starts both halves of the chat in their own tasks.
    ///
    /// Incoming messages are read back from the returned handle, which only
    /// ever sees events of this link. Lines given to the handle are sent
    /// until an empty line is sent or the handle is dropped.
    pub fn spawn(self) -> ChatHandle {
        let (reader, writer) = self.stream.into_split();
        let (input, lines) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        info!(peer = %self.peer, "chat started");

        let receiver = tokio::spawn(receive_loop(
            FrameReader::new(reader, self.max_frame_len),
            self.peer.clone(),
            self.key.clone(),
            events_tx,
        ));
        let sender = tokio::spawn(send_loop(FrameWriter::new(writer), self.key, lines));

        ChatHandle {
            peer: self.peer,
            input,
            events,
            sender,
            receiver,
        }
    }
}

/// The local end of a running chat.
#[derive(Debug)]
pub struct ChatHandle {
    peer: String,
    input: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<ChatEvent>,
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

impl ChatHandle {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queues one line for the peer. An empty line closes the chat.
    pub fn send(&self, line: impl Into<String>) -> Result<(), Error> {
        self.input.send(line.into()).map_err(|_| Error::Closed)
    }

    /// Sends the close message.
    pub fn close(&self) -> Result<(), Error> {
        self.send(String::new())
    }

    /// The next message or disconnect from the peer. `None` once the
    /// receiving half has stopped and every event has been read.
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        self.events.recv().await
    }

    pub(crate) fn abort_handles(&self) -> [AbortHandle; 2] {
        [self.sender.abort_handle(), self.receiver.abort_handle()]
    }

    /// Waits for both halves to stop.
    pub async fn join(self) {
        let _ = tokio::join!(self.sender, self.receiver);
    }
}

/// Delivers every message from the peer until the empty message.
///
/// A tampered, oversize or truncated frame reads as empty too, so any
/// failure on the link also ends the loop.
pub async fn receive_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    peer: String,
    key: SessionKey,
    events: mpsc::UnboundedSender<ChatEvent>,
) {
    loop {
        let message = reader.mac_recv(&key).await;
        if message.is_empty() {
            break;
        }

        let event = ChatEvent::Message {
            from: peer.clone(),
            text: String::from_utf8_lossy(&message).into_owned(),
        };
        if events.send(event).is_err() {
            debug!(peer = %peer, "nobody is listening for chat events");
        }
    }

    info!(peer = %peer, "peer disconnected");
    let _ = events.send(ChatEvent::Disconnected { peer });
}

/// Sends each line from `input`. An empty line, or a closed input, is sent
/// as the close message and ends the loop.
pub async fn send_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    key: SessionKey,
    mut input: mpsc::UnboundedReceiver<String>,
) {
    loop {
        let line = input.recv().await.unwrap_or_default();

        if let Err(err) = writer.mac_send(line.as_bytes(), &key).await {
            debug!(error = %err, "chat link failed while sending");
            break;
        }
        if line.is_empty() {
            break;
        }
    }

    let _ = writer.shutdown().await;
}

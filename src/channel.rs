//! Framing and cryptographic wrapping over a raw byte stream.
//!
//! Every logical message travels as one frame: a 4-byte big-endian length
//! followed by that many bytes. On top of the framing sit the message
//! primitives every other component talks through:
//!
//! - `sign_send` / `recv_verify`: detached signature, no confidentiality.
//! - `asym_send` / `asym_recv`: signature over a [`DhBox`] ciphertext.
//! - `mac_send` / `mac_recv`: symmetric authenticated encryption under a
//!   [`SessionKey`].
//!
//! The plain `*_recv` forms collapse every failure into an empty payload, so
//! a closed stream, a forged frame and an explicit empty message all look
//! alike. The `try_*` forms keep those cases apart for callers that care.

use ed25519_dalek::Signature;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::{DhBox, Error, Identity, PeerPublicInfo, SIGNATURE_SIZE, SessionKey};

/// Splits a signed frame into its signature and payload.
fn split_signed(frame: &[u8]) -> Result<(Signature, &[u8]), Error> {
    if frame.len() < SIGNATURE_SIZE {
        return Err(Error::Protocol("Signed frame too short".to_string()));
    }

    let (signature, payload) = frame.split_at(SIGNATURE_SIZE);
    let mut signature_bytes = [0u8; SIGNATURE_SIZE];
    signature_bytes.copy_from_slice(signature);

    Ok((Signature::from_bytes(&signature_bytes), payload))
}

fn signed(identity: &Identity, payload: &[u8]) -> Vec<u8> {
    let signature = identity.sign(payload);

    let mut frame = Vec::with_capacity(SIGNATURE_SIZE + payload.len());
    frame.extend_from_slice(&signature.to_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Reading half of an authenticated channel.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            max_frame_len,
        }
    }

    /// Reads exactly one frame, refusing anything above the configured
    /// limit. End of stream surfaces as [`Error::Closed`].
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        self.read_frame_limited(self.max_frame_len).await
    }

    /// Reads exactly one frame of at most `limit` bytes.
    pub async fn read_frame_limited(&mut self, limit: usize) -> Result<Vec<u8>, Error> {
        let mut len_bytes = [0u8; 4];
        if let Err(err) = self.inner.read_exact(&mut len_bytes).await {
            return Err(match err.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::Closed,
                _ => Error::Io(err),
            });
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > limit {
            return Err(Error::FrameTooLarge { len, max: limit });
        }

        let mut frame = vec![0u8; len];
        if let Err(err) = self.inner.read_exact(&mut frame).await {
            return Err(match err.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::Closed,
                _ => Error::Io(err),
            });
        }

        tracing::trace!(len, "frame received");
        Ok(frame)
    }

    /// Receives a `sign_send` frame and checks it against `sender`.
    pub async fn try_recv_verify(&mut self, sender: &PeerPublicInfo) -> Result<Vec<u8>, Error> {
        let frame = self.read_frame().await?;
        let (signature, payload) = split_signed(&frame)?;
        sender.verify(payload, &signature)?;
        Ok(payload.to_vec())
    }

    pub async fn recv_verify(&mut self, sender: &PeerPublicInfo) -> Vec<u8> {
        self.try_recv_verify(sender).await.unwrap_or_default()
    }

    /// Receives an `asym_send` frame: the signature must verify under
    /// `sender` and the ciphertext must open under `dh_box`.
    pub async fn try_asym_recv(
        &mut self,
        sender: &PeerPublicInfo,
        dh_box: &DhBox,
    ) -> Result<Vec<u8>, Error> {
        let frame = self.read_frame().await?;
        let (signature, ciphertext) = split_signed(&frame)?;
        sender.verify(ciphertext, &signature)?;
        dh_box.open(ciphertext)
    }

    /// Like [`Self::try_asym_recv`], but any failure yields an empty
    /// payload. Callers cannot tell a bad signature from a bad ciphertext.
    pub async fn asym_recv(&mut self, sender: &PeerPublicInfo, dh_box: &DhBox) -> Vec<u8> {
        self.try_asym_recv(sender, dh_box).await.unwrap_or_default()
    }

    /// Receives a `mac_send` frame.
    ///
    /// `Ok` with an empty payload is an explicit close request from the
    /// peer; a closed stream is `Err(Error::Closed)`.
    pub async fn try_mac_recv(&mut self, key: &SessionKey) -> Result<Vec<u8>, Error> {
        let frame = self.read_frame().await?;
        key.open(&frame)
    }

    /// Receives a `mac_send` frame, mapping every failure to an empty
    /// payload. Treat empty as "peer is gone".
    pub async fn mac_recv(&mut self, key: &SessionKey) -> Vec<u8> {
        self.try_mac_recv(key).await.unwrap_or_default()
    }
}

/// Writing half of an authenticated channel.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes `data` as one length-prefixed frame.
    pub async fn write_frame(&mut self, data: &[u8]) -> Result<(), Error> {
        let len = u32::try_from(data.len()).map_err(|_| Error::FrameTooLarge {
            len: data.len(),
            max: u32::MAX as usize,
        })?;

        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(data).await?;
        self.inner.flush().await?;

        tracing::trace!(len, "frame sent");
        Ok(())
    }

    /// Sends `plaintext` in the clear with a detached signature.
    pub async fn sign_send(&mut self, plaintext: &[u8], identity: &Identity) -> Result<(), Error> {
        self.write_frame(&signed(identity, plaintext)).await
    }

    /// Box-encrypts `plaintext` and signs the ciphertext.
    pub async fn asym_send(
        &mut self,
        plaintext: &[u8],
        identity: &Identity,
        dh_box: &DhBox,
    ) -> Result<(), Error> {
        let ciphertext = dh_box.seal(plaintext)?;
        self.write_frame(&signed(identity, &ciphertext)).await
    }

    /// Encrypts `plaintext` under `key`. Sending an empty plaintext is the
    /// in-band close signal.
    pub async fn mac_send(&mut self, plaintext: &[u8], key: &SessionKey) -> Result<(), Error> {
        let sealed = key.seal(plaintext)?;
        self.write_frame(&sealed).await
    }

    /// Closes the writing direction of the stream.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// A bidirectional authenticated channel.
#[derive(Debug)]
pub struct AuthenticatedChannel<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

/// The channel every network connection in the crate uses.
pub type TcpChannel = AuthenticatedChannel<OwnedReadHalf, OwnedWriteHalf>;

impl TcpChannel {
    pub fn from_stream(stream: TcpStream, max_frame_len: usize) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, max_frame_len)
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> AuthenticatedChannel<R, W> {
    pub fn new(reader: R, writer: W, max_frame_len: usize) -> Self {
        Self {
            reader: FrameReader::new(reader, max_frame_len),
            writer: FrameWriter::new(writer),
        }
    }

    pub fn into_parts(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }

    pub async fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        self.reader.read_frame().await
    }

    pub async fn read_frame_limited(&mut self, limit: usize) -> Result<Vec<u8>, Error> {
        self.reader.read_frame_limited(limit).await
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> Result<(), Error> {
        self.writer.write_frame(data).await
    }

    pub async fn sign_send(&mut self, plaintext: &[u8], identity: &Identity) -> Result<(), Error> {
        self.writer.sign_send(plaintext, identity).await
    }

    pub async fn recv_verify(&mut self, sender: &PeerPublicInfo) -> Vec<u8> {
        self.reader.recv_verify(sender).await
    }

    pub async fn asym_send(
        &mut self,
        plaintext: &[u8],
        identity: &Identity,
        dh_box: &DhBox,
    ) -> Result<(), Error> {
        self.writer.asym_send(plaintext, identity, dh_box).await
    }

    pub async fn asym_recv(&mut self, sender: &PeerPublicInfo, dh_box: &DhBox) -> Vec<u8> {
        self.reader.asym_recv(sender, dh_box).await
    }

    pub async fn mac_send(&mut self, plaintext: &[u8], key: &SessionKey) -> Result<(), Error> {
        self.writer.mac_send(plaintext, key).await
    }

    pub async fn mac_recv(&mut self, key: &SessionKey) -> Vec<u8> {
        self.reader.mac_recv(key).await
    }

    pub async fn try_mac_recv(&mut self, key: &SessionKey) -> Result<Vec<u8>, Error> {
        self.reader.try_mac_recv(key).await
    }

    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.writer.shutdown().await
    }
}

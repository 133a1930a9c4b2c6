//! Encrypted, authenticated message channel.
//!
//! A [`SecureChannel`] owns the raw stream and the per-direction cipher
//! states produced by the handshake. Plaintext never crosses this boundary.
//! The channel carries a close signal; callbacks registered with
//! [`SecureChannel::on_close`] run once the signal fires or once every half
//! of the channel has been dropped.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::error::{TransportError, TransportResult};
use crate::handshake::{CipherState, LENGTH_HEADER_SIZE, SessionKeys};
use crate::identity::NodeIdentity;

const MAC_SIZE: usize = 16;

/// A raw byte stream that can carry a secure channel.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed raw stream.
pub type BoxedStream = Box<dyn RawStream>;

/// Fires the close token when the last half of a channel is dropped.
#[derive(Debug)]
struct CloseGuard {
    token: CancellationToken,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Read half of a secure channel.
pub struct SecureReader {
    stream: ReadHalf<BoxedStream>,
    cipher: CipherState,
    _guard: Arc<CloseGuard>,
}

impl SecureReader {
    /// Reads and decrypts the next message.
    pub async fn read_message(&mut self) -> TransportResult<Vec<u8>> {
        let mut header = [0u8; LENGTH_HEADER_SIZE];
        self.stream.read_exact(&mut header).await?;
        let len_bytes = self.cipher.decrypt(&header)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;

        let mut body = vec![0u8; len + MAC_SIZE];
        self.stream.read_exact(&mut body).await?;
        self.cipher.decrypt(&body)
    }
}

/// Write half of a secure channel.
pub struct SecureWriter {
    stream: WriteHalf<BoxedStream>,
    cipher: CipherState,
    _guard: Arc<CloseGuard>,
}

impl SecureWriter {
    /// Encrypts and writes one message.
    pub async fn write_message(&mut self, plaintext: &[u8]) -> TransportResult<()> {
        let sealed = self.cipher.seal_message(plaintext)?;
        self.stream.write_all(&sealed).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shuts down the write side of the raw stream.
    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// An established secure channel.
pub struct SecureChannel {
    reader: SecureReader,
    writer: SecureWriter,
    remote: NodeIdentity,
    closed: CancellationToken,
}

impl SecureChannel {
    /// Wraps a raw stream with the keys from a completed handshake.
    pub fn new(stream: BoxedStream, keys: SessionKeys) -> Self {
        let closed = CancellationToken::new();
        let guard = Arc::new(CloseGuard {
            token: closed.clone(),
        });
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: SecureReader {
                stream: read,
                cipher: keys.recv,
                _guard: Arc::clone(&guard),
            },
            writer: SecureWriter {
                stream: write,
                cipher: keys.send,
                _guard: guard,
            },
            remote: keys.remote,
            closed,
        }
    }

    /// The authenticated remote identity.
    #[must_use]
    pub const fn remote_identity(&self) -> NodeIdentity {
        self.remote
    }

    /// Reads and decrypts the next message.
    pub async fn read_message(&mut self) -> TransportResult<Vec<u8>> {
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::Closed),
            msg = self.reader.read_message() => msg,
        }
    }

    /// Encrypts and writes one message.
    pub async fn write_message(&mut self, plaintext: &[u8]) -> TransportResult<()> {
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::Closed),
            res = self.writer.write_message(plaintext) => res,
        }
    }

    /// Token cancelled when the channel closes.
    #[must_use]
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Returns true once the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Signals close. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Runs `callback` once the channel closes.
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let closed = self.closed.clone();
        tokio::spawn(async move {
            closed.cancelled().await;
            callback();
        });
    }

    /// Splits into independently owned halves.
    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("remote", &self.remote)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{initiate, respond};
    use crate::identity::StaticKey;
    use std::time::Duration;

    async fn channel_pair() -> (SecureChannel, SecureChannel) {
        let alice = StaticKey::generate();
        let bob = StaticKey::generate();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let deadline = Duration::from_secs(5);
        let (ka, kb) = tokio::join!(
            initiate(&mut a, alice, bob.identity(), deadline),
            respond(&mut b, bob, deadline),
        );
        (
            SecureChannel::new(Box::new(a), ka.expect("initiator")),
            SecureChannel::new(Box::new(b), kb.expect("responder")),
        )
    }

    #[tokio::test]
    async fn messages_roundtrip() {
        let (mut a, mut b) = channel_pair().await;
        a.write_message(b"hello").await.expect("write");
        assert_eq!(b.read_message().await.expect("read"), b"hello");
        b.write_message(&[]).await.expect("write empty");
        assert!(a.read_message().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn large_message_roundtrip() {
        let (a, b) = channel_pair().await;
        let (_ar, mut aw) = a.into_split();
        let (mut br, _bw) = b.into_split();
        let body = vec![0xabu8; crate::handshake::MAX_MESSAGE_LEN];
        let expected = body.clone();
        let writer = tokio::spawn(async move { aw.write_message(&body).await });
        assert_eq!(br.read_message().await.expect("read"), expected);
        writer.await.expect("join").expect("write");
    }

    #[tokio::test]
    async fn close_fires_callback_once() {
        let (a, _b) = channel_pair().await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        a.on_close(move || {
            let _ = tx.send(());
        });
        a.close();
        a.close();
        assert!(a.is_closed());
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("callback ran")
            .expect("sender kept");
    }

    #[tokio::test]
    async fn dropping_halves_signals_close() {
        let (a, _b) = channel_pair().await;
        let signal = a.close_signal();
        let (reader, writer) = a.into_split();
        drop(reader);
        assert!(!signal.is_cancelled());
        drop(writer);
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn closed_channel_refuses_reads() {
        let (mut a, _b) = channel_pair().await;
        a.close();
        assert!(matches!(a.read_message().await, Err(TransportError::Closed)));
    }
}

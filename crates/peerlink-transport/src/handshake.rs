//! Three-act authenticated key exchange.
//!
//! Implements `Noise_XK_secp256k1_ChaChaPoly_SHA256` in the brontide style:
//! the initiator must already know the responder's static key, the
//! responder learns the initiator's static key in act three. After the
//! exchange each side holds one [`CipherState`] per direction.

use std::time::Duration;

use chacha20poly1305::aead::{Aead, KeyInit, Payload as AeadPayload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::identity::{IDENTITY_LEN, NodeIdentity, StaticKey, ecdh};

const PROTOCOL_NAME: &[u8] = b"Noise_XK_secp256k1_ChaChaPoly_SHA256";
const PROLOGUE: &[u8] = b"peerlink";
const HANDSHAKE_VERSION: u8 = 0;
const MAC_SIZE: usize = 16;
const KEY_ROTATION_INTERVAL: u64 = 1000;

/// Size of act one on the wire.
pub const ACT_ONE_SIZE: usize = 1 + IDENTITY_LEN + MAC_SIZE;
/// Size of act two on the wire.
pub const ACT_TWO_SIZE: usize = ACT_ONE_SIZE;
/// Size of act three on the wire.
pub const ACT_THREE_SIZE: usize = 1 + IDENTITY_LEN + MAC_SIZE + MAC_SIZE;
/// Encrypted length prefix size.
pub const LENGTH_HEADER_SIZE: usize = 2 + MAC_SIZE;
/// Largest plaintext carried by one transport message.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn hkdf_split(salt: &[u8; 32], ikm: &[u8]) -> TransportResult<([u8; 32], [u8; 32])> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 64];
    hk.expand(&[], &mut okm)
        .map_err(|e| TransportError::Handshake(format!("key derivation failed: {e}")))?;
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&okm[..32]);
    b.copy_from_slice(&okm[32..]);
    Ok((a, b))
}

fn nonce_bytes(n: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&n.to_le_bytes());
    nonce
}

fn seal(key: &[u8; 32], n: u64, ad: &[u8], plaintext: &[u8]) -> TransportResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_bytes(n);
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            AeadPayload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| TransportError::Cipher)
}

fn open(key: &[u8; 32], n: u64, ad: &[u8], ciphertext: &[u8]) -> TransportResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_bytes(n);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            AeadPayload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| TransportError::Cipher)
}

fn parse_public_key(bytes: &[u8]) -> TransportResult<PublicKey> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| TransportError::Handshake("invalid ephemeral key".into()))
}

fn compressed(key: &PublicKey) -> [u8; IDENTITY_LEN] {
    *NodeIdentity::from_public_key(key).as_bytes()
}

/// One direction of an established channel.
pub struct CipherState {
    key: [u8; 32],
    salt: [u8; 32],
    nonce: u64,
}

impl CipherState {
    fn new(key: [u8; 32], salt: [u8; 32]) -> Self {
        Self {
            key,
            salt,
            nonce: 0,
        }
    }

    fn advance(&mut self) -> TransportResult<()> {
        self.nonce += 1;
        if self.nonce == KEY_ROTATION_INTERVAL {
            let (salt, key) = hkdf_split(&self.salt, &self.key)?;
            self.salt = salt;
            self.key = key;
            self.nonce = 0;
        }
        Ok(())
    }

    /// Encrypts one plaintext, advancing the nonce.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> TransportResult<Vec<u8>> {
        let out = seal(&self.key, self.nonce, &[], plaintext)?;
        self.advance()?;
        Ok(out)
    }

    /// Decrypts one ciphertext, advancing the nonce.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> TransportResult<Vec<u8>> {
        let out = open(&self.key, self.nonce, &[], ciphertext)?;
        self.advance()?;
        Ok(out)
    }

    /// Encrypts a full transport message: sealed length header then body.
    pub fn seal_message(&mut self, plaintext: &[u8]) -> TransportResult<Vec<u8>> {
        if plaintext.len() > MAX_MESSAGE_LEN {
            return Err(TransportError::MessageTooLarge(plaintext.len()));
        }
        let len = (plaintext.len() as u16).to_be_bytes();
        let mut out = self.encrypt(&len)?;
        out.extend(self.encrypt(plaintext)?);
        Ok(out)
    }
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

/// Keys produced by a completed handshake.
#[derive(Debug)]
pub struct SessionKeys {
    /// Encrypts outbound messages.
    pub send: CipherState,
    /// Decrypts inbound messages.
    pub recv: CipherState,
    /// The authenticated static identity of the remote node.
    pub remote: NodeIdentity,
}

/// Symmetric handshake state shared by both roles.
struct SymmetricState {
    chaining_key: [u8; 32],
    handshake_digest: [u8; 32],
    temp_key: [u8; 32],
}

impl SymmetricState {
    fn new(responder_static: &[u8]) -> Self {
        let h = sha256(&[PROTOCOL_NAME]);
        let ck = h;
        let h = sha256(&[&h, PROLOGUE]);
        let h = sha256(&[&h, responder_static]);
        Self {
            chaining_key: ck,
            handshake_digest: h,
            temp_key: [0u8; 32],
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        self.handshake_digest = sha256(&[&self.handshake_digest, data]);
    }

    fn mix_key(&mut self, ikm: &[u8]) -> TransportResult<()> {
        let (ck, temp) = hkdf_split(&self.chaining_key, ikm)?;
        self.chaining_key = ck;
        self.temp_key = temp;
        Ok(())
    }

    fn encrypt_and_hash(&mut self, n: u64, plaintext: &[u8]) -> TransportResult<Vec<u8>> {
        let c = seal(&self.temp_key, n, &self.handshake_digest, plaintext)?;
        self.mix_hash(&c);
        Ok(c)
    }

    fn decrypt_and_hash(&mut self, n: u64, ciphertext: &[u8]) -> TransportResult<Vec<u8>> {
        let p = open(&self.temp_key, n, &self.handshake_digest, ciphertext)
            .map_err(|_| TransportError::Handshake("authentication tag mismatch".into()))?;
        self.mix_hash(ciphertext);
        Ok(p)
    }

    fn split(&self) -> TransportResult<(CipherState, CipherState)> {
        let (first, second) = hkdf_split(&self.chaining_key, &[])?;
        Ok((
            CipherState::new(first, self.chaining_key),
            CipherState::new(second, self.chaining_key),
        ))
    }
}

/// Initiator side of the handshake.
pub struct InitiatorHandshake {
    local: StaticKey,
    remote_static: PublicKey,
    ephemeral: SecretKey,
    state: SymmetricState,
    remote_ephemeral: Option<PublicKey>,
}

impl InitiatorHandshake {
    /// Prepares a handshake towards a node with a known identity.
    pub fn new(local: StaticKey, remote: NodeIdentity) -> TransportResult<Self> {
        Self::with_ephemeral(local, remote, SecretKey::random(&mut OsRng))
    }

    fn with_ephemeral(
        local: StaticKey,
        remote: NodeIdentity,
        ephemeral: SecretKey,
    ) -> TransportResult<Self> {
        let remote_static = remote
            .public_key()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Self {
            local,
            remote_static,
            ephemeral,
            state: SymmetricState::new(remote.as_bytes()),
            remote_ephemeral: None,
        })
    }

    /// Produces act one: `version || e.pub || tag`.
    pub fn act_one(&mut self) -> TransportResult<[u8; ACT_ONE_SIZE]> {
        let e_pub = compressed(&self.ephemeral.public_key());
        self.state.mix_hash(&e_pub);
        let es = ecdh(&self.ephemeral, &self.remote_static);
        self.state.mix_key(&es)?;
        let tag = self.state.encrypt_and_hash(0, &[])?;

        let mut out = [0u8; ACT_ONE_SIZE];
        out[0] = HANDSHAKE_VERSION;
        out[1..=IDENTITY_LEN].copy_from_slice(&e_pub);
        out[1 + IDENTITY_LEN..].copy_from_slice(&tag);
        Ok(out)
    }

    /// Consumes act two from the responder.
    pub fn recv_act_two(&mut self, act: &[u8; ACT_TWO_SIZE]) -> TransportResult<()> {
        if act[0] != HANDSHAKE_VERSION {
            return Err(TransportError::Handshake(format!(
                "act two: unknown version {}",
                act[0]
            )));
        }
        let re = parse_public_key(&act[1..=IDENTITY_LEN])?;
        self.state.mix_hash(&act[1..=IDENTITY_LEN]);
        let ee = ecdh(&self.ephemeral, &re);
        self.state.mix_key(&ee)?;
        self.state.decrypt_and_hash(0, &act[1 + IDENTITY_LEN..])?;
        self.remote_ephemeral = Some(re);
        Ok(())
    }

    /// Produces act three and the session keys.
    pub fn act_three(mut self) -> TransportResult<([u8; ACT_THREE_SIZE], SessionKeys)> {
        let re = self
            .remote_ephemeral
            .ok_or_else(|| TransportError::Handshake("act three before act two".into()))?;
        let s_pub = compressed(&self.local.public_key());
        let c = self.state.encrypt_and_hash(1, &s_pub)?;
        let se = self.local.ecdh(&re);
        self.state.mix_key(&se)?;
        let tag = self.state.encrypt_and_hash(0, &[])?;
        let (send, recv) = self.state.split()?;

        let mut out = [0u8; ACT_THREE_SIZE];
        out[0] = HANDSHAKE_VERSION;
        out[1..1 + c.len()].copy_from_slice(&c);
        out[1 + c.len()..].copy_from_slice(&tag);
        let remote = NodeIdentity::from_public_key(&self.remote_static);
        Ok((out, SessionKeys { send, recv, remote }))
    }
}

/// Responder side of the handshake.
pub struct ResponderHandshake {
    local: StaticKey,
    ephemeral: SecretKey,
    state: SymmetricState,
    remote_ephemeral: Option<PublicKey>,
}

impl ResponderHandshake {
    /// Prepares to answer a handshake addressed to `local`.
    #[must_use]
    pub fn new(local: StaticKey) -> Self {
        let state = SymmetricState::new(local.identity().as_bytes());
        Self {
            local,
            ephemeral: SecretKey::random(&mut OsRng),
            state,
            remote_ephemeral: None,
        }
    }

    /// Consumes act one from the initiator.
    pub fn recv_act_one(&mut self, act: &[u8; ACT_ONE_SIZE]) -> TransportResult<()> {
        if act[0] != HANDSHAKE_VERSION {
            return Err(TransportError::Handshake(format!(
                "act one: unknown version {}",
                act[0]
            )));
        }
        let re = parse_public_key(&act[1..=IDENTITY_LEN])?;
        self.state.mix_hash(&act[1..=IDENTITY_LEN]);
        let es = self.local.ecdh(&re);
        self.state.mix_key(&es)?;
        self.state.decrypt_and_hash(0, &act[1 + IDENTITY_LEN..])?;
        self.remote_ephemeral = Some(re);
        Ok(())
    }

    /// Produces act two.
    pub fn act_two(&mut self) -> TransportResult<[u8; ACT_TWO_SIZE]> {
        let re = self
            .remote_ephemeral
            .as_ref()
            .ok_or_else(|| TransportError::Handshake("act two before act one".into()))?;
        let e_pub = compressed(&self.ephemeral.public_key());
        self.state.mix_hash(&e_pub);
        let ee = ecdh(&self.ephemeral, re);
        self.state.mix_key(&ee)?;
        let tag = self.state.encrypt_and_hash(0, &[])?;

        let mut out = [0u8; ACT_TWO_SIZE];
        out[0] = HANDSHAKE_VERSION;
        out[1..=IDENTITY_LEN].copy_from_slice(&e_pub);
        out[1 + IDENTITY_LEN..].copy_from_slice(&tag);
        Ok(out)
    }

    /// Consumes act three and yields the session keys.
    pub fn recv_act_three(mut self, act: &[u8; ACT_THREE_SIZE]) -> TransportResult<SessionKeys> {
        if act[0] != HANDSHAKE_VERSION {
            return Err(TransportError::Handshake(format!(
                "act three: unknown version {}",
                act[0]
            )));
        }
        let split_at = 1 + IDENTITY_LEN + MAC_SIZE;
        let s_pub = self.state.decrypt_and_hash(1, &act[1..split_at])?;
        let rs = parse_public_key(&s_pub)?;
        let se = ecdh(&self.ephemeral, &rs);
        self.state.mix_key(&se)?;
        self.state.decrypt_and_hash(0, &act[split_at..])?;
        let (recv, send) = self.state.split()?;
        Ok(SessionKeys {
            send,
            recv,
            remote: NodeIdentity::from_public_key(&rs),
        })
    }
}

async fn read_act<S, const N: usize>(stream: &mut S, deadline: Duration) -> TransportResult<[u8; N]>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; N];
    tokio::time::timeout(deadline, stream.read_exact(&mut buf))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;
    Ok(buf)
}

/// Runs the initiator role over a raw stream.
pub async fn initiate<S>(
    stream: &mut S,
    local: StaticKey,
    remote: NodeIdentity,
    deadline: Duration,
) -> TransportResult<SessionKeys>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hs = InitiatorHandshake::new(local, remote)?;
    stream.write_all(&hs.act_one()?).await?;
    let act_two = read_act::<_, ACT_TWO_SIZE>(stream, deadline).await?;
    hs.recv_act_two(&act_two)?;
    let (act_three, keys) = hs.act_three()?;
    stream.write_all(&act_three).await?;
    stream.flush().await?;
    debug!(remote = %keys.remote.short(), "Handshake complete (initiator)");
    Ok(keys)
}

/// Runs the responder role over a raw stream.
pub async fn respond<S>(
    stream: &mut S,
    local: StaticKey,
    deadline: Duration,
) -> TransportResult<SessionKeys>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hs = ResponderHandshake::new(local);
    let act_one = read_act::<_, ACT_ONE_SIZE>(stream, deadline).await?;
    hs.recv_act_one(&act_one)?;
    stream.write_all(&hs.act_two()?).await?;
    stream.flush().await?;
    let act_three = read_act::<_, ACT_THREE_SIZE>(stream, deadline).await?;
    let keys = hs.recv_act_three(&act_three)?;
    debug!(remote = %keys.remote.short(), "Handshake complete (responder)");
    Ok(keys)
}

#[cfg(test)]
#[path = "handshake_tests.rs"]
mod tests;

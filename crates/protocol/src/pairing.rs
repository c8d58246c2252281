//! Pairing exchange: SPAKE2 key agreement and AES-128-GCM packet crypto.
//!
//! Pairing runs over its own TLS connection. Both sides derive a shared
//! password from the six-digit pairing code concatenated with 64 bytes of
//! TLS exported keying material, run SPAKE2 over the Ed25519 group, and
//! expand the agreed secret through HKDF-SHA256 into an AES-128-GCM key.
//! Each side then sends its peer-info blob encrypted under that key; a
//! successful decrypt on both ends proves the codes matched.
//!
//! Every failure in this module collapses into [`ProtocolError::PairingFailed`]
//! so a wrong code cannot be distinguished from any other fault.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};

use crate::error::{ProtocolError, Result};

/// Pairing packet format version.
pub const PAIRING_VERSION: u8 = 1;

/// Size of the pairing packet header on the wire.
pub const PACKET_HEADER_SIZE: usize = 6;

/// Upper bound on a pairing packet payload.
pub const MAX_PAIRING_PAYLOAD: usize = 16 * 1024;

/// Fixed size of the peer-info buffer exchanged after key agreement.
pub const PEER_INFO_SIZE: usize = 8192;

/// Label for TLS exported keying material mixed into the password.
pub const EXPORT_LABEL: &[u8] = b"adb-label\x00";

/// Amount of keying material exported from the TLS session.
pub const EXPORTED_KEY_SIZE: usize = 64;

/// SPAKE2 identity of the pairing initiator.
const CLIENT_IDENTITY: &[u8] = b"adb pair client\x00";

/// SPAKE2 identity of the pairing responder.
const SERVER_IDENTITY: &[u8] = b"adb pair server\x00";

/// HKDF info string for the session key.
const HKDF_INFO: &[u8] = b"adb pairing_auth aes-128-gcm key";

/// AES-128 key length.
const SESSION_KEY_SIZE: usize = 16;

/// GCM nonce length.
const NONCE_SIZE: usize = 12;

/// Peer-info type tag for an RSA public key blob.
const PEER_INFO_RSA_KEY: u8 = 0;

/// Which half of the SPAKE2 exchange this context plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRole {
    Client,
    Server,
}

/// Pairing packet payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// A SPAKE2 key-agreement message.
    SpakeMessage,
    /// An encrypted peer-info buffer.
    PeerInfo,
}

impl PacketKind {
    fn tag(self) -> u8 {
        match self {
            PacketKind::SpakeMessage => 0,
            PacketKind::PeerInfo => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PacketKind::SpakeMessage),
            1 => Some(PacketKind::PeerInfo),
            _ => None,
        }
    }
}

/// Six-byte pairing packet header: version, kind, big-endian payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub payload_len: u32,
}

impl PacketHeader {
    pub fn new(kind: PacketKind, payload_len: u32) -> Self {
        Self { kind, payload_len }
    }

    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[0] = PAIRING_VERSION;
        buf[1] = self.kind.tag();
        buf[2..6].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Decodes and validates a header. Any malformed field fails pairing.
    pub fn decode(buf: &[u8; PACKET_HEADER_SIZE]) -> Result<Self> {
        if buf[0] != PAIRING_VERSION {
            return Err(ProtocolError::PairingFailed);
        }
        let kind = PacketKind::from_tag(buf[1]).ok_or(ProtocolError::PairingFailed)?;
        let payload_len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        if payload_len == 0 || payload_len as usize > MAX_PAIRING_PAYLOAD {
            return Err(ProtocolError::PairingFailed);
        }
        Ok(Self { kind, payload_len })
    }
}

/// Builds the fixed-size peer-info buffer wrapping our public key blob.
pub fn peer_info_payload(adb_public_key: &[u8]) -> Result<Vec<u8>> {
    if adb_public_key.len() >= PEER_INFO_SIZE {
        return Err(ProtocolError::PairingFailed);
    }
    let mut buf = vec![0u8; PEER_INFO_SIZE];
    buf[0] = PEER_INFO_RSA_KEY;
    buf[1..1 + adb_public_key.len()].copy_from_slice(adb_public_key);
    Ok(buf)
}

/// SPAKE2 state and, once agreed, the AES-GCM session cipher.
///
/// GCM nonces are the per-direction message counters encoded little-endian
/// in the first eight nonce bytes. Each context encrypts with its own
/// counter and decrypts with the peer's, so both start at zero.
pub struct PairingContext {
    spake: Option<Spake2<Ed25519Group>>,
    outbound: Vec<u8>,
    cipher: Option<Aes128Gcm>,
    encrypt_counter: u64,
    decrypt_counter: u64,
}

impl PairingContext {
    /// Starts the SPAKE2 exchange with the shared password
    /// (pairing code bytes followed by exported keying material).
    pub fn new(role: PairingRole, password: &[u8]) -> Self {
        let password = Password::new(password);
        let client = Identity::new(CLIENT_IDENTITY);
        let server = Identity::new(SERVER_IDENTITY);
        let (spake, outbound) = match role {
            PairingRole::Client => Spake2::<Ed25519Group>::start_a(&password, &client, &server),
            PairingRole::Server => Spake2::<Ed25519Group>::start_b(&password, &client, &server),
        };
        Self {
            spake: Some(spake),
            outbound,
            cipher: None,
            encrypt_counter: 0,
            decrypt_counter: 0,
        }
    }

    /// Our SPAKE2 message, to be sent as the first pairing packet.
    pub fn our_message(&self) -> &[u8] {
        &self.outbound
    }

    /// Completes key agreement with the peer's SPAKE2 message and derives
    /// the session cipher.
    pub fn init_cipher(&mut self, peer_message: &[u8]) -> Result<()> {
        let spake = self.spake.take().ok_or(ProtocolError::PairingFailed)?;
        let shared = spake
            .finish(peer_message)
            .map_err(|_| ProtocolError::PairingFailed)?;

        let mut session_key = [0u8; SESSION_KEY_SIZE];
        Hkdf::<Sha256>::new(None, &shared)
            .expand(HKDF_INFO, &mut session_key)
            .map_err(|_| ProtocolError::PairingFailed)?;

        self.cipher = Some(Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&session_key)));
        Ok(())
    }

    /// Encrypts a payload under the next outbound nonce.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher.as_ref().ok_or(ProtocolError::PairingFailed)?;
        let nonce = counter_nonce(self.encrypt_counter);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::PairingFailed)?;
        self.encrypt_counter += 1;
        Ok(ciphertext)
    }

    /// Decrypts a payload under the next inbound nonce. A wrong pairing
    /// code surfaces here as an authentication failure.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher.as_ref().ok_or(ProtocolError::PairingFailed)?;
        let nonce = counter_nonce(self.decrypt_counter);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| ProtocolError::PairingFailed)?;
        self.decrypt_counter += 1;
        Ok(plaintext)
    }
}

impl std::fmt::Debug for PairingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingContext")
            .field("established", &self.cipher.is_some())
            .field("encrypt_counter", &self.encrypt_counter)
            .field("decrypt_counter", &self.decrypt_counter)
            .finish()
    }
}

fn counter_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_contexts(client_pw: &[u8], server_pw: &[u8]) -> (PairingContext, PairingContext) {
        let mut client = PairingContext::new(PairingRole::Client, client_pw);
        let mut server = PairingContext::new(PairingRole::Server, server_pw);
        let client_msg = client.our_message().to_vec();
        let server_msg = server.our_message().to_vec();
        client.init_cipher(&server_msg).unwrap();
        server.init_cipher(&client_msg).unwrap();
        (client, server)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader::new(PacketKind::PeerInfo, 8208);
        let decoded = PacketHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_length_is_big_endian() {
        let encoded = PacketHeader::new(PacketKind::SpakeMessage, 0x0102).encode();
        assert_eq!(&encoded[2..6], &[0x00, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let mut buf = PacketHeader::new(PacketKind::SpakeMessage, 32).encode();
        buf[0] = 2;
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(ProtocolError::PairingFailed)
        ));
    }

    #[test]
    fn test_header_rejects_unknown_kind() {
        let mut buf = PacketHeader::new(PacketKind::SpakeMessage, 32).encode();
        buf[1] = 7;
        assert!(PacketHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_header_rejects_oversized_payload() {
        let buf = PacketHeader::new(PacketKind::PeerInfo, MAX_PAIRING_PAYLOAD as u32 + 1).encode();
        assert!(PacketHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_header_rejects_empty_payload() {
        let buf = PacketHeader::new(PacketKind::SpakeMessage, 0).encode();
        assert!(PacketHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_peer_info_layout() {
        let blob = b"AAAAB3Nz fake-device\x00";
        let payload = peer_info_payload(blob).unwrap();
        assert_eq!(payload.len(), PEER_INFO_SIZE);
        assert_eq!(payload[0], 0);
        assert_eq!(&payload[1..1 + blob.len()], blob);
        assert!(payload[1 + blob.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_peer_info_rejects_oversized_key() {
        let blob = vec![b'x'; PEER_INFO_SIZE];
        assert!(peer_info_payload(&blob).is_err());
    }

    #[test]
    fn test_full_exchange_agrees_on_key() {
        let (mut client, mut server) = paired_contexts(b"123456secret", b"123456secret");

        let ct = client.encrypt(b"client peer info").unwrap();
        assert_eq!(server.decrypt(&ct).unwrap(), b"client peer info");

        let ct = server.encrypt(b"server peer info").unwrap();
        assert_eq!(client.decrypt(&ct).unwrap(), b"server peer info");
    }

    #[test]
    fn test_counters_advance_per_direction() {
        let (mut client, mut server) = paired_contexts(b"pw", b"pw");

        let first = client.encrypt(b"same").unwrap();
        let second = client.encrypt(b"same").unwrap();
        assert_ne!(first, second);

        assert_eq!(server.decrypt(&first).unwrap(), b"same");
        assert_eq!(server.decrypt(&second).unwrap(), b"same");
    }

    #[test]
    fn test_out_of_order_decrypt_fails() {
        let (mut client, mut server) = paired_contexts(b"pw", b"pw");
        let _skipped = client.encrypt(b"one").unwrap();
        let second = client.encrypt(b"two").unwrap();
        assert!(server.decrypt(&second).is_err());
    }

    #[test]
    fn test_wrong_password_fails_on_decrypt() {
        // SPAKE2 itself completes; the mismatch shows up as a GCM
        // authentication failure on the first encrypted packet.
        let (mut client, mut server) = paired_contexts(b"123456right", b"654321wrong");
        let ct = client.encrypt(b"peer info").unwrap();
        assert!(matches!(
            server.decrypt(&ct),
            Err(ProtocolError::PairingFailed)
        ));
    }

    #[test]
    fn test_encrypt_before_agreement_fails() {
        let mut ctx = PairingContext::new(PairingRole::Client, b"pw");
        assert!(ctx.encrypt(b"data").is_err());
    }

    #[test]
    fn test_double_init_fails() {
        let (mut client, _server) = paired_contexts(b"pw", b"pw");
        assert!(client.init_cipher(b"stale message").is_err());
    }
}

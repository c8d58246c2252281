//! # wadb Protocol Library
//!
//! This crate provides wire protocol definitions and cryptographic
//! primitives for the wadb wireless debugging client.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of wadb's communication layer,
//! providing:
//!
//! - **Wire Codec**: The 24-byte little-endian message header, command
//!   tags, and byte-sum payload checksums
//! - **Key Material**: RSA-2048 identity, token signing, the public-key
//!   blob format, and the self-signed TLS certificate
//! - **TLS Configuration**: A client config for the in-place STLS upgrade
//!   and for pairing connections
//! - **Pairing Crypto**: SPAKE2 key agreement, HKDF key derivation, and
//!   AES-128-GCM packet encryption
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Shell Streams / Peer Exchange      │
//! ├─────────────────────────────────────────┤
//! │    CNXN / STLS / AUTH State Machine     │  handshake
//! ├─────────────────────────────────────────┤
//! │            Message Framing              │  24-byte header + payload
//! ├─────────────────────────────────────────┤
//! │      Transport (TCP, upgraded TLS)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`wire`]: Commands, headers, and message encoding
//! - [`keys`]: RSA identity and the public-key blob
//! - [`tls`]: Client TLS configuration
//! - [`pairing`]: SPAKE2 exchange and packet crypto
//! - [`error`]: Error types

pub mod error;
pub mod keys;
pub mod pairing;
pub mod tls;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use keys::{KeyMaterial, ADB_PUBLIC_KEY_SIZE, KEY_BITS};
pub use pairing::{
    PacketHeader, PacketKind, PairingContext, PairingRole, EXPORTED_KEY_SIZE, EXPORT_LABEL,
    MAX_PAIRING_PAYLOAD, PACKET_HEADER_SIZE, PAIRING_VERSION, PEER_INFO_SIZE,
};
pub use tls::client_config;
pub use wire::{
    checksum, Command, Header, Message, AUTH_RSA_PUBLIC_KEY, AUTH_SIGNATURE, AUTH_TOKEN,
    CNXN_SYSTEM_IDENTITY, HEADER_SIZE, MAX_PAYLOAD_SIZE, STLS_VERSION, VERSION,
};

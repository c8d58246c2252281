//! ADB wire framing: 24-byte little-endian message headers.
//!
//! # Frame Format
//!
//! Each frame consists of a fixed header followed by an optional payload:
//! - 4 bytes: command tag (one of the 8-value vocabulary)
//! - 4 bytes: arg0 (meaning depends on command)
//! - 4 bytes: arg1
//! - 4 bytes: payload length
//! - 4 bytes: payload checksum
//! - 4 bytes: magic (bitwise complement of the command tag)
//! - N bytes: payload
//!
//! All header fields are little-endian. The checksum is the arithmetic sum
//! of the unsigned payload bytes truncated to 32 bits. Deployed daemons
//! expect exactly this sum; it is not a CRC32 and must not be replaced
//! with one.

use crate::error::{ProtocolError, Result};

/// Size of the fixed wire header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Maximum payload the protocol allows in a single frame (1 MiB).
///
/// A peer-declared length above this bound is rejected before any
/// allocation happens.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Protocol version advertised in CNXN frames.
pub const VERSION: u32 = 0x0100_0000;

/// Version advertised in the STLS upgrade reply.
pub const STLS_VERSION: u32 = 0x0100_0000;

/// AUTH sub-type: the peer sent a random token to sign.
pub const AUTH_TOKEN: u32 = 1;

/// AUTH sub-type: we are answering with a signature over the token.
pub const AUTH_SIGNATURE: u32 = 2;

/// AUTH sub-type: we are sending our public key for the peer to accept.
pub const AUTH_RSA_PUBLIC_KEY: u32 = 3;

/// System identity payload sent in our CNXN frame.
pub const CNXN_SYSTEM_IDENTITY: &str = "host::";

/// The closed command vocabulary of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// SYNC (legacy, never sent by this client).
    Sync = 0x434e_5953,
    /// CNXN: connection banner / confirmation.
    Connect = 0x4e58_4e43,
    /// AUTH: authentication challenge or response.
    Auth = 0x4854_5541,
    /// OPEN: open a logical stream.
    Open = 0x4e45_504f,
    /// OKAY: stream ready / write acknowledged.
    Okay = 0x5941_4b4f,
    /// CLSE: close a logical stream.
    Close = 0x4553_4c43,
    /// WRTE: stream payload data.
    Write = 0x4554_5257,
    /// STLS: peer requests a TLS upgrade.
    StartTls = 0x534c_5453,
}

impl Command {
    /// Returns the 32-bit wire tag for this command.
    #[inline]
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Looks up a command by its wire tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0x434e_5953 => Some(Command::Sync),
            0x4e58_4e43 => Some(Command::Connect),
            0x4854_5541 => Some(Command::Auth),
            0x4e45_504f => Some(Command::Open),
            0x5941_4b4f => Some(Command::Okay),
            0x4553_4c43 => Some(Command::Close),
            0x4554_5257 => Some(Command::Write),
            0x534c_5453 => Some(Command::StartTls),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Sync => "SYNC",
            Command::Connect => "CNXN",
            Command::Auth => "AUTH",
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Close => "CLSE",
            Command::Write => "WRTE",
            Command::StartTls => "STLS",
        };
        f.write_str(name)
    }
}

/// Formats a raw command tag for error messages, falling back to hex for
/// tags outside the vocabulary.
pub fn command_name(tag: u32) -> String {
    match Command::from_tag(tag) {
        Some(cmd) => cmd.to_string(),
        None => format!("{tag:#010x}"),
    }
}

/// Computes the payload checksum: the sum of the unsigned byte values,
/// truncated to 32 bits.
///
/// This is intentionally not a CRC32 even though comparable codebases name
/// the field that way; deployed daemons compute the plain sum.
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// A decoded wire header, prior to command-vocabulary validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw command tag as received.
    pub command: u32,
    pub arg0: u32,
    pub arg1: u32,
    /// Declared payload length in bytes.
    pub data_length: u32,
    /// Declared payload checksum.
    pub data_checksum: u32,
    /// Bitwise complement of `command`.
    pub magic: u32,
}

impl Header {
    /// Decodes and validates a 24-byte header.
    ///
    /// Enforces the `magic == !command` invariant and the payload length
    /// bound. Violations are framing errors, never silently corrected.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let word = |i: usize| {
            u32::from_le_bytes([buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]])
        };
        let header = Header {
            command: word(0),
            arg0: word(1),
            arg1: word(2),
            data_length: word(3),
            data_checksum: word(4),
            magic: word(5),
        };

        if header.magic != !header.command {
            return Err(ProtocolError::Framing(format!(
                "magic {:#010x} is not the complement of command {}",
                header.magic,
                command_name(header.command)
            )));
        }
        if header.data_length as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::Framing(format!(
                "declared payload of {} bytes exceeds maximum of {} bytes",
                header.data_length, MAX_PAYLOAD_SIZE
            )));
        }
        Ok(header)
    }
}

/// A single wire-protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a new message with the given payload.
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: Vec<u8>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload,
        }
    }

    /// Creates a message with an empty payload.
    pub fn empty(command: Command, arg0: u32, arg1: u32) -> Self {
        Self::new(command, arg0, arg1, Vec::new())
    }

    /// Creates a message carrying a NUL-terminated text payload, the shape
    /// CNXN banners and OPEN destinations use.
    pub fn with_text(command: Command, arg0: u32, arg1: u32, text: &str) -> Self {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        Self::new(command, arg0, arg1, payload)
    }

    /// Encodes the message as `HEADER_SIZE + payload.len()` wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::Framing(format!(
                "payload of {} bytes exceeds maximum of {} bytes",
                self.payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        let tag = self.command.tag();
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&self.arg0.to_le_bytes());
        out.extend_from_slice(&self.arg1.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&checksum(&self.payload).to_le_bytes());
        out.extend_from_slice(&(!tag).to_le_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Reassembles a message from a validated header and its payload bytes.
    ///
    /// The payload length must already match the header (the transport
    /// layer reads exactly `data_length` bytes). Tags outside the command
    /// vocabulary are framing errors.
    pub fn from_wire(header: &Header, payload: Vec<u8>) -> Result<Self> {
        debug_assert_eq!(payload.len(), header.data_length as usize);
        let command = Command::from_tag(header.command).ok_or_else(|| {
            ProtocolError::Framing(format!(
                "unknown command tag {}",
                command_name(header.command)
            ))
        })?;
        Ok(Self {
            command,
            arg0: header.arg0,
            arg1: header.arg1,
            payload,
        })
    }
}

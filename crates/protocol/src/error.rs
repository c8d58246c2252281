//! Error types shared by the protocol and client crates.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Wire errors
    /// Malformed or oversized frame. Fatal: the connection must be closed.
    #[error("framing error: {0}")]
    Framing(String),

    /// Unexpected command during the CNXN/STLS/AUTH sequence.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Protocol violation while a shell stream was open. The connection is
    /// in an undefined state and cannot be reused.
    #[error("unexpected command during shell exchange: {0}")]
    UnexpectedCommand(String),

    // Transport errors
    /// Socket-level failure (reset, refused, closed).
    #[error("transport error: {0}")]
    Transport(String),

    /// A read or write did not complete within the allowed time.
    #[error("operation timed out: {0}")]
    Timeout(String),

    // TLS errors
    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    // Key material errors
    /// Key generation, parsing, or signing failure.
    #[error("key material error: {0}")]
    Key(String),

    // Pairing
    /// Any failure during the pairing exchange. Deliberately opaque: a
    /// wrong pairing code is indistinguishable from a transport glitch at
    /// this layer, and the distinction must not leak.
    #[error("pairing rejected by the device")]
    PairingFailed,
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                ProtocolError::Timeout(err.to_string())
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::Transport(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}

impl From<rustls::Error> for ProtocolError {
    fn from(err: rustls::Error) -> Self {
        ProtocolError::Tls(err.to_string())
    }
}

impl From<rsa::Error> for ProtocolError {
    fn from(err: rsa::Error) -> Self {
        ProtocolError::Key(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_error_display() {
        let err = ProtocolError::Framing("magic mismatch".to_string());
        assert_eq!(err.to_string(), "framing error: magic mismatch");
    }

    #[test]
    fn test_handshake_error_display() {
        let err = ProtocolError::Handshake("not CNXN, got AUTH".to_string());
        assert_eq!(err.to_string(), "handshake failed: not CNXN, got AUTH");
    }

    #[test]
    fn test_unexpected_command_display() {
        let err = ProtocolError::UnexpectedCommand("STLS".to_string());
        assert_eq!(
            err.to_string(),
            "unexpected command during shell exchange: STLS"
        );
    }

    #[test]
    fn test_pairing_failed_is_opaque() {
        // The pairing failure message carries no cause on purpose.
        let err = ProtocolError::PairingFailed;
        assert_eq!(err.to_string(), "pairing rejected by the device");
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err: ProtocolError = io_err.into();
        assert!(matches!(err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_reset() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: ProtocolError = io_err.into();
        assert!(matches!(err, ProtocolError::Transport(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}

//! Client side of the pairing exchange.
//!
//! Pairing runs over a dedicated TLS connection to the device's pairing
//! port. After the TLS handshake both sides export 64 bytes of keying
//! material, mix it with the six-digit code into the SPAKE2 password, and
//! run two framed exchanges: SPAKE2 messages in the clear, then peer-info
//! buffers encrypted under the agreed key. A successful decrypt of the
//! device's peer-info is the entire success criterion.
//!
//! Every failure surfaces as the opaque [`ProtocolError::PairingFailed`];
//! a mistyped code must be indistinguishable from a dropped socket.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use rustls::pki_types::ServerName;
use wadb_protocol::pairing::{
    peer_info_payload, PacketHeader, PacketKind, PairingContext, PairingRole, EXPORTED_KEY_SIZE,
    EXPORT_LABEL, MAX_PAIRING_PAYLOAD, PACKET_HEADER_SIZE,
};
use wadb_protocol::{tls, KeyMaterial, ProtocolError, Result};

/// Runs pairing attempts against device pairing endpoints.
pub struct PairingClient {
    key: Arc<KeyMaterial>,
}

impl PairingClient {
    pub fn new(key: Arc<KeyMaterial>) -> Self {
        Self { key }
    }

    /// Pairs with `host:port` using the displayed pairing code.
    pub async fn pair(&self, host: &str, port: u16, code: &str) -> Result<()> {
        match self.pair_inner(host, port, code).await {
            Ok(()) => {
                info!(%host, port, "pairing completed");
                Ok(())
            }
            Err(err) => {
                // Logged for diagnosis only; the caller sees the opaque error.
                debug!(error = %err, "pairing attempt failed");
                Err(ProtocolError::PairingFailed)
            }
        }
    }

    async fn pair_inner(&self, host: &str, port: u16, code: &str) -> Result<()> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        let config = tls::client_config(&self.key)?;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProtocolError::Tls(format!("invalid server name {host:?}: {e}")))?;
        let tls_stream = connector.connect(server_name, stream).await?;

        // Both ends export the same bytes from the shared TLS session, so
        // the password binds the code to this exact connection.
        let exported = tls_stream
            .get_ref()
            .1
            .export_keying_material([0u8; EXPORTED_KEY_SIZE], EXPORT_LABEL, None)?;

        let mut password = Vec::with_capacity(code.len() + EXPORTED_KEY_SIZE);
        password.extend_from_slice(code.as_bytes());
        password.extend_from_slice(&exported);

        let context = PairingContext::new(PairingRole::Client, &password);
        let session =
            PairingSession::new(tls_stream, context, self.key.adb_public_key().to_vec());
        session.run().await
    }
}

/// The framed pairing exchange, generic over the stream so it can run
/// over in-memory pipes as well as TLS sockets.
pub struct PairingSession<S> {
    stream: S,
    context: PairingContext,
    public_key: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PairingSession<S> {
    pub fn new(stream: S, context: PairingContext, public_key: Vec<u8>) -> Self {
        Self {
            stream,
            context,
            public_key,
        }
    }

    /// Drives the exchange to completion. The context, its ciphers, and
    /// the stream are all dropped on every exit path.
    pub async fn run(mut self) -> Result<()> {
        // Round one: SPAKE2 messages in the clear.
        let our_message = self.context.our_message().to_vec();
        self.write_packet(PacketKind::SpakeMessage, &our_message)
            .await?;
        let (kind, peer_message) = self.read_packet().await?;
        if kind != PacketKind::SpakeMessage {
            return Err(ProtocolError::PairingFailed);
        }
        self.context.init_cipher(&peer_message)?;

        // Round two: peer-info buffers under the agreed key.
        let peer_info = peer_info_payload(&self.public_key)?;
        let encrypted = self.context.encrypt(&peer_info)?;
        self.write_packet(PacketKind::PeerInfo, &encrypted).await?;

        let (kind, device_info) = self.read_packet().await?;
        if kind != PacketKind::PeerInfo {
            return Err(ProtocolError::PairingFailed);
        }
        // Decrypt success is the proof the codes matched. The device's
        // peer-info content is not inspected further.
        self.context.decrypt(&device_info)?;
        Ok(())
    }

    async fn write_packet(&mut self, kind: PacketKind, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() > MAX_PAIRING_PAYLOAD {
            return Err(ProtocolError::PairingFailed);
        }
        let header = PacketHeader::new(kind, payload.len() as u32);
        self.stream.write_all(&header.encode()).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<(PacketKind, Vec<u8>)> {
        let mut header_buf = [0u8; PACKET_HEADER_SIZE];
        self.stream.read_exact(&mut header_buf).await?;
        let header = PacketHeader::decode(&header_buf)?;
        let mut payload = vec![0u8; header.payload_len as usize];
        self.stream.read_exact(&mut payload).await?;
        Ok((header.kind, payload))
    }
}

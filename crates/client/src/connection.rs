//! A single device connection: TCP establishment, the CNXN/STLS/AUTH
//! handshake, and one-shot shell exchanges.
//!
//! The handshake is modelled as an explicit state machine rather than a
//! read-dispatch loop so that every legal frame order is visible in one
//! place and everything else is rejected by construction:
//!
//! ```text
//! CNXN sent ──► AwaitingUpgradeDecision ──STLS──► (TLS upgrade)
//!                      │    │                          │
//!                      │   AUTH token                 AUTH token / CNXN
//!                      │    ▼                          ▼
//!                      │  AwaitingAuth ◄───────────────┘
//!                      │    │  (signature, then public key fallback)
//!                     CNXN  CNXN
//!                      ▼    ▼
//!                  Established
//! ```
//!
//! A connection carries at most one shell exchange at a time; the
//! multiplexing fields of the wire format are used only to detect and
//! skip stray frames.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use rustls::pki_types::ServerName;
use wadb_protocol::wire::{
    Command, Header, Message, AUTH_RSA_PUBLIC_KEY, AUTH_SIGNATURE, AUTH_TOKEN,
    CNXN_SYSTEM_IDENTITY, HEADER_SIZE, MAX_PAYLOAD_SIZE, STLS_VERSION, VERSION,
};
use wadb_protocol::{tls, KeyMaterial, ProtocolError, Result};

/// The socket, either plain or upgraded to TLS in place.
enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.write_all(bytes).await,
            Transport::Tls(stream) => stream.write_all(bytes).await,
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.read_exact(buf).await.map(|_| ()),
            Transport::Tls(stream) => stream.read_exact(buf).await.map(|_| ()),
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            Transport::Plain(stream) => stream.shutdown().await,
            Transport::Tls(stream) => stream.shutdown().await,
        };
    }

    /// Reads one complete frame, applying `read_timeout` to the header and
    /// to the payload separately.
    async fn read_message(&mut self, read_timeout: Duration) -> Result<Message> {
        let mut header_buf = [0u8; HEADER_SIZE];
        timeout(read_timeout, self.read_exact(&mut header_buf))
            .await
            .map_err(|_| ProtocolError::Timeout("no frame header within the read timeout".into()))??;
        let header = Header::decode(&header_buf)?;

        let mut payload = vec![0u8; header.data_length as usize];
        if !payload.is_empty() {
            timeout(read_timeout, self.read_exact(&mut payload))
                .await
                .map_err(|_| ProtocolError::Timeout("frame payload arrived incomplete".into()))??;
        }
        Message::from_wire(&header, payload)
    }

    /// Consumes the plain socket and performs the TLS client handshake
    /// over it, keeping the same TCP connection underneath.
    async fn upgrade(
        self,
        host: &str,
        key: &KeyMaterial,
        handshake_timeout: Duration,
    ) -> Result<Transport> {
        let stream = match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(_) => {
                return Err(ProtocolError::Handshake(
                    "received a second STLS upgrade request".into(),
                ))
            }
        };
        let config = tls::client_config(key)?;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProtocolError::Tls(format!("invalid server name {host:?}: {e}")))?;
        let tls_stream = timeout(handshake_timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| ProtocolError::Timeout("TLS handshake did not complete".into()))??;
        Ok(Transport::Tls(Box::new(tls_stream)))
    }
}

/// Handshake progress after our CNXN banner has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// The peer may upgrade (STLS), challenge (AUTH), or accept (CNXN).
    AwaitingUpgradeDecision,
    /// Upgrade decided; only AUTH challenges or acceptance remain legal.
    AwaitingAuth {
        signature_sent: bool,
        public_key_sent: bool,
    },
}

/// An established connection to a device daemon.
pub struct Connection {
    transport: Transport,
    read_timeout: Duration,
    live: bool,
    banner: String,
}

impl Connection {
    /// Connects to `host:port` and runs the handshake to completion.
    ///
    /// The TCP connect, the optional TLS upgrade, and every frame read are
    /// each bounded by `read_timeout`. Authentication follows the
    /// token-signature path first and falls back to offering our public
    /// key once; a second rejection is terminal.
    pub async fn establish(
        host: &str,
        port: u16,
        key: &KeyMaterial,
        read_timeout: Duration,
    ) -> Result<Connection> {
        let stream = timeout(read_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connect to {host}:{port} timed out")))??;
        stream.set_nodelay(true)?;
        let mut transport = Transport::Plain(stream);

        let connect =
            Message::with_text(Command::Connect, VERSION, MAX_PAYLOAD_SIZE as u32, CNXN_SYSTEM_IDENTITY);
        transport.write_all(&connect.encode()?).await?;

        let mut state = HandshakeState::AwaitingUpgradeDecision;
        let banner_payload = loop {
            let message = transport.read_message(read_timeout).await?;
            debug!(command = %message.command, len = message.payload.len(), "handshake frame");

            match message.command {
                Command::Connect => break message.payload,

                Command::StartTls => {
                    if state != HandshakeState::AwaitingUpgradeDecision {
                        return Err(ProtocolError::Handshake(
                            "STLS request after the upgrade decision".into(),
                        ));
                    }
                    let reply = Message::empty(Command::StartTls, STLS_VERSION, 0);
                    transport.write_all(&reply.encode()?).await?;
                    transport = transport.upgrade(host, key, read_timeout).await?;
                    debug!("transport upgraded to TLS");
                    state = HandshakeState::AwaitingAuth {
                        signature_sent: false,
                        public_key_sent: false,
                    };
                }

                Command::Auth => {
                    if message.arg0 != AUTH_TOKEN {
                        return Err(ProtocolError::Handshake(format!(
                            "unsupported AUTH sub-type {}",
                            message.arg0
                        )));
                    }
                    let (signature_sent, public_key_sent) = match state {
                        HandshakeState::AwaitingUpgradeDecision => (false, false),
                        HandshakeState::AwaitingAuth {
                            signature_sent,
                            public_key_sent,
                        } => (signature_sent, public_key_sent),
                    };
                    if !signature_sent {
                        let signature = key.sign_token(&message.payload)?;
                        let reply = Message::new(Command::Auth, AUTH_SIGNATURE, 0, signature);
                        transport.write_all(&reply.encode()?).await?;
                        state = HandshakeState::AwaitingAuth {
                            signature_sent: true,
                            public_key_sent: false,
                        };
                    } else if !public_key_sent {
                        // Signature rejected: offer the key itself and wait
                        // for the user to accept it on the device.
                        let reply = Message::new(
                            Command::Auth,
                            AUTH_RSA_PUBLIC_KEY,
                            0,
                            key.adb_public_key().to_vec(),
                        );
                        transport.write_all(&reply.encode()?).await?;
                        state = HandshakeState::AwaitingAuth {
                            signature_sent: true,
                            public_key_sent: true,
                        };
                    } else {
                        return Err(ProtocolError::Handshake(
                            "device rejected both our signature and our public key".into(),
                        ));
                    }
                }

                other => {
                    return Err(ProtocolError::Handshake(format!(
                        "unexpected {other} frame during handshake"
                    )));
                }
            }
        };

        let banner = String::from_utf8_lossy(&banner_payload)
            .trim_end_matches('\0')
            .to_string();
        info!(%host, port, banner = %banner, "connection established");
        Ok(Connection {
            transport,
            read_timeout,
            live: true,
            banner,
        })
    }

    /// Runs one shell command to completion and returns its combined
    /// output as (lossy) UTF-8 text.
    ///
    /// Until the opening OKAY supplies the peer's stream id, every other
    /// frame is leftover traffic and is skipped. Once both ids are known,
    /// frames not matching the `(local_id, remote_id)` pair are skipped
    /// too; a non-stream command addressed to our pair poisons the
    /// connection.
    pub async fn shell_command(&mut self, command: &str) -> Result<String> {
        let local_id: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
        let service = format!("shell:{command}");
        self.send(Message::with_text(Command::Open, local_id, 0, &service))
            .await?;

        let mut remote_id: Option<u32> = None;
        let mut output = Vec::new();
        loop {
            let message = self.read().await?;

            let remote = match remote_id {
                None => {
                    if message.command == Command::Okay && message.arg1 == local_id {
                        remote_id = Some(message.arg0);
                    } else {
                        warn!(
                            command = %message.command,
                            stream = message.arg1,
                            "skipping frame while the stream is opening"
                        );
                    }
                    continue;
                }
                Some(remote) => remote,
            };

            if message.arg0 != remote || message.arg1 != local_id {
                warn!(
                    command = %message.command,
                    from = message.arg0,
                    to = message.arg1,
                    "skipping frame for another stream"
                );
                continue;
            }

            match message.command {
                Command::Okay => {}
                Command::Write => {
                    output.extend_from_slice(&message.payload);
                    self.send(Message::empty(Command::Okay, local_id, remote))
                        .await?;
                }
                Command::Close => break,
                other => {
                    self.live = false;
                    return Err(ProtocolError::UnexpectedCommand(format!(
                        "{other} while a shell stream was open"
                    )));
                }
            }
        }
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Whether the connection is believed usable. Cleared on any transport
    /// or protocol failure.
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// The device banner from the accepting CNXN frame.
    pub fn banner(&self) -> &str {
        &self.banner
    }

    /// Shuts the socket down. The connection is unusable afterwards.
    pub async fn close(&mut self) {
        self.live = false;
        self.transport.shutdown().await;
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        let bytes = message.encode()?;
        if let Err(err) = self.transport.write_all(&bytes).await {
            self.live = false;
            return Err(err.into());
        }
        debug!(command = %message.command, len = message.payload.len(), "sent frame");
        Ok(())
    }

    async fn read(&mut self) -> Result<Message> {
        match self.transport.read_message(self.read_timeout).await {
            Ok(message) => {
                debug!(command = %message.command, len = message.payload.len(), "received frame");
                Ok(message)
            }
            Err(err) => {
                self.live = false;
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("live", &self.live)
            .field("banner", &self.banner)
            .field(
                "encrypted",
                &matches!(self.transport, Transport::Tls(_)),
            )
            .finish()
    }
}

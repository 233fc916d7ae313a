//! Low-level SMTP protocol engine.
//!
//! Handles the TCP connection, EHLO/HELO negotiation, the STARTTLS upgrade,
//! command/response exchange and the DATA transfer.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::types::*;

/// Upper bound on one reply, all continuation lines included.
const MAX_REPLY_BYTES: u64 = 64 * 1024;

// ─── Stream Abstraction ─────────────────────────────────────────────

/// Wrapper over plain-text or TLS socket so the rest of the engine is generic.
enum SmtpStream {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<TlsStream<TcpStream>>),
}

impl SmtpStream {
    /// Read one line, consuming at most `limit` bytes.
    async fn read_line(&mut self, buf: &mut String, limit: u64) -> std::io::Result<usize> {
        match self {
            Self::Plain(r) => r.take(limit).read_line(buf).await,
            Self::Tls(r) => r.take(limit).read_line(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(r) => r.get_mut().write_all(data).await,
            Self::Tls(r) => r.get_mut().write_all(data).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(r) => r.get_mut().flush().await,
            Self::Tls(r) => r.get_mut().flush().await,
        }
    }
}

// ─── SmtpClient ─────────────────────────────────────────────────────

/// One connection to a relay.
pub struct SmtpClient {
    stream: Option<SmtpStream>,
    peer: String,
    io_timeout: Duration,
    capabilities: Option<EhloCapabilities>,
    tls_active: bool,
}

impl SmtpClient {
    /// Dial the relay and read its greeting banner.
    pub async fn connect(config: &RelayConfig) -> SmtpResult<Self> {
        let addr = config.server_name();
        debug!("Connecting to SMTP relay {}…", addr);

        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SmtpError::connection(format!("Connection timed out: {}", addr)))?
            .map_err(|e| SmtpError::connection(format!("Connection to {} failed: {}", addr, e)))?;

        let mut client = Self {
            stream: Some(SmtpStream::Plain(BufReader::new(tcp))),
            peer: addr,
            io_timeout: Duration::from_secs(config.io_timeout_secs),
            capabilities: None,
            tls_active: false,
        };

        let greeting = client.read_reply().await?;
        if greeting.is_error() {
            return Err(SmtpError::server(
                greeting.code,
                format!("Relay rejected connection: {}", greeting.text()),
            ));
        }
        info!("SMTP connected to {} – {}", client.peer, greeting.text());
        Ok(client)
    }

    // ── Negotiation ─────────────────────────────────────────────

    /// Perform EHLO (falling back to HELO) and parse capabilities.
    pub async fn ehlo(&mut self, domain: &str) -> SmtpResult<EhloCapabilities> {
        let reply = self.command(&format!("EHLO {}", domain)).await?;
        if reply.is_positive() {
            let caps = EhloCapabilities::parse(&reply);
            self.capabilities = Some(caps.clone());
            return Ok(caps);
        }
        debug!("EHLO rejected, trying HELO");
        let reply = self.command(&format!("HELO {}", domain)).await?;
        if reply.is_positive() {
            let caps = EhloCapabilities {
                server_name: reply.lines.first().cloned().unwrap_or_default(),
                ..Default::default()
            };
            self.capabilities = Some(caps.clone());
            Ok(caps)
        } else {
            Err(SmtpError::server(
                reply.code,
                format!("HELO rejected: {}", reply.text()),
            ))
        }
    }

    /// Upgrade the current plain-text connection to TLS via STARTTLS,
    /// then re-issue EHLO (RFC 3207 §4.2).
    pub async fn starttls(&mut self, config: &RelayConfig) -> SmtpResult<()> {
        if self.tls_active {
            return Ok(());
        }
        if let Some(caps) = &self.capabilities {
            if !caps.starttls {
                debug!("{} did not advertise STARTTLS, trying anyway", self.peer);
            }
        }
        let reply = self.command("STARTTLS").await?;
        if !reply.is_positive() {
            return Err(SmtpError::server(
                reply.code,
                format!("STARTTLS rejected: {}", reply.text()),
            ));
        }

        let stream = self.stream.take().ok_or_else(|| SmtpError::io("Not connected"))?;
        let tcp = match stream {
            SmtpStream::Plain(r) => r.into_inner(),
            SmtpStream::Tls(r) => {
                self.stream = Some(SmtpStream::Tls(r));
                return Err(SmtpError::tls("Already using TLS"));
            }
        };

        let tls_stream = upgrade_to_tls(tcp, config).await?;
        self.stream = Some(SmtpStream::Tls(BufReader::new(tls_stream)));
        self.tls_active = true;
        info!("STARTTLS upgrade with {} successful", self.peer);

        self.ehlo(&config.client_domain).await?;
        Ok(())
    }

    // ── Mail Transaction ────────────────────────────────────────

    /// Issue MAIL FROM.
    pub async fn mail_from(&mut self, sender: &str) -> SmtpResult<SmtpReply> {
        let reply = self.command(&format!("MAIL FROM:<{}>", sender)).await?;
        if reply.is_error() {
            return Err(SmtpError::server(
                reply.code,
                format!("MAIL FROM rejected: {}", reply.text()),
            ));
        }
        Ok(reply)
    }

    /// Issue RCPT TO.
    pub async fn rcpt_to(&mut self, recipient: &str) -> SmtpResult<SmtpReply> {
        let reply = self.command(&format!("RCPT TO:<{}>", recipient)).await?;
        if reply.is_error() {
            return Err(SmtpError::server(
                reply.code,
                format!("RCPT TO rejected for {}: {}", recipient, reply.text()),
            ));
        }
        Ok(reply)
    }

    /// Issue DATA and hand back a writer for the message content.
    pub async fn data(&mut self) -> SmtpResult<DataWriter<'_>> {
        let reply = self.command("DATA").await?;
        if !reply.is_intermediate() {
            return Err(SmtpError::server(
                reply.code,
                format!("DATA rejected: {}", reply.text()),
            ));
        }
        Ok(DataWriter {
            client: self,
            at_line_start: true,
            tail: [0; 2],
        })
    }

    /// Close the connection via QUIT. The socket is dropped even if the
    /// relay does not answer.
    pub async fn quit(&mut self) -> SmtpResult<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        let result = self.command("QUIT").await;
        self.stream = None;
        self.tls_active = false;
        self.capabilities = None;
        info!("SMTP connection to {} closed", self.peer);
        result.map(|_| ())
    }

    // ── Low-level I/O ───────────────────────────────────────────

    /// Send a command and read the reply.
    pub async fn command(&mut self, cmd: &str) -> SmtpResult<SmtpReply> {
        debug!("C: {}", cmd);
        self.write_raw(format!("{}\r\n", cmd).as_bytes()).await?;
        self.flush().await?;
        self.read_reply().await
    }

    /// Read a complete SMTP reply (may be multi-line).
    pub async fn read_reply(&mut self) -> SmtpResult<SmtpReply> {
        let timeout = self.io_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SmtpError::io("Not connected"))?;

        let mut full_response = String::new();
        loop {
            let remaining = MAX_REPLY_BYTES.saturating_sub(full_response.len() as u64);
            if remaining == 0 {
                return Err(SmtpError::protocol(format!(
                    "Reply exceeds {} bytes",
                    MAX_REPLY_BYTES
                )));
            }

            let mut line = String::new();
            let n = tokio::time::timeout(timeout, stream.read_line(&mut line, remaining))
                .await
                .map_err(|_| SmtpError::io("Read timeout"))?
                .map_err(|e| SmtpError::io(format!("Read error: {}", e)))?;

            if n == 0 {
                return Err(SmtpError::io("Connection closed by server"));
            }
            if !line.ends_with('\n') {
                if n as u64 == remaining {
                    return Err(SmtpError::protocol(format!(
                        "Reply exceeds {} bytes",
                        MAX_REPLY_BYTES
                    )));
                }
                return Err(SmtpError::io("Connection closed mid-reply"));
            }
            full_response.push_str(&line);
            debug!("S: {}", line.trim_end());

            // Final line: code followed by space (or nothing), not dash
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                break;
            }
        }

        SmtpReply::parse(&full_response)
    }

    /// Write raw bytes to the stream.
    pub async fn write_raw(&mut self, data: &[u8]) -> SmtpResult<()> {
        let timeout = self.io_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SmtpError::io("Not connected"))?;
        tokio::time::timeout(timeout, stream.write_all(data))
            .await
            .map_err(|_| SmtpError::io("Write timeout"))?
            .map_err(|e| SmtpError::io(format!("Write error: {}", e)))
    }

    async fn flush(&mut self) -> SmtpResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SmtpError::io("Not connected"))?;
        stream
            .flush()
            .await
            .map_err(|e| SmtpError::io(format!("Flush error: {}", e)))
    }
}

// ─── DATA writer ────────────────────────────────────────────────────

/// Open DATA transfer. Content is dot-stuffed on the wire; [`finish`]
/// sends the terminating `CRLF.CRLF` and reads the relay's verdict.
///
/// [`finish`]: DataWriter::finish
pub struct DataWriter<'a> {
    client: &'a mut SmtpClient,
    at_line_start: bool,
    /// Last two content bytes written.
    tail: [u8; 2],
}

impl DataWriter<'_> {
    pub async fn write(&mut self, data: &[u8]) -> SmtpResult<()> {
        let stuffed = dot_stuff(data, &mut self.at_line_start, &mut self.tail);
        self.client.write_raw(&stuffed).await
    }

    pub async fn finish(&mut self) -> SmtpResult<SmtpReply> {
        if &self.tail != b"\r\n" {
            self.client.write_raw(b"\r\n").await?;
        }
        self.client.write_raw(b".\r\n").await?;
        self.client.flush().await?;

        let reply = self.client.read_reply().await?;
        if reply.is_error() {
            return Err(SmtpError::server(
                reply.code,
                format!("Message rejected: {}", reply.text()),
            ));
        }
        Ok(reply)
    }
}

/// SMTP dot-stuffing: a '.' at the start of a line gets a second '.', and a
/// bare LF goes out as CRLF. `tail` holds the last two bytes put on the wire.
fn dot_stuff(data: &[u8], at_line_start: &mut bool, tail: &mut [u8; 2]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    for &b in data {
        if *at_line_start && b == b'.' {
            out.push(b'.');
        }
        if b == b'\n' && tail[1] != b'\r' {
            out.push(b'\r');
            *tail = [tail[1], b'\r'];
        }
        out.push(b);
        *at_line_start = b == b'\n';
        *tail = [tail[1], b];
    }
    out
}

// ─── TLS helper ─────────────────────────────────────────────────────

async fn upgrade_to_tls(tcp: TcpStream, config: &RelayConfig) -> SmtpResult<TlsStream<TcpStream>> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ref ca_path) = config.ca_cert_path {
        let pem_data = tokio::fs::read(ca_path)
            .await
            .map_err(|e| SmtpError::tls(format!("Failed to read CA cert: {}", e)))?;
        let mut cursor = Cursor::new(pem_data);
        let certs = rustls_pemfile::certs(&mut cursor)
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| SmtpError::tls(format!("Failed to add CA cert: {}", e)))?;
        }
    }

    let mut tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if config.certificate_policy == CertificatePolicy::TrustAll {
        warn!(
            "TLS certificate verification disabled for {} – insecure!",
            config.host
        );
        tls_config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
    }

    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
        .map_err(|e| SmtpError::tls(format!("Invalid server name: {}", e)))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)))
}

// ─── AcceptAnyCertificate (for self-signed relays) ──────────────────

#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

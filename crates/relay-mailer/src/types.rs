//! Data types, error handling and configuration for the relay mailer.

use std::fmt;

use serde::{Deserialize, Serialize};

// ─── Error ──────────────────────────────────────────────────────────

/// Kinds of mailer errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SmtpErrorKind {
    /// Required relay settings are missing or out of range.
    ConfigError,
    /// Dial refused or timed out.
    ConnectionError,
    /// Relay rejected a command or sent a malformed reply.
    ProtocolError,
    /// TLS negotiation or trust-store setup failed.
    TlsError,
    /// I/O error during socket read/write.
    IoError,
    /// The message itself is malformed.
    MessageError,
    /// Every send attempt failed; the relay is considered unreachable.
    ServerUnavailable,
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Top-level error type for the relay mailer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpError {
    pub kind: SmtpErrorKind,
    pub message: String,
    /// The SMTP reply code (e.g. 550) if available.
    pub code: Option<u16>,
}

impl SmtpError {
    pub fn new(kind: SmtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigError, msg)
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConnectionError, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ProtocolError, msg)
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsError, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::IoError, msg)
    }

    pub fn server(code: u16, msg: impl Into<String>) -> Self {
        Self::protocol(msg).with_code(code)
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::MessageError, msg)
    }

    pub fn server_unavailable(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ServerUnavailable, msg)
    }

    /// Re-tag the error as a protocol failure of `step`. The reply code and
    /// the underlying detail (e.g. a TLS handshake error) stay in place.
    pub fn during(self, step: &str) -> Self {
        Self {
            kind: SmtpErrorKind::ProtocolError,
            message: format!("{} failed: {}", step, self.message),
            code: self.code,
        }
    }

    pub fn is_bad_config(&self) -> bool {
        self.kind == SmtpErrorKind::ConfigError
    }

    pub fn is_server_unavailable(&self) -> bool {
        self.kind == SmtpErrorKind::ServerUnavailable
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[SMTP {}] {}: {}", code, self.kind, self.message)
        } else {
            write!(f, "[SMTP] {}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for SmtpError {}

pub type SmtpResult<T> = Result<T, SmtpError>;

// ─── Configuration ──────────────────────────────────────────────────

/// How the relay's certificate is checked during STARTTLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificatePolicy {
    /// Validate the chain against webpki roots (plus `ca_cert_path`).
    VerifyChain,
    /// Accept any certificate. Lab and test relays only.
    TrustAll,
}

impl Default for CertificatePolicy {
    fn default() -> Self {
        Self::VerifyChain
    }
}

/// Relay endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Hostname or IP of the relay. Also used as the TLS server name.
    pub host: String,
    /// Port (25 / 587 / 2525). `0` means unset.
    pub port: u16,
    /// Identity announced in EHLO/HELO.
    pub client_domain: String,
    pub certificate_policy: CertificatePolicy,
    /// Optional PEM file with extra trust anchors.
    pub ca_cert_path: Option<String>,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read/write timeout in seconds.
    pub io_timeout_secs: u64,
    /// Total submission attempts per message, including the first one.
    pub send_attempts: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            client_domain: "localhost".into(),
            certificate_policy: CertificatePolicy::VerifyChain,
            ca_cert_path: None,
            connect_timeout_secs: 30,
            io_timeout_secs: 60,
            send_attempts: 3,
        }
    }
}

impl RelayConfig {
    pub fn new(host: impl Into<String>, port: u16, client_domain: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_domain: client_domain.into(),
            ..Default::default()
        }
    }

    pub fn with_certificate_policy(mut self, policy: CertificatePolicy) -> Self {
        self.certificate_policy = policy;
        self
    }

    /// `host:port`, as dialed.
    pub fn server_name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check that a session may be started with this configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.is_empty() {
            return Err(SmtpError::config("relay host is required"));
        }
        if self.port == 0 {
            return Err(SmtpError::config("relay port is required"));
        }
        if self.client_domain.is_empty() {
            return Err(SmtpError::config("client domain is required"));
        }
        if self.send_attempts == 0 {
            return Err(SmtpError::config("send_attempts must be at least 1"));
        }
        Ok(())
    }
}

// ─── Mail ───────────────────────────────────────────────────────────

/// A plain-text message to be rendered and submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mail {
    pub sender: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    /// Envelope-only recipients; never rendered into a header.
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl Mail {
    /// All envelope recipients (to + cc + bcc), in that order.
    pub fn all_recipients(&self) -> Vec<&str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
            .collect()
    }

    /// Optional upstream check. Rendering and sending do not call this.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.sender.is_empty() {
            return Err(SmtpError::message("sender address is required"));
        }
        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(SmtpError::message("at least one recipient is required"));
        }
        Ok(())
    }
}

// ─── SMTP Reply ─────────────────────────────────────────────────────

/// A parsed SMTP reply line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpReply {
    /// The 3-digit reply code.
    pub code: u16,
    /// Reply text lines.
    pub lines: Vec<String>,
}

impl SmtpReply {
    /// Whether this is a positive completion (2xx).
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Whether this is a positive intermediate (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    /// The full reply text.
    pub fn text(&self) -> String {
        self.lines.join("\r\n")
    }

    /// Parse an SMTP reply from raw lines.
    pub fn parse(raw: &str) -> SmtpResult<Self> {
        let mut code: Option<u16> = None;
        let mut lines = Vec::new();

        for line in raw.lines() {
            if line.len() < 3 {
                continue;
            }
            let c: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| SmtpError::protocol(format!("Invalid reply code in: {}", line)))?;
            if code.is_none() {
                code = Some(c);
            }
            lines.push(line.get(4..).unwrap_or("").to_string());
        }

        match code {
            Some(c) => Ok(SmtpReply { code: c, lines }),
            None => Err(SmtpError::protocol("Empty SMTP reply")),
        }
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text())
    }
}

// ─── EHLO Capabilities ─────────────────────────────────────────────

/// Parsed EHLO capability set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EhloCapabilities {
    /// The server greeting name.
    pub server_name: String,
    pub starttls: bool,
}

impl EhloCapabilities {
    /// Parse EHLO response lines into capabilities.
    pub fn parse(reply: &SmtpReply) -> Self {
        let mut caps = Self::default();
        for (i, line) in reply.lines.iter().enumerate() {
            if i == 0 {
                caps.server_name = line.clone();
                continue;
            }
            let keyword = line.split_whitespace().next().unwrap_or("");
            if keyword.eq_ignore_ascii_case("STARTTLS") {
                caps.starttls = true;
            }
        }
        caps
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Error tests ─────────────────────────────────────────────

    #[test]
    fn error_display_without_code() {
        let e = SmtpError::new(SmtpErrorKind::ConnectionError, "timeout");
        assert_eq!(e.to_string(), "[SMTP] ConnectionError: timeout");
    }

    #[test]
    fn error_display_with_code() {
        let e = SmtpError::server(550, "Mailbox not found");
        assert_eq!(e.to_string(), "[SMTP 550] ProtocolError: Mailbox not found");
    }

    #[test]
    fn error_std_error_trait() {
        let e: Box<dyn std::error::Error> = Box::new(SmtpError::config("bad host"));
        assert!(e.to_string().contains("bad host"));
    }

    #[test]
    fn during_retags_as_protocol_and_keeps_code() {
        let e = SmtpError::io("Connection closed by server").during("EHLO");
        assert_eq!(e.kind, SmtpErrorKind::ProtocolError);
        assert_eq!(e.message, "EHLO failed: Connection closed by server");

        let e = SmtpError::server(454, "TLS not available").during("STARTTLS");
        assert_eq!(e.code, Some(454));

        let e = SmtpError::tls("TLS handshake failed: UnknownIssuer").during("STARTTLS");
        assert_eq!(e.kind, SmtpErrorKind::ProtocolError);
        assert_eq!(e.message, "STARTTLS failed: TLS handshake failed: UnknownIssuer");
    }

    #[test]
    fn named_conditions() {
        assert!(SmtpError::config("x").is_bad_config());
        assert!(SmtpError::server_unavailable("x").is_server_unavailable());
        assert!(!SmtpError::connection("x").is_server_unavailable());
    }

    // ── Config tests ────────────────────────────────────────────

    #[test]
    fn relay_config_defaults() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.port, 587);
        assert_eq!(cfg.certificate_policy, CertificatePolicy::VerifyChain);
        assert_eq!(cfg.send_attempts, 3);
    }

    #[test]
    fn relay_config_server_name() {
        let cfg = RelayConfig::new("smtp.example.com", 2525, "client.example.com");
        assert_eq!(cfg.server_name(), "smtp.example.com:2525");
    }

    #[test]
    fn relay_config_requires_every_field() {
        assert!(RelayConfig::new("smtp.x.com", 587, "x.com").validate().is_ok());
        assert!(RelayConfig::new("", 587, "x.com").validate().unwrap_err().is_bad_config());
        assert!(RelayConfig::new("smtp.x.com", 0, "x.com").validate().unwrap_err().is_bad_config());
        assert!(RelayConfig::new("smtp.x.com", 587, "").validate().unwrap_err().is_bad_config());

        let mut cfg = RelayConfig::new("smtp.x.com", 587, "x.com");
        cfg.send_attempts = 0;
        assert!(cfg.validate().unwrap_err().is_bad_config());
    }

    #[test]
    fn relay_config_partial_json_uses_defaults() {
        let cfg: RelayConfig =
            serde_json::from_str(r#"{"host":"relay.local","certificate_policy":"TrustAll"}"#)
                .unwrap();
        assert_eq!(cfg.host, "relay.local");
        assert_eq!(cfg.port, 587);
        assert_eq!(cfg.client_domain, "localhost");
        assert_eq!(cfg.certificate_policy, CertificatePolicy::TrustAll);
        assert!(cfg.ca_cert_path.is_none());
    }

    // ── Mail tests ──────────────────────────────────────────────

    #[test]
    fn mail_all_recipients_in_envelope_order() {
        let mail = Mail {
            sender: "a@x.com".into(),
            to: vec!["to1@x.com".into(), "to2@x.com".into()],
            cc: vec!["cc@x.com".into()],
            bcc: vec!["bcc@x.com".into()],
            ..Default::default()
        };
        assert_eq!(
            mail.all_recipients(),
            vec!["to1@x.com", "to2@x.com", "cc@x.com", "bcc@x.com"]
        );
    }

    #[test]
    fn mail_validate() {
        let mut mail = Mail::default();
        assert!(mail.validate().is_err());
        mail.sender = "a@x.com".into();
        assert!(mail.validate().is_err());
        mail.bcc.push("hidden@x.com".into());
        assert!(mail.validate().is_ok());
    }

    // ── SmtpReply tests ─────────────────────────────────────────

    #[test]
    fn smtp_reply_parse_single() {
        let reply = SmtpReply::parse("250 OK").unwrap();
        assert_eq!(reply.code, 250);
        assert!(reply.is_positive());
        assert_eq!(reply.lines, vec!["OK"]);
    }

    #[test]
    fn smtp_reply_parse_multiline() {
        let raw = "250-mail.example.com\r\n250-SIZE 52428800\r\n250 STARTTLS";
        let reply = SmtpReply::parse(raw).unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(reply.text(), "mail.example.com\r\nSIZE 52428800\r\nSTARTTLS");
    }

    #[test]
    fn smtp_reply_error_codes() {
        let r4 = SmtpReply::parse("421 Service not available").unwrap();
        assert!(r4.is_error());

        let r5 = SmtpReply::parse("550 5.1.1 User unknown").unwrap();
        assert!(r5.is_error());
        assert!(!r5.is_positive());
    }

    #[test]
    fn smtp_reply_intermediate() {
        let r = SmtpReply::parse("354 Start mail input").unwrap();
        assert!(r.is_intermediate());
    }

    #[test]
    fn smtp_reply_rejects_garbage() {
        assert!(SmtpReply::parse("").is_err());
        assert!(SmtpReply::parse("abc def").is_err());
    }

    // ── EhloCapabilities tests ──────────────────────────────────

    #[test]
    fn ehlo_capabilities_parse() {
        let reply = SmtpReply {
            code: 250,
            lines: vec![
                "mail.example.com".into(),
                "SIZE 52428800".into(),
                "AUTH PLAIN LOGIN".into(),
                "STARTTLS".into(),
                "8BITMIME".into(),
                "PIPELINING".into(),
            ],
        };
        let caps = EhloCapabilities::parse(&reply);
        assert_eq!(caps.server_name, "mail.example.com");
        assert!(caps.starttls);

        let reply = SmtpReply::parse("250-relay.test\r\n250 8BITMIME").unwrap();
        assert!(!EhloCapabilities::parse(&reply).starttls);
    }
}

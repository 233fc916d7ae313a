//! Transport seam between the session manager and the wire.
//!
//! [`Session`](crate::session::Session) only talks to these traits; the
//! default [`SmtpTransport`] backs them with [`SmtpClient`].

use async_trait::async_trait;

use crate::client::{DataWriter, SmtpClient};
use crate::types::*;

/// Opens connections to a relay.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial `config.server_name()` and consume the greeting banner.
    async fn dial(&self, config: &RelayConfig) -> SmtpResult<Box<dyn Connection>>;
}

/// One live relay connection.
#[async_trait]
pub trait Connection: Send {
    /// EHLO/HELO with the local client identity.
    async fn greet(&mut self, client_domain: &str) -> SmtpResult<()>;

    /// STARTTLS, validating the certificate per `config.certificate_policy`
    /// with `config.host` as server name.
    async fn starttls(&mut self, config: &RelayConfig) -> SmtpResult<()>;

    async fn mail_from(&mut self, sender: &str) -> SmtpResult<()>;

    async fn rcpt_to(&mut self, recipient: &str) -> SmtpResult<()>;

    /// Open the data-transfer stream for one message.
    async fn data<'a>(&'a mut self) -> SmtpResult<Box<dyn DataStream + 'a>>;

    async fn quit(&mut self) -> SmtpResult<()>;
}

/// Writable message content channel, closed to signal end-of-message.
#[async_trait]
pub trait DataStream: Send {
    async fn write(&mut self, bytes: &[u8]) -> SmtpResult<()>;

    async fn close(&mut self) -> SmtpResult<()>;
}

// ─── Default transport ──────────────────────────────────────────────

/// TCP + STARTTLS transport built on [`SmtpClient`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpTransport;

#[async_trait]
impl Transport for SmtpTransport {
    async fn dial(&self, config: &RelayConfig) -> SmtpResult<Box<dyn Connection>> {
        let client = SmtpClient::connect(config).await?;
        Ok(Box::new(client))
    }
}

#[async_trait]
impl Connection for SmtpClient {
    async fn greet(&mut self, client_domain: &str) -> SmtpResult<()> {
        self.ehlo(client_domain).await.map(|_| ())
    }

    async fn starttls(&mut self, config: &RelayConfig) -> SmtpResult<()> {
        SmtpClient::starttls(self, config).await
    }

    async fn mail_from(&mut self, sender: &str) -> SmtpResult<()> {
        SmtpClient::mail_from(self, sender).await.map(|_| ())
    }

    async fn rcpt_to(&mut self, recipient: &str) -> SmtpResult<()> {
        SmtpClient::rcpt_to(self, recipient).await.map(|_| ())
    }

    async fn data<'a>(&'a mut self) -> SmtpResult<Box<dyn DataStream + 'a>> {
        let writer = SmtpClient::data(self).await?;
        Ok(Box::new(writer))
    }

    async fn quit(&mut self) -> SmtpResult<()> {
        SmtpClient::quit(self).await
    }
}

#[async_trait]
impl<'a> DataStream for DataWriter<'a> {
    async fn write(&mut self, bytes: &[u8]) -> SmtpResult<()> {
        DataWriter::write(self, bytes).await
    }

    async fn close(&mut self) -> SmtpResult<()> {
        self.finish().await.map(|_| ())
    }
}

//! Relay session manager.
//!
//! A [`Session`] owns at most one relay connection and drives it through
//! dial → EHLO → STARTTLS. [`Session::send`] submits a message and, on any
//! failure before the end-of-data marker, restarts the session and replays
//! the whole envelope until the retry budget runs out.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::logger::{LogFacade, MailLog};
use crate::message::build_message;
use crate::transport::{Connection, SmtpTransport, Transport};
use crate::types::*;

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No connection held.
    Unconnected,
    /// Dialed and greeting, not yet encrypted.
    Plaintext,
    /// STARTTLS done; ready to send.
    Secure,
    /// Torn down by [`Session::quit`].
    Closed,
}

/// Per-attempt step of a submission, for log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendStep {
    MailFrom,
    RcptTo,
    Data,
    Write,
    EndOfData,
}

impl fmt::Display for SendStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MailFrom => "MAIL FROM",
            Self::RcptTo => "RCPT TO",
            Self::Data => "DATA",
            Self::Write => "message write",
            Self::EndOfData => "end of data",
        };
        f.write_str(name)
    }
}

pub struct Session {
    config: RelayConfig,
    transport: Box<dyn Transport>,
    logger: Arc<dyn MailLog>,
    connection: Option<Box<dyn Connection>>,
    state: SessionState,
    messages_sent: u64,
}

impl Session {
    /// Session over the default TCP/STARTTLS transport, logging through `log`.
    pub fn new(config: RelayConfig) -> Self {
        Self::with_transport(config, Box::new(SmtpTransport), Arc::new(LogFacade))
    }

    pub fn with_transport(
        config: RelayConfig,
        transport: Box<dyn Transport>,
        logger: Arc<dyn MailLog>,
    ) -> Self {
        Self {
            config,
            transport,
            logger,
            connection: None,
            state: SessionState::Unconnected,
            messages_sent: 0,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Secure
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Dial the relay, greet it and upgrade to TLS.
    ///
    /// Any connection already held is closed first. Errors are returned
    /// as-is: `ConfigError` without touching the network, `ConnectionError`
    /// for dial failures, `ProtocolError` for EHLO and STARTTLS.
    pub async fn start(&mut self) -> SmtpResult<()> {
        if let Err(e) = self.config.validate() {
            self.logger
                .error(&format!("Refusing to start relay session: {}", e.message));
            return Err(e);
        }
        self.release().await;

        let addr = self.config.server_name();
        let mut conn = match self.transport.dial(&self.config).await {
            Ok(conn) => conn,
            Err(e) => {
                self.logger
                    .error(&format!("Dialing relay {} failed: {}", addr, e));
                let err = SmtpError::connection(format!("dial {} failed: {}", addr, e.message));
                return Err(match e.code {
                    Some(code) => err.with_code(code),
                    None => err,
                });
            }
        };
        self.state = SessionState::Plaintext;

        if let Err(e) = conn.greet(&self.config.client_domain).await {
            return Err(self.abandon(conn, e.during("EHLO")).await);
        }
        if let Err(e) = conn.starttls(&self.config).await {
            return Err(self.abandon(conn, e.during("STARTTLS")).await);
        }

        self.connection = Some(conn);
        self.state = SessionState::Secure;
        Ok(())
    }

    /// Render and submit `mail`, retrying the whole envelope on failure.
    ///
    /// Returns `ConfigError` for an invalid relay config and
    /// `ServerUnavailable` once `send_attempts` attempts have failed.
    /// A failure while closing the data stream is logged only: the relay
    /// already has the content.
    pub async fn send(&mut self, mail: &Mail) -> SmtpResult<()> {
        if let Err(e) = self.config.validate() {
            self.logger
                .error(&format!("Refusing to send with invalid relay config: {}", e.message));
            return Err(e);
        }

        let payload = build_message(mail);
        let recipients = mail.all_recipients();
        let budget = self.config.send_attempts;
        let mut remaining = budget;

        loop {
            let (step, err) = match self.attempt(&mail.sender, &recipients, &payload).await {
                Ok(()) => {
                    self.messages_sent += 1;
                    return Ok(());
                }
                Err(failure) => failure,
            };
            self.logger.error(&format!("{} failed: {}", step, err));

            remaining -= 1;
            if remaining == 0 {
                self.logger.error(&format!(
                    "Giving up on message from {} to {} recipient(s) after {} attempt(s)",
                    mail.sender,
                    recipients.len(),
                    budget
                ));
                return Err(SmtpError::server_unavailable(format!(
                    "relay {} unavailable after {} attempt(s)",
                    self.config.server_name(),
                    budget
                )));
            }

            self.logger.warn(&format!(
                "Restarting relay session, retry {} of {}",
                budget - remaining,
                budget - 1
            ));
            if let Err(e) = self.start().await {
                self.logger.error(&format!("Relay restart failed: {}", e));
            }
        }
    }

    /// Send QUIT and drop the connection.
    pub async fn quit(&mut self) -> SmtpResult<()> {
        let result = match self.connection.take() {
            Some(mut conn) => conn.quit().await,
            None => Ok(()),
        };
        self.state = SessionState::Closed;
        result
    }

    // ── Internals ───────────────────────────────────────────────

    async fn attempt(
        &mut self,
        sender: &str,
        recipients: &[&str],
        payload: &str,
    ) -> Result<(), (SendStep, SmtpError)> {
        let conn = self.connection.as_mut().ok_or_else(|| {
            (
                SendStep::MailFrom,
                SmtpError::connection("no live relay connection"),
            )
        })?;

        conn.mail_from(sender)
            .await
            .map_err(|e| (SendStep::MailFrom, e))?;
        for rcpt in recipients {
            conn.rcpt_to(rcpt).await.map_err(|e| (SendStep::RcptTo, e))?;
        }

        let mut stream = conn.data().await.map_err(|e| (SendStep::Data, e))?;
        stream
            .write(payload.as_bytes())
            .await
            .map_err(|e| (SendStep::Write, e))?;
        if let Err(e) = stream.close().await {
            self.logger.error(&format!(
                "{} failed, treating message as sent: {}",
                SendStep::EndOfData,
                e
            ));
        }
        Ok(())
    }

    /// Close the held connection, if any, before it is replaced.
    async fn release(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            if let Err(e) = conn.quit().await {
                self.logger
                    .warn(&format!("Closing previous relay connection failed: {}", e));
            }
        }
        self.state = SessionState::Unconnected;
    }

    /// Tear down a half-open connection and hand back the error to report.
    async fn abandon(&mut self, mut conn: Box<dyn Connection>, err: SmtpError) -> SmtpError {
        self.logger.error(&format!(
            "Starting relay session with {} failed: {}",
            self.config.server_name(),
            err
        ));
        let _ = conn.quit().await;
        self.state = SessionState::Unconnected;
        err
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

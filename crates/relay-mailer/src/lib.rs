//! **relay-mailer** — minimal SMTP relay sender.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data types, error handling, relay configuration |
//! | [`message`] | Plain-text message builder |
//! | [`session`] | Session lifecycle (dial, EHLO, STARTTLS) and send with retry |
//! | [`transport`] | Transport traits and the default TCP/STARTTLS transport |
//! | [`client`] | Low-level SMTP protocol engine (EHLO, STARTTLS, envelope, DATA) |
//! | [`logger`] | Injectable warning/error sink |

pub mod types;
pub mod client;
pub mod message;
pub mod transport;
pub mod session;
pub mod logger;

pub use logger::{LogFacade, MailLog};
pub use message::{build_message, MailBuilder};
pub use session::{Session, SessionState};
pub use transport::{Connection, DataStream, SmtpTransport, Transport};
pub use types::{CertificatePolicy, Mail, RelayConfig, SmtpError, SmtpErrorKind, SmtpResult};

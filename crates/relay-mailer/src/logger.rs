//! Logging capability handed to a [`Session`](crate::session::Session).
//!
//! Warning and error events from the session lifecycle go through a
//! [`MailLog`] trait object instead of straight to the global logger, so
//! callers can route or capture them.

use log::{error, warn};

/// Log target used by [`LogFacade`].
pub const LOG_TARGET: &str = "relay_mailer";

/// Leveled event sink for session lifecycle events.
pub trait MailLog: Send + Sync {
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFacade;

impl MailLog for LogFacade {
    fn warn(&self, message: &str) {
        warn!(target: LOG_TARGET, "{}", message);
    }

    fn error(&self, message: &str) {
        error!(target: LOG_TARGET, "{}", message);
    }
}

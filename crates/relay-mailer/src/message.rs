//! Plain-text message builder.
//!
//! Renders a [`Mail`] into the header block and body handed to the relay
//! during DATA. Header values are written as given: no RFC 2047 encoding
//! and no folding, so callers must not pass CR or LF in addresses or the
//! subject.

use crate::types::Mail;

/// Fixed MIME preamble closing every header block.
pub const MIME_PREAMBLE: &str = "MIME-Version: 1.0\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\n";

/// Visible-header separator for multiple addresses.
const ADDRESS_SEPARATOR: &str = ";";

/// Build the full message string from a [`Mail`].
///
/// Total and deterministic. Bcc recipients are never written to a header.
pub fn build_message(mail: &Mail) -> String {
    let mut out = String::with_capacity(mail.body.len() + 256);

    write_header(&mut out, "From", &mail.sender);
    if !mail.to.is_empty() {
        write_header(&mut out, "To", &mail.to.join(ADDRESS_SEPARATOR));
    }
    if !mail.cc.is_empty() {
        write_header(&mut out, "Cc", &mail.cc.join(ADDRESS_SEPARATOR));
    }
    write_header(&mut out, "Subject", &mail.subject);
    out.push_str(MIME_PREAMBLE);

    out.push_str("\r\n");
    out.push_str(&mail.body);
    out
}

fn write_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

/// Fluent construction of a [`Mail`].
pub struct MailBuilder {
    mail: Mail,
}

impl MailBuilder {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            mail: Mail {
                sender: sender.into(),
                ..Default::default()
            },
        }
    }

    pub fn to(mut self, addr: impl Into<String>) -> Self {
        self.mail.to.push(addr.into());
        self
    }

    pub fn cc(mut self, addr: impl Into<String>) -> Self {
        self.mail.cc.push(addr.into());
        self
    }

    pub fn bcc(mut self, addr: impl Into<String>) -> Self {
        self.mail.bcc.push(addr.into());
        self
    }

    pub fn subject(mut self, s: impl Into<String>) -> Self {
        self.mail.subject = s.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.mail.body = body.into();
        self
    }

    pub fn build(self) -> Mail {
        self.mail
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mail() -> Mail {
        MailBuilder::new("a@x.com")
            .to("b@x.com")
            .subject("Hi")
            .body("Yo")
            .build()
    }

    #[test]
    fn build_simple_message() {
        let raw = build_message(&sample_mail());
        assert_eq!(
            raw,
            "From: a@x.com\r\n\
             To: b@x.com\r\n\
             Subject: Hi\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: text/plain; charset=\"UTF-8\"\r\n\
             \r\n\
             Yo"
        );
    }

    #[test]
    fn build_is_deterministic() {
        let mail = sample_mail();
        assert_eq!(build_message(&mail), build_message(&mail));
    }

    #[test]
    fn to_header_omitted_when_empty() {
        let mail = MailBuilder::new("a@x.com").cc("c@x.com").build();
        let raw = build_message(&mail);
        assert!(!raw.contains("To:"));
        assert!(raw.contains("Cc: c@x.com\r\n"));
    }

    #[test]
    fn cc_header_omitted_when_empty() {
        let raw = build_message(&sample_mail());
        assert!(!raw.contains("Cc:"));
    }

    #[test]
    fn bcc_never_rendered() {
        let mail = MailBuilder::new("a@x.com")
            .to("b@x.com")
            .bcc("secret1@x.com")
            .bcc("secret2@x.com")
            .build();
        let raw = build_message(&mail);
        assert!(!raw.contains("Bcc"));
        assert!(!raw.contains("secret"));
    }

    #[test]
    fn addresses_joined_with_semicolon() {
        let mail = MailBuilder::new("a@x.com")
            .to("b@x.com")
            .to("c@x.com")
            .to("d@x.com")
            .cc("e@x.com")
            .cc("f@x.com")
            .build();
        let raw = build_message(&mail);
        assert!(raw.contains("To: b@x.com;c@x.com;d@x.com\r\n"));
        assert!(raw.contains("Cc: e@x.com;f@x.com\r\n"));
    }

    #[test]
    fn body_follows_single_blank_line_verbatim() {
        let body = "line one\nline two\r\n\r\n.leading dot\n";
        let mail = MailBuilder::new("a@x.com").to("b@x.com").body(body).build();
        let raw = build_message(&mail);
        let (headers, rendered_body) = raw.split_once("\r\n\r\n").unwrap();
        assert_eq!(rendered_body, body);
        assert!(headers.ends_with("charset=\"UTF-8\""));
    }

    #[test]
    fn degenerate_mail_still_renders() {
        let raw = build_message(&Mail::default());
        assert_eq!(
            raw,
            format!("From: \r\nSubject: \r\n{}\r\n", MIME_PREAMBLE)
        );
    }

    #[test]
    fn header_values_are_not_encoded() {
        let mail = MailBuilder::new("a@x.com").subject("Привет").build();
        assert!(build_message(&mail).contains("Subject: Привет\r\n"));
    }
}

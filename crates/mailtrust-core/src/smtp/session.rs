//! SMTP session state machine
//!
//! The transaction state lives in [`Phase`]. An envelope only exists once a
//! recipient has been accepted, so DATA cannot be reached without one.
//! This module performs no I/O; the handler drives it and does the
//! lookups.

use mailtrust_common::config::SmtpConfig;
use mailtrust_common::types::{EmailAddress, Envelope, MailboxId};
use std::fmt;

/// Per-connection behaviour, fixed when the connection is accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Name in the banner and EHLO reply
    pub hostname: String,
    /// MAIL requires a prior successful AUTH
    pub auth_required: bool,
    /// MAIL FROM must equal the authenticated address
    pub enforce_sender_identity: bool,
    pub max_message_size: usize,
    pub max_recipients: usize,
    /// STARTTLS can be offered
    pub tls_available: bool,
    /// AUTH is refused until TLS is active
    pub require_tls_for_auth: bool,
    /// Seconds to wait for the next command line
    pub command_timeout_secs: u64,
}

impl SessionConfig {
    /// Port 25: unauthenticated peers, relaxed sender identity
    pub fn inbound(smtp: &SmtpConfig, tls_available: bool) -> Self {
        Self {
            hostname: smtp.hostname.clone(),
            auth_required: smtp.auth_required,
            enforce_sender_identity: false,
            max_message_size: smtp.max_message_size,
            max_recipients: smtp.max_recipients,
            tls_available,
            require_tls_for_auth: smtp.require_tls_for_auth,
            command_timeout_secs: smtp.connection_timeout_secs,
        }
    }

    /// Port 587/465: authentication and sender identity required
    pub fn submission(smtp: &SmtpConfig, tls_available: bool) -> Self {
        Self {
            auth_required: true,
            enforce_sender_identity: true,
            ..Self::inbound(smtp, tls_available)
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::inbound(&SmtpConfig::default(), false)
    }
}

/// Transaction state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// No HELO/EHLO yet
    Connected,
    /// Ready for MAIL
    Greeted,
    /// MAIL accepted; `None` is the null sender
    MailFromSet { from: Option<EmailAddress> },
    /// At least one RCPT accepted
    RcptAccumulating { envelope: Envelope },
}

/// An SMTP reply, possibly multi-line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    pub fn bad_sequence(detail: &str) -> Self {
        Self::new(503, format!("5.5.1 {}", detail))
    }

    pub fn invalid_credentials() -> Self {
        Self::new(535, "5.7.8 Invalid credentials")
    }

    pub fn temporary_failure() -> Self {
        Self::new(451, "4.3.0 Temporary failure, try again later")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            write!(f, "{}{}{}\r\n", self.code, sep, line)?;
        }
        Ok(())
    }
}

/// Authenticated submitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub address: EmailAddress,
    pub mailbox_id: MailboxId,
}

/// One connection's protocol state
#[derive(Debug)]
pub struct SmtpSession {
    config: SessionConfig,
    phase: Phase,
    helo: Option<String>,
    client_ip: Option<String>,
    identity: Option<Identity>,
    tls_active: bool,
}

impl SmtpSession {
    pub fn new(config: SessionConfig, client_ip: Option<String>) -> Self {
        Self {
            config,
            phase: Phase::Connected,
            helo: None,
            client_ip,
            identity: None,
            tls_active: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn tls_active(&self) -> bool {
        self.tls_active
    }

    pub fn greeting(&self) -> Reply {
        Reply::new(220, format!("{} ESMTP mailtrust", self.config.hostname))
    }

    /// HELO or EHLO; resets any transaction in progress
    pub fn helo(&mut self, domain: &str, extended: bool) -> Reply {
        let domain = domain.trim();
        if domain.is_empty() {
            return Reply::new(501, "5.5.4 Domain name required");
        }

        self.helo = Some(domain.to_string());
        self.phase = Phase::Greeted;

        if !extended {
            return Reply::new(250, format!("{} Hello {}", self.config.hostname, domain));
        }

        let mut lines = vec![
            format!("{} Hello {}", self.config.hostname, domain),
            format!("SIZE {}", self.config.max_message_size),
            "8BITMIME".to_string(),
            "PIPELINING".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ];
        if self.config.tls_available && !self.tls_active {
            lines.push("STARTTLS".to_string());
        }
        if !self.config.require_tls_for_auth || self.tls_active {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        Reply::multiline(250, lines)
    }

    /// Whether an AUTH command may start now
    pub fn check_auth(&self) -> Result<(), Reply> {
        match self.phase {
            Phase::Connected => return Err(Reply::bad_sequence("Send HELO/EHLO first")),
            Phase::Greeted => {}
            _ => return Err(Reply::bad_sequence("AUTH not permitted during a mail transaction")),
        }
        if self.identity.is_some() {
            return Err(Reply::bad_sequence("Already authenticated"));
        }
        if self.config.require_tls_for_auth && !self.tls_active {
            return Err(Reply::new(538, "5.7.11 Encryption required for requested authentication mechanism"));
        }
        Ok(())
    }

    pub fn authenticated(&mut self, identity: Identity) -> Reply {
        self.identity = Some(identity);
        Reply::new(235, "2.7.0 Authentication successful")
    }

    /// MAIL FROM:<address>
    pub fn mail_from(&mut self, args: &str) -> Reply {
        match self.phase {
            Phase::Connected => return Reply::bad_sequence("Send HELO/EHLO first"),
            Phase::Greeted => {}
            _ => return Reply::bad_sequence("Sender already specified"),
        }

        if self.config.auth_required && self.identity.is_none() {
            return Reply::new(530, "5.7.0 Authentication required");
        }

        let Some(from) = parse_mail_from(args) else {
            return Reply::new(501, "5.1.7 Bad sender address syntax");
        };

        if self.config.enforce_sender_identity {
            let owned = match (&from, &self.identity) {
                (Some(from), Some(identity)) => *from == identity.address,
                _ => false,
            };
            if !owned {
                return Reply::new(553, "5.7.1 Sender address not owned by authenticated user");
            }
        }

        self.phase = Phase::MailFromSet { from };
        Reply::new(250, "2.1.0 OK")
    }

    /// Validate RCPT TO:<address> without accepting it yet
    pub fn check_rcpt(&self, args: &str) -> Result<EmailAddress, Reply> {
        let count = match &self.phase {
            Phase::MailFromSet { .. } => 0,
            Phase::RcptAccumulating { envelope } => envelope.to.len(),
            _ => return Err(Reply::bad_sequence("Need MAIL command")),
        };

        let recipient = parse_rcpt_to(args).ok_or_else(|| Reply::new(501, "5.1.3 Bad recipient address syntax"))?;

        if count >= self.config.max_recipients {
            return Err(Reply::new(452, "4.5.3 Too many recipients"));
        }
        Ok(recipient)
    }

    /// Add a recipient that passed [`check_rcpt`](Self::check_rcpt)
    pub fn add_recipient(&mut self, recipient: EmailAddress) -> Reply {
        let phase = std::mem::replace(&mut self.phase, Phase::Greeted);
        self.phase = match phase {
            Phase::MailFromSet { from } => Phase::RcptAccumulating {
                envelope: Envelope {
                    from,
                    to: vec![recipient],
                    client_ip: self.client_ip.clone(),
                    helo: self.helo.clone(),
                },
            },
            Phase::RcptAccumulating { mut envelope } => {
                envelope.to.push(recipient);
                Phase::RcptAccumulating { envelope }
            }
            other => {
                self.phase = other;
                return Reply::bad_sequence("Need MAIL command");
            }
        };
        Reply::new(250, "2.1.5 OK")
    }

    /// DATA: hands out the envelope and returns the session to `Greeted`
    pub fn begin_data(&mut self) -> Result<Envelope, Reply> {
        match std::mem::replace(&mut self.phase, Phase::Greeted) {
            Phase::RcptAccumulating { envelope } => Ok(envelope),
            other => {
                let reply = match other {
                    Phase::Connected => Reply::bad_sequence("Send HELO/EHLO first"),
                    Phase::MailFromSet { .. } => Reply::bad_sequence("Need RCPT command"),
                    _ => Reply::bad_sequence("Need MAIL command"),
                };
                self.phase = other;
                Err(reply)
            }
        }
    }

    pub fn rset(&mut self) -> Reply {
        if self.phase != Phase::Connected {
            self.phase = Phase::Greeted;
        }
        Reply::new(250, "2.0.0 OK")
    }

    /// STARTTLS; the caller upgrades the stream after sending the reply
    pub fn check_starttls(&self) -> Result<Reply, Reply> {
        if !self.config.tls_available {
            return Err(Reply::new(502, "5.5.1 STARTTLS not supported"));
        }
        if self.tls_active {
            return Err(Reply::bad_sequence("TLS already active"));
        }
        if !matches!(self.phase, Phase::Connected | Phase::Greeted) {
            return Err(Reply::bad_sequence("STARTTLS not permitted during a mail transaction"));
        }
        Ok(Reply::new(220, "2.0.0 Ready to start TLS"))
    }

    /// Discard all pre-TLS state once the handshake completed
    pub fn tls_started(&mut self) {
        self.tls_active = true;
        self.phase = Phase::Connected;
        self.helo = None;
        self.identity = None;
    }
}

/// Split a command line into verb and argument
pub(crate) fn parse_command(line: &str) -> (String, &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((verb, args)) => (verb.to_ascii_uppercase(), args.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

/// Extract `<address>` after a `FROM:`/`TO:` keyword, ignoring parameters
fn path_after<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let args = args.trim();
    let head = args.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = args.get(keyword.len()..)?.trim_start();

    if let Some(stripped) = rest.strip_prefix('<') {
        let end = stripped.find('>')?;
        Some(stripped[..end].trim())
    } else {
        rest.split_whitespace().next()
    }
}

/// `Some(None)` is the null sender `<>`
fn parse_mail_from(args: &str) -> Option<Option<EmailAddress>> {
    let path = path_after(args, "FROM:")?;
    if path.is_empty() {
        return Some(None);
    }
    EmailAddress::parse(path).map(Some)
}

fn parse_rcpt_to(args: &str) -> Option<EmailAddress> {
    path_after(args, "TO:").and_then(EmailAddress::parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn session(config: SessionConfig) -> SmtpSession {
        let mut session = SmtpSession::new(config, Some("192.0.2.10".to_string()));
        session.helo("client.example.org", true);
        session
    }

    fn identity(address: &str) -> Identity {
        Identity {
            address: EmailAddress::parse(address).unwrap(),
            mailbox_id: Uuid::now_v7(),
        }
    }

    #[test]
    fn test_parse_mail_from() {
        assert_eq!(
            parse_mail_from("FROM:<user@example.com>"),
            Some(Some(EmailAddress::new("user", "example.com")))
        );
        assert_eq!(
            parse_mail_from("from: <User@Example.com> SIZE=1024"),
            Some(Some(EmailAddress::new("user", "example.com")))
        );
        assert_eq!(parse_mail_from("FROM:<>"), Some(None));
        assert_eq!(parse_mail_from("FROM:<no-at-sign>"), None);
        assert_eq!(parse_mail_from("invalid"), None);
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            parse_rcpt_to("TO:<user@example.com>"),
            Some(EmailAddress::new("user", "example.com"))
        );
        assert_eq!(parse_rcpt_to("TO:<>"), None);
        assert_eq!(parse_rcpt_to("FROM:<user@example.com>"), None);
    }

    #[test]
    fn test_multibyte_keyword_is_syntax_error() {
        assert_eq!(parse_mail_from("FROMé:<a@example.org>"), None);
        assert_eq!(parse_rcpt_to("Té:<a@example.com>"), None);
        assert_eq!(parse_mail_from("é"), None);

        let mut s = session(SessionConfig::default());
        assert_eq!(s.mail_from("FROMé:<a@example.org>").code, 501);
        assert_eq!(s.mail_from("FROM:<a@example.org>").code, 250);
        assert_eq!(s.check_rcpt("TOé:<a@example.com>").unwrap_err().code, 501);
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("mail FROM:<a@b.c>\r\n"), ("MAIL".to_string(), "FROM:<a@b.c>"));
        assert_eq!(parse_command("QUIT"), ("QUIT".to_string(), ""));
    }

    #[test]
    fn test_reply_format() {
        assert_eq!(Reply::new(250, "2.0.0 OK").to_string(), "250 2.0.0 OK\r\n");
        assert_eq!(
            Reply::multiline(250, vec!["a".into(), "b".into()]).to_string(),
            "250-a\r\n250 b\r\n"
        );
    }

    #[test]
    fn test_full_transaction() {
        let mut s = session(SessionConfig::default());
        assert_eq!(s.mail_from("FROM:<carol@example.org>").code, 250);
        let rcpt = s.check_rcpt("TO:<alice@example.com>").unwrap();
        assert_eq!(s.add_recipient(rcpt).code, 250);
        let rcpt = s.check_rcpt("TO:<bob@example.com>").unwrap();
        s.add_recipient(rcpt);

        let envelope = s.begin_data().unwrap();
        assert_eq!(envelope.from, Some(EmailAddress::new("carol", "example.org")));
        assert_eq!(envelope.to.len(), 2);
        assert_eq!(envelope.client_ip.as_deref(), Some("192.0.2.10"));
        assert_eq!(envelope.helo.as_deref(), Some("client.example.org"));
        assert_eq!(s.phase(), &Phase::Greeted);
    }

    #[test]
    fn test_out_of_order_commands() {
        let mut s = SmtpSession::new(SessionConfig::default(), None);
        assert_eq!(s.mail_from("FROM:<a@example.org>").code, 503);

        s.helo("client", false);
        assert_eq!(s.begin_data().unwrap_err().code, 503);
        assert_eq!(s.check_rcpt("TO:<a@example.com>").unwrap_err().code, 503);

        s.mail_from("FROM:<a@example.org>");
        assert_eq!(s.mail_from("FROM:<a@example.org>").code, 503);
        // DATA before any RCPT
        assert_eq!(s.begin_data().unwrap_err().code, 503);
        assert!(matches!(s.phase(), Phase::MailFromSet { .. }));
    }

    #[test]
    fn test_rset_clears_transaction() {
        let mut s = session(SessionConfig::default());
        s.mail_from("FROM:<a@example.org>");
        let rcpt = s.check_rcpt("TO:<b@example.com>").unwrap();
        s.add_recipient(rcpt);
        s.rset();
        assert_eq!(s.phase(), &Phase::Greeted);
        assert_eq!(s.begin_data().unwrap_err().code, 503);
    }

    #[test]
    fn test_recipient_limit() {
        let config = SessionConfig {
            max_recipients: 1,
            ..SessionConfig::default()
        };
        let mut s = session(config);
        s.mail_from("FROM:<a@example.org>");
        let rcpt = s.check_rcpt("TO:<b@example.com>").unwrap();
        s.add_recipient(rcpt);
        assert_eq!(s.check_rcpt("TO:<c@example.com>").unwrap_err().code, 452);
    }

    #[test]
    fn test_null_sender_inbound() {
        let mut s = session(SessionConfig::default());
        assert_eq!(s.mail_from("FROM:<>").code, 250);
        assert_eq!(s.phase(), &Phase::MailFromSet { from: None });
    }

    #[test]
    fn test_submission_requires_auth_and_identity() {
        let config = SessionConfig::submission(&SmtpConfig::default(), false);
        let mut s = session(config);
        assert_eq!(s.mail_from("FROM:<alice@example.com>").code, 530);

        assert!(s.check_auth().is_ok());
        assert_eq!(s.authenticated(identity("alice@example.com")).code, 235);
        assert_eq!(s.check_auth().unwrap_err().code, 503);

        assert_eq!(s.mail_from("FROM:<mallory@example.com>").code, 553);
        assert_eq!(s.mail_from("FROM:<>").code, 553);
        assert_eq!(s.mail_from("FROM:<Alice@Example.com>").code, 250);
    }

    #[test]
    fn test_tls_gating() {
        let config = SessionConfig {
            tls_available: true,
            require_tls_for_auth: true,
            ..SessionConfig::default()
        };
        let mut s = SmtpSession::new(config, None);
        let ehlo = s.helo("client", true);
        assert!(ehlo.lines.contains(&"STARTTLS".to_string()));
        assert!(!ehlo.lines.iter().any(|l| l.starts_with("AUTH")));
        assert_eq!(s.check_auth().unwrap_err().code, 538);

        assert_eq!(s.check_starttls().unwrap().code, 220);
        s.tls_started();
        assert_eq!(s.phase(), &Phase::Connected);
        assert_eq!(s.check_starttls().unwrap_err().code, 503);

        let ehlo = s.helo("client", true);
        assert!(!ehlo.lines.contains(&"STARTTLS".to_string()));
        assert!(ehlo.lines.contains(&"AUTH PLAIN LOGIN".to_string()));
        assert!(s.check_auth().is_ok());
    }

    #[test]
    fn test_starttls_unavailable() {
        let s = session(SessionConfig::default());
        assert_eq!(s.check_starttls().unwrap_err().code, 502);
    }
}

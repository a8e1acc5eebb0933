//! SMTP connection handler
//!
//! Drives an [`SmtpSession`] over any byte stream. STARTTLS swaps the
//! stream for a TLS one and restarts the command loop with fresh session
//! state. At the end of DATA the sender domain must pass the DKIM key
//! check; each recipient is then routed on its own, so a failed delivery
//! to one never affects the others or the reply.

use super::auth::{login_challenge_password, login_challenge_username, Credentials, SmtpAuthenticator};
use super::session::{parse_command, Identity, Reply, SessionConfig, SmtpSession};
use crate::dkim::InboundDkimValidator;
use crate::router::{MessageRouter, ParsedMessage, RouteOutcome};
use anyhow::{anyhow, Result};
use mailtrust_common::types::{EmailAddress, Envelope};
use mailtrust_storage::repository::MailboxRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Services shared by every connection
pub struct SessionContext {
    pub authenticator: SmtpAuthenticator,
    pub validator: InboundDkimValidator,
    pub router: MessageRouter,
    pub mailboxes: Arc<dyn MailboxRepository>,
}

enum Flow {
    Quit,
    StartTls,
}

enum DataRead {
    Complete(Vec<u8>),
    TooLarge,
}

/// One client line as seen by the command loop
enum Input {
    Line(String),
    /// Rejected without touching session state
    Malformed(Reply),
    Closed,
}

enum LineRead {
    Eof,
    Line(Vec<u8>),
    /// Longer than the limit; consumed through its newline and discarded
    TooLong,
}

/// RFC 5321 text line limit, CRLF included
const MAX_COMMAND_LINE: usize = 1000;

pub struct SmtpHandler {
    session: SmtpSession,
    ctx: Arc<SessionContext>,
    peer: String,
    tls_acceptor: Option<TlsAcceptor>,
}

impl SmtpHandler {
    pub fn new(
        config: SessionConfig,
        ctx: Arc<SessionContext>,
        peer: Option<std::net::SocketAddr>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        let config = SessionConfig {
            tls_available: config.tls_available && tls_acceptor.is_some(),
            ..config
        };
        Self {
            session: SmtpSession::new(config, peer.map(|p| p.ip().to_string())),
            ctx,
            peer: peer.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string()),
            tls_acceptor,
        }
    }

    /// Run a plaintext session, upgrading on STARTTLS
    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut conn = BufReader::new(stream);
        let greeting = self.session.greeting();
        self.send(&mut conn, &greeting).await?;

        if let Flow::Quit = self.command_loop(&mut conn).await? {
            return Ok(());
        }

        let acceptor = self
            .tls_acceptor
            .clone()
            .ok_or_else(|| anyhow!("STARTTLS accepted without an acceptor"))?;
        let tls = acceptor.accept(conn.into_inner()).await?;
        self.session.tls_started();
        debug!(peer = %self.peer, "STARTTLS negotiated");

        let mut conn = BufReader::new(tls);
        self.command_loop(&mut conn).await?;
        Ok(())
    }

    /// Run a session on the implicit-TLS port
    pub async fn handle_tls<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let acceptor = self
            .tls_acceptor
            .take()
            .ok_or_else(|| anyhow!("implicit TLS without an acceptor"))?;
        let tls = acceptor.accept(stream).await?;
        self.session.tls_started();

        let mut conn = BufReader::new(tls);
        let greeting = self.session.greeting();
        self.send(&mut conn, &greeting).await?;
        self.command_loop(&mut conn).await?;
        Ok(())
    }

    async fn command_loop<S>(&mut self, conn: &mut BufReader<S>) -> Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let line = match self.read_line(conn).await? {
                Input::Line(line) => line,
                Input::Malformed(reply) => {
                    self.send(conn, &reply).await?;
                    continue;
                }
                Input::Closed => {
                    debug!(peer = %self.peer, "Client disconnected");
                    return Ok(Flow::Quit);
                }
            };

            let (verb, args) = parse_command(&line);
            if verb == "AUTH" {
                debug!(peer = %self.peer, "SMTP command: AUTH");
            } else {
                debug!(peer = %self.peer, command = %line, "SMTP command");
            }

            let reply = match verb.as_str() {
                "HELO" => self.session.helo(args, false),
                "EHLO" => self.session.helo(args, true),
                "STARTTLS" => match self.session.check_starttls() {
                    Ok(ready) => {
                        self.send(conn, &ready).await?;
                        return Ok(Flow::StartTls);
                    }
                    Err(reply) => reply,
                },
                "AUTH" => self.auth(conn, args).await?,
                "MAIL" => self.session.mail_from(args),
                "RCPT" => self.rcpt(args).await,
                "DATA" => self.data(conn).await?,
                "RSET" => self.session.rset(),
                "NOOP" => Reply::new(250, "2.0.0 OK"),
                "VRFY" => Reply::new(252, "2.5.0 Cannot VRFY user, but will accept message"),
                "QUIT" => {
                    let bye = Reply::new(221, format!("2.0.0 {} closing connection", self.session.config().hostname));
                    self.send(conn, &bye).await?;
                    return Ok(Flow::Quit);
                }
                _ => Reply::new(500, "5.5.2 Command not recognized"),
            };

            self.send(conn, &reply).await?;
        }
    }

    async fn rcpt(&mut self, args: &str) -> Reply {
        let recipient = match self.session.check_rcpt(args) {
            Ok(recipient) => recipient,
            Err(reply) => return reply,
        };

        match self.ctx.mailboxes.find_local(&recipient.local, &recipient.domain).await {
            Ok(Some(mailbox)) if mailbox.is_usable() => {
                debug!(peer = %self.peer, %recipient, "Recipient is local");
            }
            Ok(_) => {
                debug!(peer = %self.peer, %recipient, "Recipient not local, accepting without delivery");
            }
            Err(e) => {
                warn!(peer = %self.peer, %recipient, error = %e, "Recipient lookup failed");
                return Reply::temporary_failure();
            }
        }

        self.session.add_recipient(recipient)
    }

    async fn auth<S>(&mut self, conn: &mut BufReader<S>, args: &str) -> Result<Reply>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(reply) = self.session.check_auth() {
            return Ok(reply);
        }

        let mut parts = args.split_whitespace();
        let mechanism = parts.next().unwrap_or_default().to_ascii_uppercase();
        let initial = parts.next().map(str::to_string);

        let credentials = match mechanism.as_str() {
            "PLAIN" => {
                let response = match self.challenge(conn, initial, "").await? {
                    Ok(response) => response,
                    Err(reply) => return Ok(reply),
                };
                Credentials::from_plain(&response)
            }
            "LOGIN" => {
                let username = match self.challenge(conn, initial, &login_challenge_username()).await? {
                    Ok(username) => username,
                    Err(reply) => return Ok(reply),
                };
                let password = match self.challenge(conn, None, &login_challenge_password()).await? {
                    Ok(password) => password,
                    Err(reply) => return Ok(reply),
                };
                Credentials::from_login(&username, &password)
            }
            _ => return Ok(Reply::new(504, "5.5.4 Unrecognized authentication mechanism")),
        };

        let Some(credentials) = credentials else {
            warn!(peer = %self.peer, "AUTH: undecodable response");
            return Ok(Reply::invalid_credentials());
        };

        match self.ctx.authenticator.authenticate(&credentials).await {
            Ok(Some(mailbox)) => {
                let address = EmailAddress::new(mailbox.mailbox.address.clone(), mailbox.domain_name.clone());
                info!(peer = %self.peer, %address, "SMTP authentication succeeded");
                Ok(self.session.authenticated(Identity {
                    address,
                    mailbox_id: mailbox.mailbox.id,
                }))
            }
            Ok(None) => {
                warn!(peer = %self.peer, username = %credentials.username, "SMTP authentication failed");
                Ok(Reply::invalid_credentials())
            }
            Err(e) => {
                error!(peer = %self.peer, error = %e, "SMTP authentication lookup failed");
                Ok(Reply::new(454, "4.7.0 Temporary authentication failure"))
            }
        }
    }

    /// Use the initial response if present, otherwise send a 334 challenge
    /// and read one line. The inner `Err` is the reply that ends the AUTH
    /// exchange: a `*` cancellation or an unreadable line.
    async fn challenge<S>(
        &self,
        conn: &mut BufReader<S>,
        initial: Option<String>,
        prompt: &str,
    ) -> Result<std::result::Result<String, Reply>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let response = match initial {
            Some(response) => response,
            None => {
                self.send(conn, &Reply::new(334, prompt)).await?;
                match self.read_line(conn).await? {
                    Input::Line(line) => line,
                    Input::Malformed(reply) => return Ok(Err(reply)),
                    Input::Closed => return Err(anyhow!("connection closed during AUTH")),
                }
            }
        };
        if response.trim() == "*" {
            return Ok(Err(Reply::new(501, "5.0.0 Authentication cancelled")));
        }
        Ok(Ok(response))
    }

    async fn data<S>(&mut self, conn: &mut BufReader<S>) -> Result<Reply>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let envelope = match self.session.begin_data() {
            Ok(envelope) => envelope,
            Err(reply) => return Ok(reply),
        };

        self.send(conn, &Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>"))
            .await?;

        let config = self.session.config();
        let timeout = Duration::from_secs(config.command_timeout_secs.max(1));
        match read_data(conn, config.max_message_size, timeout).await? {
            DataRead::Complete(raw) => Ok(self.deliver(&envelope, &raw).await),
            DataRead::TooLarge => {
                warn!(peer = %self.peer, limit = config.max_message_size, "Message exceeds size limit");
                Ok(Reply::new(552, "5.3.4 Message size exceeds fixed maximum message size"))
            }
        }
    }

    async fn deliver(&self, envelope: &Envelope, raw: &[u8]) -> Reply {
        let parsed = ParsedMessage::parse(raw);

        let sender_domain = envelope
            .from
            .as_ref()
            .map(|a| a.domain.clone())
            .or_else(|| parsed.from_domain());
        let Some(sender_domain) = sender_domain else {
            warn!(peer = %self.peer, "No sender domain in envelope or headers");
            return Reply::new(550, "5.7.1 Sender domain could not be determined");
        };

        let check = match self.ctx.validator.verify(&sender_domain).await {
            Ok(check) => check,
            Err(e) => {
                error!(peer = %self.peer, domain = %sender_domain, error = %e, "DKIM check failed to run");
                return Reply::temporary_failure();
            }
        };
        if !check.passed() {
            warn!(
                peer = %self.peer,
                domain = %sender_domain,
                outcome = ?check.outcome,
                "Rejecting message: DKIM validation failed"
            );
            return Reply::new(550, format!("5.7.1 DKIM validation failed for {}", sender_domain));
        }

        let mut stored = 0usize;
        for recipient in &envelope.to {
            match self
                .ctx
                .router
                .route(envelope.from.as_ref(), recipient, &parsed, Some(true))
                .await
            {
                Ok(RouteOutcome::StoredLocal { .. }) => stored += 1,
                Ok(RouteOutcome::AcceptedUnroutable) => {}
                Err(e) => {
                    error!(peer = %self.peer, %recipient, error = %e, "Delivery to recipient failed");
                }
            }
        }

        info!(
            peer = %self.peer,
            domain = %sender_domain,
            recipients = envelope.to.len(),
            stored,
            size = raw.len(),
            "Message accepted"
        );
        Reply::new(250, "2.0.0 OK: message accepted")
    }

    /// `Closed` on EOF or after an idle timeout (a 421 is sent first)
    async fn read_line<S>(&self, conn: &mut BufReader<S>) -> Result<Input>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let timeout = Duration::from_secs(self.session.config().command_timeout_secs.max(1));
        match tokio::time::timeout(timeout, read_bounded_line(conn, MAX_COMMAND_LINE)).await {
            Ok(Ok(LineRead::Eof)) => Ok(Input::Closed),
            Ok(Ok(LineRead::TooLong)) => {
                warn!(peer = %self.peer, "Command line too long");
                Ok(Input::Malformed(Reply::new(500, "5.5.2 Line too long")))
            }
            Ok(Ok(LineRead::Line(bytes))) => match String::from_utf8(bytes) {
                Ok(line) => Ok(Input::Line(line.trim_end_matches(['\r', '\n']).to_string())),
                Err(_) => {
                    warn!(peer = %self.peer, "Command line is not valid UTF-8");
                    Ok(Input::Malformed(Reply::new(500, "5.5.2 Syntax error, invalid characters")))
                }
            },
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                info!(peer = %self.peer, "Idle timeout");
                let reply = Reply::new(
                    421,
                    format!("4.4.2 {} Timeout, closing connection", self.session.config().hostname),
                );
                self.send(conn, &reply).await?;
                Ok(Input::Closed)
            }
        }
    }

    async fn send<S>(&self, conn: &mut BufReader<S>, reply: &Reply) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let rendered = reply.to_string();
        let stream = conn.get_mut();
        stream.write_all(rendered.as_bytes()).await?;
        stream.flush().await?;
        debug!(peer = %self.peer, reply = %rendered.trim_end(), "SMTP reply");
        Ok(())
    }
}

/// Read message content up to the terminating `.` line, undoing
/// dot-stuffing. An oversized message is drained and discarded.
async fn read_data<R>(reader: &mut R, max_size: usize, timeout: Duration) -> Result<DataRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut data = Vec::new();
    let mut too_large = false;

    loop {
        // Room for the remaining budget plus a stuffed dot, and always for
        // the terminator line
        let limit = if too_large {
            3
        } else {
            (max_size - data.len()).saturating_add(1).max(3)
        };
        let read = tokio::time::timeout(timeout, read_bounded_line(reader, limit))
            .await
            .map_err(|_| anyhow!("timed out during DATA"))??;
        let line = match read {
            LineRead::Eof => return Err(anyhow!("connection closed during DATA")),
            LineRead::TooLong => {
                too_large = true;
                data = Vec::new();
                continue;
            }
            LineRead::Line(line) => line,
        };

        if line == b".\r\n" || line == b".\n" {
            break;
        }
        if too_large {
            continue;
        }

        let content = line.strip_prefix(b".").unwrap_or(&line);
        if data.len() + content.len() > max_size {
            too_large = true;
            data = Vec::new();
            continue;
        }
        data.extend_from_slice(content);
    }

    Ok(if too_large {
        DataRead::TooLarge
    } else {
        DataRead::Complete(data)
    })
}

/// Read through the next `\n`, buffering at most `limit` bytes. A longer
/// line is still consumed so the stream stays aligned on line boundaries.
async fn read_bounded_line<R>(reader: &mut R, limit: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut overflow = false;

    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(match (overflow, line.is_empty()) {
                    (true, _) => LineRead::TooLong,
                    (false, true) => LineRead::Eof,
                    (false, false) => LineRead::Line(line),
                });
            }

            let (used, done) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            if !overflow {
                if line.len() + used > limit {
                    overflow = true;
                    line = Vec::new();
                } else {
                    line.extend_from_slice(&available[..used]);
                }
            }
            (used, done)
        };
        reader.consume(used);

        if done {
            return Ok(if overflow { LineRead::TooLong } else { LineRead::Line(line) });
        }
    }
}

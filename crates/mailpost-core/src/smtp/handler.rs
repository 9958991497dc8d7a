//! SMTP session handler
//!
//! Speaks just enough SMTP to receive messages and turns each accepted
//! `DATA` transfer into orchestrator events: session start, data chunks and
//! data completion.

use crate::pipeline::{Orchestrator, Session, SessionMeta};
use anyhow::{anyhow, Result};
use mailpost_common::config::SmtpConfig;
use mailpost_common::types::EmailAddress;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    BufWriter,
};
use tracing::{debug, info, warn};

/// Longest command line accepted outside of DATA
const MAX_COMMAND_LINE: usize = 4096;

/// Largest single read while receiving message data
const DATA_CHUNK: usize = 64 * 1024;

const IDLE_TIMEOUT_REPLY: &str = "4.4.2 Idle timeout, closing connection";

/// SMTP session state
#[derive(Debug, Clone, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

/// Envelope of the transaction in progress
#[derive(Debug, Default)]
struct Transaction {
    /// `Some(None)` is the null sender
    from: Option<Option<EmailAddress>>,
    to: Vec<EmailAddress>,
}

/// Result of reading one command line
enum CommandRead {
    Line,
    TooLong,
    Closed,
}

/// How a DATA transfer ended
enum DataEnd {
    Complete,
    TooLarge,
}

/// SMTP session handler
pub struct SmtpHandler {
    config: SmtpConfig,
    orchestrator: Arc<Orchestrator>,
    peer_addr: SocketAddr,
    remote_host: String,
}

impl SmtpHandler {
    /// Create a new handler
    pub fn new(
        config: SmtpConfig,
        orchestrator: Arc<Orchestrator>,
        peer_addr: SocketAddr,
        remote_host: String,
    ) -> Self {
        Self {
            config,
            orchestrator,
            peer_addr,
            remote_host,
        }
    }

    /// Handle an SMTP session
    pub async fn handle<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let mut state = SessionState::Connected;
        let mut transaction = Transaction::default();
        let mut helo: Option<String> = None;

        self.send_response(&mut writer, 220, &format!("{} ESMTP mailpost", self.config.hostname))
            .await?;

        let mut buffer = Vec::new();

        loop {
            match self.read_command(&mut reader, &mut buffer).await {
                Ok(CommandRead::Line) => {}
                Ok(CommandRead::TooLong) => {
                    self.send_response(&mut writer, 500, "5.5.2 Line too long")
                        .await?;
                    continue;
                }
                Ok(CommandRead::Closed) => {
                    debug!("Client {} disconnected", self.peer_addr);
                    break;
                }
                Err(e) => {
                    if e.kind() == ErrorKind::TimedOut {
                        let _ = self
                            .send_response(&mut writer, 421, IDLE_TIMEOUT_REPLY)
                            .await;
                    }
                    return Err(e.into());
                }
            }

            let line = String::from_utf8_lossy(&buffer);
            let line = line.trim();
            debug!("SMTP from {}: {}", self.peer_addr, line);

            let (command, args) = parse_command(line);

            match command.to_uppercase().as_str() {
                "HELO" => {
                    helo = Some(args.to_string());
                    transaction = Transaction::default();
                    state = SessionState::Greeted;
                    self.send_response(&mut writer, 250, &format!("Hello {}", args))
                        .await?;
                }

                "EHLO" => {
                    helo = Some(args.to_string());
                    transaction = Transaction::default();
                    state = SessionState::Greeted;

                    let responses = [
                        format!("{} Hello {}", self.config.hostname, args),
                        format!("SIZE {}", self.config.max_message_size),
                        "8BITMIME".to_string(),
                        "PIPELINING".to_string(),
                        "ENHANCEDSTATUSCODES".to_string(),
                    ];

                    for (i, resp) in responses.iter().enumerate() {
                        if i == responses.len() - 1 {
                            self.send_response(&mut writer, 250, resp).await?;
                        } else {
                            self.send_response_continue(&mut writer, 250, resp).await?;
                        }
                    }
                }

                "MAIL" => {
                    if state != SessionState::Greeted {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if let Some(from_addr) = parse_mail_from(args) {
                        transaction.from = Some(from_addr);
                        state = SessionState::MailFrom;
                        self.send_response(&mut writer, 250, "2.1.0 OK").await?;
                    } else {
                        self.send_response(&mut writer, 501, "5.1.7 Bad sender address syntax")
                            .await?;
                    }
                }

                "RCPT" => {
                    if state != SessionState::MailFrom && state != SessionState::RcptTo {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if let Some(to_addr) = parse_rcpt_to(args) {
                        transaction.to.push(to_addr);
                        state = SessionState::RcptTo;
                        self.send_response(&mut writer, 250, "2.1.5 OK").await?;
                    } else {
                        self.send_response(&mut writer, 501, "5.1.3 Bad recipient address syntax")
                            .await?;
                    }
                }

                "DATA" => {
                    if state != SessionState::RcptTo || transaction.to.is_empty() {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    let meta = SessionMeta {
                        remote_addr: self.peer_addr,
                        remote_host: self.remote_host.clone(),
                        helo: helo.clone(),
                        envelope_from: transaction.from.take().flatten(),
                        envelope_to: std::mem::take(&mut transaction.to),
                    };
                    let mut session = self.orchestrator.start_session(meta).await;

                    self.send_response(&mut writer, 354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    match self.receive_data(&mut reader, &mut session).await {
                        Ok(DataEnd::Complete) => {
                            // The pipeline runs detached; the client is answered now
                            let accepted = self.orchestrator.complete(session);
                            info!(
                                staging_id = %accepted.ack.staging_id,
                                peer = %self.peer_addr,
                                "Message accepted"
                            );
                            self.send_response(&mut writer, 250, &accepted.ack.reply())
                                .await?;
                        }
                        Ok(DataEnd::TooLarge) => {
                            self.orchestrator.abort(session).await;
                            self.send_response(
                                &mut writer,
                                552,
                                "5.3.4 Message size exceeds fixed maximum message size",
                            )
                            .await?;
                        }
                        Err(e) => {
                            self.orchestrator.abort(session).await;
                            if is_timeout(&e) {
                                let _ = self
                                    .send_response(&mut writer, 421, IDLE_TIMEOUT_REPLY)
                                    .await;
                            }
                            return Err(e);
                        }
                    }

                    state = SessionState::Greeted;
                }

                "RSET" => {
                    transaction = Transaction::default();
                    if state != SessionState::Connected {
                        state = SessionState::Greeted;
                    }
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "NOOP" => {
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "QUIT" => {
                    self.send_response(&mut writer, 221, "2.0.0 Bye").await?;
                    break;
                }

                "VRFY" => {
                    self.send_response(&mut writer, 252, "2.5.2 Cannot VRFY user")
                        .await?;
                }

                _ => {
                    self.send_response(&mut writer, 500, "5.5.2 Command not recognized")
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Read up to `limit` bytes through the next newline, bounded by the
    /// idle timeout
    async fn read_line<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
        buffer: &mut Vec<u8>,
        limit: usize,
    ) -> std::io::Result<usize> {
        let timeout = Duration::from_secs(self.config.connection_timeout_secs);
        let mut limited = (&mut *reader).take(limit as u64);

        match tokio::time::timeout(timeout, limited.read_until(b'\n', buffer)).await {
            Ok(read) => read,
            Err(_) => Err(std::io::Error::new(
                ErrorKind::TimedOut,
                format!("idle for {}s", timeout.as_secs()),
            )),
        }
    }

    /// Read one command line into `buffer`. An overlong line is drained
    /// without being kept.
    async fn read_command<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
        buffer: &mut Vec<u8>,
    ) -> std::io::Result<CommandRead> {
        buffer.clear();
        if self.read_line(reader, buffer, MAX_COMMAND_LINE + 1).await? == 0 {
            return Ok(CommandRead::Closed);
        }

        if buffer.len() <= MAX_COMMAND_LINE || buffer.ends_with(b"\n") {
            return Ok(CommandRead::Line);
        }

        loop {
            buffer.clear();
            let bytes_read = self.read_line(reader, buffer, MAX_COMMAND_LINE + 1).await?;
            if bytes_read == 0 || buffer.ends_with(b"\n") {
                break;
            }
        }
        buffer.clear();

        Ok(CommandRead::TooLong)
    }

    /// Stream message data into the session until <CRLF>.<CRLF>.
    ///
    /// Lines longer than [`DATA_CHUNK`] arrive in several pieces; only a
    /// piece that starts a line is checked for the terminator and dot-stuffing.
    async fn receive_data<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
        session: &mut Session,
    ) -> Result<DataEnd> {
        let max_size = self.config.max_message_size as u64;
        let mut too_large = false;
        let mut at_line_start = true;
        let mut piece = Vec::new();

        loop {
            piece.clear();
            let bytes_read = self.read_line(reader, &mut piece, DATA_CHUNK).await?;

            if bytes_read == 0 {
                return Err(anyhow!("Connection closed during DATA"));
            }

            let line_start = at_line_start;
            at_line_start = piece.ends_with(b"\n");

            if line_start && (piece == b".\r\n" || piece == b".\n") {
                break;
            }

            // Dot-stuffing: remove the leading dot
            let chunk = if line_start && piece.starts_with(b".") {
                &piece[1..]
            } else {
                &piece[..]
            };

            if too_large {
                continue;
            }

            if session.received() + chunk.len() as u64 > max_size {
                warn!(
                    staging_id = %session.id(),
                    peer = %self.peer_addr,
                    "Message exceeds {} bytes",
                    max_size
                );
                too_large = true;
                continue;
            }

            session.append(chunk).await;
        }

        if too_large {
            Ok(DataEnd::TooLarge)
        } else {
            Ok(DataEnd::Complete)
        }
    }

    /// Send an SMTP response
    async fn send_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{} {}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer_addr, response.trim());
        Ok(())
    }

    /// Send a multi-line response (intermediate line)
    async fn send_response_continue<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{}-{}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        debug!("SMTP to {}: {}", self.peer_addr, response.trim());
        Ok(())
    }
}

fn is_timeout(e: &anyhow::Error) -> bool {
    e.downcast_ref::<std::io::Error>()
        .map_or(false, |e| e.kind() == ErrorKind::TimedOut)
}

/// Parse an SMTP command line into command and arguments
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    }
}

/// Extract the address from `<address>` or a bare address
fn extract_path(addr_part: &str) -> Option<&str> {
    let addr_part = addr_part.trim();
    if addr_part.starts_with('<') {
        let end = addr_part.find('>')?;
        Some(&addr_part[1..end])
    } else {
        addr_part.split_whitespace().next()
    }
}

/// Parse MAIL FROM:<address> or MAIL FROM: <address>
fn parse_mail_from(args: &str) -> Option<Option<EmailAddress>> {
    let args = args.trim();

    if !args.get(..5)?.eq_ignore_ascii_case("FROM:") {
        return None;
    }

    let email = extract_path(&args[5..])?;

    if email.is_empty() {
        Some(None)
    } else {
        Some(Some(EmailAddress::parse(email)?))
    }
}

/// Parse RCPT TO:<address>
fn parse_rcpt_to(args: &str) -> Option<EmailAddress> {
    let args = args.trim();

    if !args.get(..3)?.eq_ignore_ascii_case("TO:") {
        return None;
    }

    EmailAddress::parse(extract_path(&args[3..])?)
}

//! One NNTP probe session
//!
//! A session owns a single plain or TLS byte stream and the state machine
//! that drives it through greeting, `AUTHINFO`, `GROUP` and `STAT`. Replies
//! are consumed in 4 KiB chunks; only the first three bytes of a reply line
//! are interpreted as the status code. `STAT` is the only article command —
//! its reply is a single line, so no framing across packets is needed
//! (`HEAD` would require multi-line handling and is deliberately absent).
//!
//! The transition table is pure and lives in [`transition`]; the session
//! itself only does I/O, so the pool can drive any number of sessions
//! cooperatively.

use crate::error::{CompletionError, Result};
use crate::providers::Provider;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, trace};

/// Reply read buffer size; STAT replies are one short line
const REPLY_CHUNK: usize = 4096;

/// Pseudo-code synthesised by the pool for a stalled session
pub const STALLED_REPLY_CODE: u16 = 999;

/// Session lifecycle, named by what the session is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, greeting not yet received
    Dialing,
    /// `AUTHINFO USER` sent, waiting for 381
    AuthUser,
    /// `AUTHINFO PASS` sent, waiting for 281
    AuthPass,
    /// `GROUP` sent, waiting for 211
    GroupSet,
    /// `STAT` outstanding (or about to be issued)
    AwaitingStatus,
    /// `QUIT` sent, waiting for 205
    Closing,
    /// Connection is unusable
    Dead,
}

/// What the driver must do after a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyEvent {
    /// Issue the pending `STAT` (after greeting, 281 or 211)
    SendStat,
    /// Server wants authentication: send `AUTHINFO USER`
    SendAuthUser,
    /// Send `AUTHINFO PASS`
    SendAuthPass,
    /// No group selected: send `GROUP`
    SendGroup,
    /// The pending article exists on this server
    Present,
    /// The pending article is missing on this server
    Missing,
    /// Account or server error; the session is dead
    Fatal,
    /// Server said goodbye (205)
    Closed,
    /// Reply carries no action in this state
    Ignore,
}

/// The reply/state transition table
///
/// `code` is `None` for an unparseable reply, which counts as a missing
/// article while a `STAT` is outstanding.
pub fn transition(state: SessionState, code: Option<u16>) -> (SessionState, ReplyEvent) {
    use ReplyEvent::*;
    use SessionState::*;

    let Some(code) = code else {
        return match state {
            AwaitingStatus => (AwaitingStatus, Missing),
            _ => (state, Ignore),
        };
    };

    match (state, code) {
        (Dialing, 200 | 201) => (AwaitingStatus, SendStat),
        (_, 480) => (AuthUser, SendAuthUser),
        (AuthUser, 381) => (AuthPass, SendAuthPass),
        (AuthPass, 281) => (AwaitingStatus, SendStat),
        (AwaitingStatus, 412) => (GroupSet, SendGroup),
        (GroupSet, 211) => (AwaitingStatus, SendStat),
        (AwaitingStatus, 223 | 221) => (AwaitingStatus, Present),
        (AwaitingStatus, 411 | 420 | 423 | 430) => (AwaitingStatus, Missing),
        (AwaitingStatus, STALLED_REPLY_CODE) => (AwaitingStatus, Missing),
        (_, 205) => (Dead, Closed),
        (_, c) if (480..490).contains(&c) || (500..510).contains(&c) => (Dead, Fatal),
        _ => (state, Ignore),
    }
}

/// Extract the status code from the first three bytes of a reply
pub fn parse_code(reply: &str) -> Option<u16> {
    let bytes = reply.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    reply[..3].parse().ok()
}

/// Message-ID echoed in a 223/221 reply (`223 0 <id> ...`), brackets removed
pub fn reply_message_id(reply: &str) -> Option<String> {
    let token = reply.split_whitespace().nth(2)?;
    Some(
        token
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string(),
    )
}

/// Build the `STAT` line for a message-ID without brackets
pub fn stat_cmd(message_id: &str) -> String {
    format!("STAT <{message_id}>\r\n")
}

/// Build the `GROUP` line
pub fn group_cmd(group: &str) -> String {
    format!("GROUP {group}\r\n")
}

/// Build `AUTHINFO USER`
pub fn authinfo_user_cmd(username: &str) -> String {
    format!("AUTHINFO USER {username}\r\n")
}

/// Build `AUTHINFO PASS`
pub fn authinfo_pass_cmd(password: &str) -> String {
    format!("AUTHINFO PASS {password}\r\n")
}

/// The `QUIT` line
pub fn quit_cmd() -> &'static str {
    "QUIT\r\n"
}

/// Build the TLS connector used for encrypted providers
///
/// Certificates validate against the Mozilla root store.
pub fn tls_connector() -> TlsConnector {
    use tokio_rustls::rustls::crypto::{CryptoProvider, ring};
    let _ = CryptoProvider::install_default(ring::default_provider());

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

enum ProbeStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// What one read attempt yielded
#[derive(Debug)]
pub enum ReadOutcome {
    /// A reply chunk arrived
    Reply(String),
    /// Nothing arrived within the slot
    Empty,
    /// The peer closed the connection
    Eof,
}

/// A single probe connection
pub struct ProbeSession {
    stream: ProbeStream,
    /// Current machine state
    pub state: SessionState,
    /// Socket index within the pool, used in trace lines
    pub ordinal: usize,
    /// Message-ID of the outstanding `STAT`, if any
    pub last_pending_id: Option<String>,
    /// Consecutive reads that yielded no bytes
    pub idle_reads: u32,
    host: String,
}

impl ProbeSession {
    /// Dial one connection to the provider
    ///
    /// IPv4 is preferred; IPv6 is used only when resolution yields nothing
    /// else. The TCP connect (and TLS handshake) run under `dial_timeout`.
    pub async fn dial(
        provider: &Provider,
        ordinal: usize,
        dial_timeout: Duration,
        connector: Option<&TlsConnector>,
    ) -> Result<Self> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((provider.host.as_str(), provider.port))
            .await?
            .collect();
        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                CompletionError::Other(format!("no address resolved for {}", provider.host))
            })?;
        debug!(
            "socket {ordinal}: connecting to {} ({addr})",
            provider.host
        );

        let tcp = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CompletionError::Timeout)??;
        tcp.set_nodelay(true)?;

        let stream = if provider.tls {
            let connector = connector
                .ok_or_else(|| CompletionError::Tls("TLS connector missing".to_string()))?;
            let server_name = ServerName::try_from(provider.host.clone())
                .map_err(|e| CompletionError::Tls(format!("Invalid domain: {e}")))?;
            let tls = timeout(dial_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| CompletionError::Timeout)?
                .map_err(|e| CompletionError::Tls(format!("TLS handshake failed: {e}")))?;
            ProbeStream::Tls(Box::new(tls))
        } else {
            ProbeStream::Plain(tcp)
        };

        Ok(Self {
            stream,
            state: SessionState::Dialing,
            ordinal,
            last_pending_id: None,
            idle_reads: 0,
            host: provider.host.clone(),
        })
    }

    /// Send one command line
    pub async fn send(&mut self, line: &str) -> Result<()> {
        trace!("socket {}: send {}", self.ordinal, line.trim_end());
        match &mut self.stream {
            ProbeStream::Plain(s) => {
                s.write_all(line.as_bytes()).await?;
                s.flush().await?;
            }
            ProbeStream::Tls(s) => {
                s.write_all(line.as_bytes()).await?;
                s.flush().await?;
            }
        }
        Ok(())
    }

    /// Read one reply chunk, waiting at most `slot`
    ///
    /// An elapsed slot is the cooperative equivalent of a non-blocking read
    /// that yields no bytes; the caller applies the slow-session policy.
    pub async fn read_chunk(&mut self, slot: Duration) -> Result<ReadOutcome> {
        let mut buf = [0u8; REPLY_CHUNK];
        let read = async {
            match &mut self.stream {
                ProbeStream::Plain(s) => s.read(&mut buf).await,
                ProbeStream::Tls(s) => s.read(&mut buf).await,
            }
        };
        let outcome = timeout(slot, read).await;
        match outcome {
            Err(_) => Ok(ReadOutcome::Empty),
            Ok(Ok(0)) => Ok(ReadOutcome::Eof),
            Ok(Ok(n)) => {
                self.idle_reads = 0;
                let reply = String::from_utf8_lossy(&buf[..n]).to_string();
                trace!("socket {}: recv {}", self.ordinal, reply.trim_end());
                Ok(ReadOutcome::Reply(reply))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Host name of the provider this session talks to
    pub fn host(&self) -> &str {
        &self.host
    }
}

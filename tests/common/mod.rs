//! Shared helpers: a scripted in-process NNTP server and config builders
#![allow(dead_code)]

pub mod fixtures;

use nzbget_completion::providers::Provider;
use nzbget_completion::{Config, NzbArticle, ProbeSet};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Behaviour script for the mock news server
#[derive(Clone, Default)]
pub struct MockNews {
    /// Message-IDs (without brackets) the server knows
    pub present: Arc<HashSet<String>>,
    /// Demand AUTHINFO before answering STAT
    pub require_auth: bool,
    /// Greet, then never answer anything
    pub silent_after_greeting: bool,
    /// Answer every STAT with this code instead of looking up the article
    pub fatal_code: Option<u16>,
}

impl MockNews {
    /// A server that knows the given articles
    pub fn with_present(ids: &[String]) -> Self {
        Self {
            present: Arc::new(ids.iter().cloned().collect()),
            ..Self::default()
        }
    }
}

/// Start the mock server on an ephemeral port
pub async fn spawn_mock_news(behaviour: MockNews) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(handle_conn(stream, behaviour.clone()));
        }
    });
    (addr, handle)
}

async fn handle_conn(stream: TcpStream, behaviour: MockNews) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    if write_half
        .write_all(b"200 mock news server ready\r\n")
        .await
        .is_err()
    {
        return;
    }

    if behaviour.silent_after_greeting {
        // swallow everything, including QUIT
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
        }
    }

    let mut authed = !behaviour.require_auth;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let command = line.trim_end();
        let reply = if let Some(id) = command.strip_prefix("STAT ") {
            if !authed {
                "480 authentication required\r\n".to_string()
            } else if let Some(code) = behaviour.fatal_code {
                format!("{code} go away\r\n")
            } else {
                let id = id.trim_start_matches('<').trim_end_matches('>');
                if behaviour.present.contains(id) {
                    format!("223 0 <{id}> article exists\r\n")
                } else {
                    "430 no such article\r\n".to_string()
                }
            }
        } else if command.starts_with("AUTHINFO USER") {
            "381 password required\r\n".to_string()
        } else if command.starts_with("AUTHINFO PASS") {
            authed = true;
            "281 authentication accepted\r\n".to_string()
        } else if command.starts_with("GROUP ") {
            "211 0 0 0 group selected\r\n".to_string()
        } else if command == "QUIT" {
            let _ = write_half.write_all(b"205 goodbye\r\n").await;
            return;
        } else {
            "500 command not recognized\r\n".to_string()
        };
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Provider record pointing at the mock server
pub fn provider_at(addr: SocketAddr, max_conns: usize) -> Provider {
    Provider {
        id: 1,
        level: 0,
        group_id: 0,
        host: addr.ip().to_string(),
        port: addr.port(),
        tls: false,
        username: "user".to_string(),
        password: "pass".to_string(),
        max_conns,
        retention_days: 0.0,
        is_fill: false,
        active: true,
    }
}

/// A probe set over plain message-IDs
pub fn sample_of(ids: &[String]) -> ProbeSet {
    ProbeSet::new(
        ids.iter()
            .map(|id| NzbArticle {
                subject: "\"release.part01.rar\" yEnc (1/1)".to_string(),
                is_par: false,
                groups: Arc::new(vec!["alt.binaries.test".to_string()]),
                message_id: id.clone(),
            })
            .collect(),
    )
}

/// Minimal config for tests, with overridable script options
pub fn test_config(extra: &[(&str, &str)]) -> Config {
    let mut env: HashMap<String, String> = HashMap::from([
        ("NZBOP_CONTROLIP".into(), "127.0.0.1".into()),
        ("NZBOP_CONTROLPORT".into(), "6789".into()),
        ("NZBOP_CONTROLUSERNAME".into(), "nzbget".into()),
        ("NZBOP_CONTROLPASSWORD".into(), "tegbzn6789".into()),
        ("NZBOP_TEMPDIR".into(), "/tmp".into()),
        ("NZBOP_NZBDIR".into(), "/tmp".into()),
    ]);
    for (key, value) in extra {
        env.insert((*key).into(), (*value).into());
    }
    Config::from_lookup(|key| env.get(key).cloned()).unwrap()
}

//! Host RPC adapter
//!
//! NZBGet exposes its control interface over two transports and this
//! extension uses both: XML-RPC (`/xmlrpc`) for control edits and small
//! status reads, and JSON-RPC (`/jsonrpc/<method>`) for the bulk reads
//! (`listgroups`, `history`) whose XML encoding would be prohibitively
//! large for queues with hundreds of releases. Both authenticate with HTTP
//! Basic.
//!
//! Any RPC failure propagates: an invocation must never commit a partial
//! decision against a host it cannot reliably talk to.

use crate::config::HostConfig;
use crate::error::{CompletionError, Result};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Cursor;
use tracing::debug;

/// A value in an XML-RPC response
#[derive(Debug, Clone, PartialEq)]
pub enum XmlRpcValue {
    /// `<i4>` / `<int>`
    Int(i64),
    /// `<boolean>`
    Bool(bool),
    /// `<string>` or bare text
    Str(String),
    /// `<double>`
    Double(f64),
    /// `<array>`
    Array(Vec<XmlRpcValue>),
    /// `<struct>`
    Struct(HashMap<String, XmlRpcValue>),
}

impl XmlRpcValue {
    /// Integer content, if this is an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            XmlRpcValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean content; XML-RPC encodes booleans as 0/1 integers too
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            XmlRpcValue::Bool(b) => Some(*b),
            XmlRpcValue::Int(n) => Some(*n != 0),
            _ => None,
        }
    }

    /// String content
    pub fn as_str(&self) -> Option<&str> {
        match self {
            XmlRpcValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Struct member by name
    pub fn get(&self, key: &str) -> Option<&XmlRpcValue> {
        match self {
            XmlRpcValue::Struct(map) => map.get(key),
            _ => None,
        }
    }

    /// Array items (empty for non-arrays)
    pub fn items(&self) -> &[XmlRpcValue] {
        match self {
            XmlRpcValue::Array(items) => items,
            _ => &[],
        }
    }
}

/// A parameter of an XML-RPC call
#[derive(Debug, Clone)]
pub enum XmlRpcParam {
    /// `<i4>`
    Int(i64),
    /// `<string>`
    Str(String),
    /// `<array>` of `<i4>`
    IntArray(Vec<i64>),
}

/// Serialise a `methodCall` document
pub fn build_method_call(method: &str, params: &[XmlRpcParam]) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Start(BytesStart::new("methodCall")))
        .unwrap();
    writer
        .write_event(Event::Start(BytesStart::new("methodName")))
        .unwrap();
    writer
        .write_event(Event::Text(BytesText::new(method)))
        .unwrap();
    writer
        .write_event(Event::End(BytesEnd::new("methodName")))
        .unwrap();
    writer
        .write_event(Event::Start(BytesStart::new("params")))
        .unwrap();
    for param in params {
        writer
            .write_event(Event::Start(BytesStart::new("param")))
            .unwrap();
        write_param(&mut writer, param);
        writer
            .write_event(Event::End(BytesEnd::new("param")))
            .unwrap();
    }
    writer
        .write_event(Event::End(BytesEnd::new("params")))
        .unwrap();
    writer
        .write_event(Event::End(BytesEnd::new("methodCall")))
        .unwrap();

    let body = String::from_utf8(writer.into_inner().into_inner()).unwrap();
    format!("<?xml version=\"1.0\"?>{body}")
}

fn write_param(writer: &mut Writer<Cursor<Vec<u8>>>, param: &XmlRpcParam) {
    let scalar = |writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str| {
        writer
            .write_event(Event::Start(BytesStart::new("value")))
            .unwrap();
        writer
            .write_event(Event::Start(BytesStart::new(tag)))
            .unwrap();
        writer.write_event(Event::Text(BytesText::new(text))).unwrap();
        writer.write_event(Event::End(BytesEnd::new(tag))).unwrap();
        writer
            .write_event(Event::End(BytesEnd::new("value")))
            .unwrap();
    };
    match param {
        XmlRpcParam::Int(n) => scalar(writer, "i4", &n.to_string()),
        XmlRpcParam::Str(s) => scalar(writer, "string", s),
        XmlRpcParam::IntArray(items) => {
            writer
                .write_event(Event::Start(BytesStart::new("value")))
                .unwrap();
            writer
                .write_event(Event::Start(BytesStart::new("array")))
                .unwrap();
            writer
                .write_event(Event::Start(BytesStart::new("data")))
                .unwrap();
            for n in items {
                scalar(writer, "i4", &n.to_string());
            }
            writer
                .write_event(Event::End(BytesEnd::new("data")))
                .unwrap();
            writer
                .write_event(Event::End(BytesEnd::new("array")))
                .unwrap();
            writer
                .write_event(Event::End(BytesEnd::new("value")))
                .unwrap();
        }
    }
}

/// Parse a `methodResponse` document into its single result value
///
/// A `<fault>` response becomes [`CompletionError::Rpc`] carrying the fault
/// string.
pub fn parse_method_response(xml: &str) -> Result<XmlRpcValue> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_fault = false;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| CompletionError::Xml(e.to_string()))?
        {
            Event::Start(e) => match e.name().as_ref() {
                b"fault" => in_fault = true,
                b"value" => {
                    let value = parse_value(&mut reader)?;
                    if in_fault {
                        let message = value
                            .get("faultString")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown fault")
                            .to_string();
                        return Err(CompletionError::Rpc(message));
                    }
                    return Ok(value);
                }
                _ => {}
            },
            Event::Eof => {
                return Err(CompletionError::Xml("empty methodResponse".to_string()));
            }
            _ => {}
        }
        buf.clear();
    }
}

/// Parse the contents of a `<value>` element (reader is past its start tag)
fn parse_value(reader: &mut Reader<&[u8]>) -> Result<XmlRpcValue> {
    let mut buf = Vec::new();
    let mut bare_text = String::new();
    let mut value: Option<XmlRpcValue> = None;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| CompletionError::Xml(e.to_string()))?
        {
            Event::Start(e) => match e.name().as_ref() {
                b"i4" | b"int" => {
                    let text = read_scalar_text(reader, "int")?;
                    value = Some(XmlRpcValue::Int(text.trim().parse().map_err(|_| {
                        CompletionError::Xml(format!("bad integer: {text}"))
                    })?));
                }
                b"boolean" => {
                    let text = read_scalar_text(reader, "boolean")?;
                    value = Some(XmlRpcValue::Bool(text.trim() == "1"));
                }
                b"string" => {
                    let text = read_scalar_text(reader, "string")?;
                    value = Some(XmlRpcValue::Str(text));
                }
                b"double" => {
                    let text = read_scalar_text(reader, "double")?;
                    value = Some(XmlRpcValue::Double(text.trim().parse().map_err(|_| {
                        CompletionError::Xml(format!("bad double: {text}"))
                    })?));
                }
                b"array" => value = Some(parse_array(reader)?),
                b"struct" => value = Some(parse_struct(reader)?),
                _ => {}
            },
            Event::Text(t) => {
                bare_text.push_str(&t.unescape().unwrap_or_default());
            }
            Event::End(e) if e.name().as_ref() == b"value" => {
                // a value without a type tag is a string
                return Ok(value.unwrap_or(XmlRpcValue::Str(bare_text.trim().to_string())));
            }
            Event::Eof => return Err(CompletionError::Xml("unterminated value".to_string())),
            _ => {}
        }
        buf.clear();
    }
}

fn parse_array(reader: &mut Reader<&[u8]>) -> Result<XmlRpcValue> {
    let mut buf = Vec::new();
    let mut items = Vec::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| CompletionError::Xml(e.to_string()))?
        {
            Event::Start(e) if e.name().as_ref() == b"value" => {
                items.push(parse_value(reader)?);
            }
            Event::End(e) if e.name().as_ref() == b"array" => {
                return Ok(XmlRpcValue::Array(items));
            }
            Event::Eof => return Err(CompletionError::Xml("unterminated array".to_string())),
            _ => {}
        }
        buf.clear();
    }
}

fn parse_struct(reader: &mut Reader<&[u8]>) -> Result<XmlRpcValue> {
    let mut buf = Vec::new();
    let mut map = HashMap::new();
    let mut name = String::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| CompletionError::Xml(e.to_string()))?
        {
            Event::Start(e) => match e.name().as_ref() {
                b"name" => name = read_scalar_text(reader, "name")?,
                b"value" => {
                    let value = parse_value(reader)?;
                    map.insert(std::mem::take(&mut name), value);
                }
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"struct" => {
                return Ok(XmlRpcValue::Struct(map));
            }
            Event::Eof => return Err(CompletionError::Xml("unterminated struct".to_string())),
            _ => {}
        }
        buf.clear();
    }
}

/// Collect text until the end tag of the scalar element just opened
fn read_scalar_text(reader: &mut Reader<&[u8]>, what: &str) -> Result<String> {
    let mut buf = Vec::new();
    let mut text = String::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| CompletionError::Xml(e.to_string()))?
        {
            Event::Text(t) => text.push_str(&t.unescape().unwrap_or_default()),
            Event::End(_) => return Ok(text),
            Event::Eof => {
                return Err(CompletionError::Xml(format!("unterminated {what}")));
            }
            _ => {}
        }
        buf.clear();
    }
}

/// One `Name`/`Value` pair on a queue or history entry
#[derive(Debug, Clone, Deserialize)]
pub struct Parameter {
    /// Parameter name
    #[serde(rename = "Name")]
    pub name: String,
    /// Parameter value
    #[serde(rename = "Value")]
    pub value: String,
}

/// A queue or history entry from `listgroups` / `history`
#[derive(Debug, Clone, Deserialize)]
pub struct QueueEntry {
    /// Host-side NZB ID
    #[serde(rename = "NZBID")]
    pub nzb_id: i64,
    /// Display name
    #[serde(rename = "NZBName", default)]
    pub name: String,
    /// Entry status (`PAUSED`, `DOWNLOADING`, `DELETED/DUPE`, ...)
    #[serde(rename = "Status", default)]
    pub status: String,
    /// Timestamp of the newest article post
    #[serde(rename = "MaxPostTime", default)]
    pub max_post_time: i64,
    /// Priority of the most important file
    #[serde(rename = "MaxPriority", default)]
    pub max_priority: i64,
    /// Minimum health before the host considers the download doomed
    #[serde(rename = "CriticalHealth", default)]
    pub critical_health: i64,
    /// Duplicate grouping key; empty when not feed-sourced
    #[serde(rename = "DupeKey", default)]
    pub dupe_key: String,
    /// Duplicate ranking score
    #[serde(rename = "DupeScore", default)]
    pub dupe_score: i64,
    /// Post-queue parameters attached to the entry
    #[serde(rename = "Parameters", default)]
    pub parameters: Vec<Parameter>,
}

impl QueueEntry {
    /// Look up a parameter value by name
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

/// One file inside a queued release, from `listfiles`
#[derive(Debug, Clone)]
pub struct QueuedFile {
    /// Host-side file ID
    pub id: i64,
    /// File name
    pub filename: String,
    /// Low 32 bits of the file size
    pub file_size_lo: u32,
    /// High 32 bits of the file size
    pub file_size_hi: u32,
}

impl QueuedFile {
    /// Full 64-bit file size
    pub fn size(&self) -> u64 {
        (u64::from(self.file_size_hi) << 32) | u64::from(self.file_size_lo)
    }

    /// Whether the file is par2 parity
    pub fn is_par2(&self) -> bool {
        self.filename.to_ascii_lowercase().contains(".par2")
    }
}

/// Host status snapshot from the `status` RPC
#[derive(Debug, Clone)]
pub struct HostStatus {
    /// Host wall-clock time
    pub server_time: i64,
    /// Seconds since the host started
    pub up_time_sec: i64,
    /// Whether downloading is paused on the host
    pub download_paused: bool,
    /// Current download rate in bytes per second
    pub download_rate: i64,
    /// IDs of the configured news servers
    pub news_server_ids: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct JsonEnvelope<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

/// HTTP client for the host control interface
pub struct HostClient {
    http: reqwest::Client,
    xmlrpc_url: String,
    jsonrpc_url: String,
    username: String,
    password: String,
}

impl HostClient {
    /// Build a client for the configured control interface
    pub fn new(host: &HostConfig) -> Result<Self> {
        let base = format!("http://{}:{}", host.ip, host.port);
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            xmlrpc_url: format!("{base}/xmlrpc"),
            jsonrpc_url: format!("{base}/jsonrpc"),
            username: host.username.clone(),
            password: host.password.clone(),
        })
    }

    /// Build a client against an explicit base URL (tests)
    pub fn with_base_url(base: &str, username: &str, password: &str) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            xmlrpc_url: format!("{base}/xmlrpc"),
            jsonrpc_url: format!("{base}/jsonrpc"),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    async fn call(&self, method: &str, params: &[XmlRpcParam]) -> Result<XmlRpcValue> {
        debug!("xmlrpc call {method}");
        let body = build_method_call(method, params);
        let response = self
            .http
            .post(&self.xmlrpc_url)
            .basic_auth(&self.username, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CompletionError::Rpc(format!(
                "{method} failed with HTTP {}",
                response.status()
            )));
        }
        let text = response.text().await?;
        parse_method_response(&text)
    }

    async fn call_json(&self, method: &str) -> Result<serde_json::Value> {
        debug!("jsonrpc call {method}");
        let response = self
            .http
            .get(format!("{}/{method}", self.jsonrpc_url))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CompletionError::Rpc(format!(
                "{method} failed with HTTP {}",
                response.status()
            )));
        }
        let envelope: JsonEnvelope<serde_json::Value> = response.json().await?;
        if let Some(error) = envelope.error {
            return Err(CompletionError::Rpc(format!("{method} fault: {error}")));
        }
        envelope
            .result
            .ok_or_else(|| CompletionError::Rpc(format!("{method} returned no result")))
    }

    /// Host status, including server time, pause state and news server IDs
    pub async fn status(&self) -> Result<HostStatus> {
        let value = self.call("status", &[]).await?;
        let int = |key: &str| -> Result<i64> {
            value
                .get(key)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| CompletionError::Xml(format!("status has no {key}")))
        };
        let news_server_ids = value
            .get("NewsServers")
            .map(|servers| {
                servers
                    .items()
                    .iter()
                    .filter_map(|s| s.get("ID").and_then(|v| v.as_i64()))
                    .map(|id| id as u32)
                    .collect()
            })
            .unwrap_or_default();
        Ok(HostStatus {
            server_time: int("ServerTime")?,
            up_time_sec: int("UpTimeSec")?,
            download_paused: value
                .get("DownloadPaused")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            download_rate: int("DownloadRate").unwrap_or(0),
            news_server_ids,
        })
    }

    /// All queue entries (JSON-RPC: the XML encoding is too heavy here)
    pub async fn list_groups(&self) -> Result<Vec<QueueEntry>> {
        let result = self.call_json("listgroups").await?;
        Ok(serde_json::from_value(result)?)
    }

    /// All history entries (JSON-RPC, same reasoning as `list_groups`)
    pub async fn history(&self) -> Result<Vec<QueueEntry>> {
        let result = self.call_json("history").await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Files of one queued release
    pub async fn list_files(&self, nzb_id: i64) -> Result<Vec<QueuedFile>> {
        let value = self
            .call(
                "listfiles",
                &[
                    XmlRpcParam::Int(0),
                    XmlRpcParam::Int(0),
                    XmlRpcParam::IntArray(vec![nzb_id]),
                ],
            )
            .await?;
        let mut files = Vec::new();
        for item in value.items() {
            files.push(QueuedFile {
                id: item.get("ID").and_then(|v| v.as_i64()).unwrap_or(0),
                filename: item
                    .get("Filename")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                file_size_lo: item.get("FileSizeLo").and_then(|v| v.as_i64()).unwrap_or(0)
                    as u32,
                file_size_hi: item.get("FileSizeHi").and_then(|v| v.as_i64()).unwrap_or(0)
                    as u32,
            });
        }
        Ok(files)
    }

    /// Apply one edit command to a set of queue or history entries
    pub async fn edit_queue(&self, command: &str, ids: &[i64]) -> Result<bool> {
        let value = self
            .call(
                "editqueue",
                &[
                    XmlRpcParam::Str(command.to_string()),
                    XmlRpcParam::Int(0),
                    XmlRpcParam::Str(String::new()),
                    XmlRpcParam::IntArray(ids.to_vec()),
                ],
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Pause downloading on the host
    pub async fn pause_download(&self) -> Result<bool> {
        let value = self.call("pausedownload", &[]).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Resume downloading on the host
    pub async fn resume_download(&self) -> Result<bool> {
        let value = self.call("resumedownload", &[]).await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAGIC_CHANNEL: &[u8; 4] = b"BRCH"; // Burrow channel-open
const MAGIC_REQUEST: &[u8; 4] = b"BRRQ"; // Burrow out-of-band request
const PROTOCOL_V1: u8 = 1;

const STATUS_ACCEPTED: u8 = 0;
const STATUS_REJECTED: u8 = 1;

pub const MAX_JSON_BYTES: u32 = 1 << 20; // 1 MiB
pub const MAX_DATAGRAM_BYTES: u32 = 1 << 20; // 1 MiB
pub const MAX_REASON_BYTES: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version")]
    BadVersion,
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("bad status byte: {0}")]
    BadStatus(u8),
    #[error("bad address: {0:?}")]
    BadAddress(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// The unit was fully consumed and the stream is still aligned.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::BadAddress(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Application {
    #[default]
    Generic,
    NamedPipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[default]
    Direct,
    Reverse,
}

/// Channel-open metadata sent as the header of a channel stream.
///
/// The dialing side connects to `rhost:rport`; `lhost:lport` describes the
/// originating end (for example the source address of an accepted connection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnInfo {
    pub id: String,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub application: Application,
    #[serde(default)]
    pub lhost: String,
    #[serde(default)]
    pub lport: u16,
    #[serde(default)]
    pub rhost: String,
    #[serde(default)]
    pub rport: u16,
    #[serde(default)]
    pub timeout_ms: u64,
}

/// A listener or port-forward definition.
///
/// The listening side binds `lhost:lport`, the dialing side connects to
/// `rhost:rport`. For direct forwards the console listens and the peer dials;
/// reverse forwards swap the roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Handler {
    pub id: String,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub application: Application,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub lhost: String,
    #[serde(default)]
    pub lport: u16,
    #[serde(default)]
    pub rhost: String,
    #[serde(default)]
    pub rport: u16,
}

impl Handler {
    /// Channel metadata for a connection the dialing side should open.
    pub fn dial_info(&self, timeout_ms: u64) -> ConnInfo {
        ConnInfo {
            id: self.id.clone(),
            transport: self.transport,
            application: self.application,
            lhost: self.lhost.clone(),
            lport: self.lport,
            rhost: self.rhost.clone(),
            rport: self.rport,
            timeout_ms,
        }
    }
}

/// Route definition carried by add-route requests.
///
/// `nodes` lists the intermediate peers that still have to relay towards the
/// gateway; each hop receives the list shortened by one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub id: String,
    pub network: String,
    #[serde(default)]
    pub nodes: Vec<u32>,
    pub gateway: u32,
}

/// Payload of remove-route messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRef {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PeerKind {
    #[default]
    Agent,
    Console,
}

/// Bootstrap message the remote end writes on the first stream it opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Hello {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: PeerKind,
    /// Interface networks in CIDR form, used for gateway selection.
    #[serde(default)]
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    Keepalive,
    Latency,
    HandlerStart { handler: Handler },
    HandlerStop { id: String },
    HandlerClosed { id: String },
    RouteAdd { route: RouteSpec },
    RouteRemove { id: String },
    PortfwdOpen { handler: Handler, session_id: u32 },
    PortfwdClose { id: String, #[serde(default)] close_conns: bool },
    /// Console request to route `network` through an agent.
    RouteCreate { network: String, #[serde(default)] gateway: Option<u32> },
    RouteDelete { id: String, #[serde(default)] close_conns: bool },
    /// Lists routes, or only the one `addr` resolves through.
    RouteList { #[serde(default)] addr: Option<String> },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Keepalive => "keepalive",
            Request::Latency => "latency",
            Request::HandlerStart { .. } => "handler-start",
            Request::HandlerStop { .. } => "handler-stop",
            Request::HandlerClosed { .. } => "handler-closed",
            Request::RouteAdd { .. } => "route-add",
            Request::RouteRemove { .. } => "route-remove",
            Request::PortfwdOpen { .. } => "portfwd-open",
            Request::PortfwdClose { .. } => "portfwd-close",
            Request::RouteCreate { .. } => "route-create",
            Request::RouteDelete { .. } => "route-delete",
            Request::RouteList { .. } => "route-list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn with_data(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            error: String::new(),
            data,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: msg.into(),
            data: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamHeader {
    Channel(ConnInfo),
    Request(Request),
}

pub async fn write_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    header: &StreamHeader,
) -> Result<(), ProtocolError> {
    match header {
        StreamHeader::Channel(info) => {
            w.write_all(MAGIC_CHANNEL).await?;
            w.write_u8(PROTOCOL_V1).await?;
            write_json(w, info).await?;
        }
        StreamHeader::Request(req) => {
            w.write_all(MAGIC_REQUEST).await?;
            w.write_u8(PROTOCOL_V1).await?;
            write_json(w, req).await?;
        }
    }
    w.flush().await?;
    Ok(())
}

pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<StreamHeader, ProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;

    let is_channel = if &magic == MAGIC_CHANNEL {
        true
    } else if &magic == MAGIC_REQUEST {
        false
    } else {
        return Err(ProtocolError::BadMagic);
    };

    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion);
    }

    if is_channel {
        Ok(StreamHeader::Channel(read_json(r).await?))
    } else {
        Ok(StreamHeader::Request(read_json(r).await?))
    }
}

/// Accept/reject answer to a channel-open header.
pub async fn write_status<W: AsyncWrite + Unpin>(
    w: &mut W,
    reject: Option<&str>,
) -> Result<(), ProtocolError> {
    match reject {
        None => w.write_u8(STATUS_ACCEPTED).await?,
        Some(reason) => {
            let b = reason.as_bytes();
            let b = &b[..b.len().min(MAX_REASON_BYTES as usize)];
            w.write_u8(STATUS_REJECTED).await?;
            w.write_u32(b.len() as u32).await?;
            w.write_all(b).await?;
        }
    }
    w.flush().await?;
    Ok(())
}

/// Reads a channel status; `Ok(Err(reason))` means the peer rejected the channel.
pub async fn read_status<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Result<(), String>, ProtocolError> {
    match r.read_u8().await? {
        STATUS_ACCEPTED => Ok(Ok(())),
        STATUS_REJECTED => {
            let n = r.read_u32().await?;
            if n > MAX_REASON_BYTES {
                return Err(ProtocolError::PayloadTooLarge(n));
            }
            let mut buf = vec![0u8; n as usize];
            r.read_exact(&mut buf).await?;
            Ok(Err(String::from_utf8_lossy(&buf).into_owned()))
        }
        other => Err(ProtocolError::BadStatus(other)),
    }
}

pub async fn write_reply<W: AsyncWrite + Unpin>(w: &mut W, reply: &Reply) -> Result<(), ProtocolError> {
    write_json(w, reply).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<Reply, ProtocolError> {
    read_json(r).await
}

pub async fn write_hello<W: AsyncWrite + Unpin>(w: &mut W, hello: &Hello) -> Result<(), ProtocolError> {
    write_json(w, hello).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<Hello, ProtocolError> {
    let mut hello: Hello = read_json(r).await?;
    hello.name = hello.name.trim().to_string();
    hello.interfaces = hello
        .interfaces
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    Ok(hello)
}

async fn write_json<W: AsyncWrite + Unpin, T: Serialize>(w: &mut W, v: &T) -> Result<(), ProtocolError> {
    let b = serde_json::to_vec(v)?;
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    w.write_u32(n).await?;
    w.write_all(&b).await?;
    Ok(())
}

async fn read_json<R: AsyncRead + Unpin, T: serde::de::DeserializeOwned>(
    r: &mut R,
) -> Result<T, ProtocolError> {
    let n = r.read_u32().await?;
    if n > MAX_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

//! Single-instance control socket.
//!
//! Requests are one text line (`TOGGLE`, `PASTE 7`, `QUERY`, ...). Replies
//! are one JSON line, except for `TOGGLE` which gets none. Binding the
//! socket is what makes a process the daemon.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::dispatch::Dispatcher;
use crate::entry::{Entry, EntryId};
use crate::error::{Error, Result};
use crate::injector::PasteOutcome;
use crate::store::Store;

const MAX_IPC_MESSAGE_SIZE: u64 = 4096;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Toggle,
    Paste(EntryId),
    /// Full history, or only text entries matching the filter.
    Query(Option<String>),
    Pin(EntryId),
    Unpin(EntryId),
    Delete(EntryId),
    Clear { keep_pinned: bool },
}

impl Request {
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Request::Toggle)
    }
}

impl FromStr for Request {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let id = || {
            rest.parse::<EntryId>()
                .map_err(|_| Error::Protocol(format!("{verb} needs a numeric id, got {rest:?}")))
        };

        match verb.to_ascii_uppercase().as_str() {
            "TOGGLE" => Ok(Request::Toggle),
            "PASTE" => Ok(Request::Paste(id()?)),
            "QUERY" if rest.is_empty() => Ok(Request::Query(None)),
            "QUERY" => Ok(Request::Query(Some(rest.to_string()))),
            "PIN" => Ok(Request::Pin(id()?)),
            "UNPIN" => Ok(Request::Unpin(id()?)),
            "DELETE" => Ok(Request::Delete(id()?)),
            "CLEAR" if rest.is_empty() => Ok(Request::Clear { keep_pinned: true }),
            "CLEAR" if rest.eq_ignore_ascii_case("ALL") => Ok(Request::Clear { keep_pinned: false }),
            _ => Err(Error::Protocol(format!("unknown request {line:?}"))),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Toggle => write!(f, "TOGGLE"),
            Request::Paste(id) => write!(f, "PASTE {id}"),
            Request::Query(None) => write!(f, "QUERY"),
            Request::Query(Some(filter)) => write!(f, "QUERY {}", filter.replace('\n', " ")),
            Request::Pin(id) => write!(f, "PIN {id}"),
            Request::Unpin(id) => write!(f, "UNPIN {id}"),
            Request::Delete(id) => write!(f, "DELETE {id}"),
            Request::Clear { keep_pinned: true } => write!(f, "CLEAR"),
            Request::Clear { keep_pinned: false } => write!(f, "CLEAR ALL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    PermissionDenied,
    Transient,
    BadRequest,
    Internal,
}

/// An entry as clients see it: the stored form plus what a UI needs to
/// show an image without knowing the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedEntry {
    #[serde(flatten)]
    pub entry: Entry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_path: Option<PathBuf>,
    /// Base64 PNG thumbnail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl ListedEntry {
    pub fn new(store: &Store, entry: Entry) -> Self {
        let (blob_path, preview) = match entry.image() {
            Some(image) => (
                Some(store.blob_path(image)),
                (!image.preview.is_empty()).then(|| BASE64.encode(&image.preview)),
            ),
            None => (None, None),
        };
        Self {
            entry,
            blob_path,
            preview,
        }
    }

    pub fn preview_png(&self) -> Option<Vec<u8>> {
        self.preview.as_ref().and_then(|p| BASE64.decode(p).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Entries { entries: Vec<ListedEntry> },
    Pasted { outcome: PasteOutcome },
    Error { code: ErrorCode, message: String },
}

impl From<&Error> for Response {
    fn from(err: &Error) -> Self {
        let code = match err {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Error::TransientIo(_) => ErrorCode::Transient,
            Error::Protocol(_) => ErrorCode::BadRequest,
            _ => ErrorCode::Internal,
        };
        Response::Error {
            code,
            message: err.to_string(),
        }
    }
}

/// Outcome of trying to become the daemon.
pub enum Claim {
    Owner(ControlServer),
    /// A live daemon answered on the socket.
    Running,
}

impl Claim {
    pub fn into_owner(self) -> Result<ControlServer> {
        match self {
            Claim::Owner(server) => Ok(server),
            Claim::Running => Err(Error::AlreadyRunning),
        }
    }
}

/// Binds the control socket at `path`.
///
/// A socket file nobody answers on is left over from a crashed daemon and
/// is replaced.
pub fn claim(path: &Path) -> Result<Claim> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match UnixListener::bind(path) {
        Ok(listener) => return Ok(Claim::Owner(ControlServer::new(listener, path)?)),
        Err(e) if e.kind() == ErrorKind::AddrInUse => {}
        Err(e) => return Err(e.into()),
    }

    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => return Ok(Claim::Running),
        Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) => {
            info!("removing stale control socket {}", path.display());
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(e) => return Err(e.into()),
    }

    match UnixListener::bind(path) {
        Ok(listener) => Ok(Claim::Owner(ControlServer::new(listener, path)?)),
        // Lost a race with another starting daemon.
        Err(e) if e.kind() == ErrorKind::AddrInUse => Ok(Claim::Running),
        Err(e) => Err(e.into()),
    }
}

/// Whether a live daemon accepts connections at `path`.
pub fn is_running(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

/// Sends one request to the running daemon and waits for its reply, if the
/// request has one.
pub async fn send(path: &Path, request: &Request) -> Result<Option<Response>> {
    let mut stream = match tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(path)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) => {
            return Err(Error::NotRunning);
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(Error::TransientIo("control socket connect timed out".into())),
    };

    stream.write_all(format!("{request}\n").as_bytes()).await?;
    stream.shutdown().await?;

    if !request.expects_reply() {
        return Ok(None);
    }

    let mut reply = Vec::new();
    tokio::time::timeout(REPLY_TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .map_err(|_| Error::TransientIo("daemon did not reply in time".into()))??;

    let response = serde_json::from_slice(&reply)
        .map_err(|e| Error::Protocol(format!("unreadable reply: {e}")))?;
    Ok(Some(response))
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    fn new(listener: UnixListener, path: &Path) -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until the task is dropped; each connection
    /// carries one request and is handled on its own task.
    pub async fn serve(&self, dispatcher: Arc<Dispatcher>) {
        loop {
            let stream = match self.listener.accept().await {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    warn!("control socket accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if !peer_is_same_user(&stream) {
                debug!("dropping control connection from another user");
                continue;
            }

            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, &dispatcher).await {
                    debug!("control connection failed: {}", e);
                }
            });
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn peer_is_same_user(stream: &UnixStream) -> bool {
    match stream.peer_cred() {
        Ok(cred) => cred.uid() == unsafe { libc::getuid() },
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn peer_is_same_user(_stream: &UnixStream) -> bool {
    true
}

async fn handle_connection(stream: UnixStream, dispatcher: &Dispatcher) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half.take(MAX_IPC_MESSAGE_SIZE));
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let parsed = if line.len() as u64 >= MAX_IPC_MESSAGE_SIZE && !line.ends_with('\n') {
        Err(Error::Protocol(format!(
            "request exceeds {MAX_IPC_MESSAGE_SIZE} bytes"
        )))
    } else {
        line.parse::<Request>()
    };

    let response = match parsed {
        Ok(request) => {
            debug!("control request: {}", request);
            dispatcher.dispatch(request).await
        }
        Err(e) => Some(Response::from(&e)),
    };

    if let Some(response) = response {
        let mut body = serde_json::to_vec(&response)?;
        body.push(b'\n');
        write_half.write_all(&body).await?;
        write_half.shutdown().await?;
    }
    Ok(())
}

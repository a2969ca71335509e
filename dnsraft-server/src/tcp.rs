//! Line-oriented JSON access to the store over TCP.
//!
//! Each request is one JSON object per line:
//! `{"op":"get","key":"example.com._1"}`,
//! `{"op":"set","key":"..","value":".."}` or `{"op":"delete","key":".."}`.
//! Each gets exactly one JSON line back.

use std::io;
use std::sync::Arc;

use dnsraft_common::error::StoreError;
use dnsraft_storage::{Shutdown, Store};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TcpRequest {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TcpResponse {
    Value { value: Option<String> },
    Ok,
    NotLeader { leader: Option<String> },
    Error { message: String },
}

impl From<StoreError> for TcpResponse {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotLeader { leader } => TcpResponse::NotLeader { leader },
            other => TcpResponse::Error {
                message: other.to_string(),
            },
        }
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

pub async fn execute(store: &Store, request: TcpRequest) -> TcpResponse {
    match request {
        TcpRequest::Get { key } => TcpResponse::Value {
            value: store.get(&key),
        },
        TcpRequest::Set { key, value } => match store.set(key, value).await {
            Ok(()) => TcpResponse::Ok,
            Err(err) => err.into(),
        },
        TcpRequest::Delete { key } => match store.delete(key).await {
            Ok(()) => TcpResponse::Ok,
            Err(err) => err.into(),
        },
    }
}

async fn handle_connection(stream: TcpStream, store: Arc<Store>) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    loop {
        let request = match read_message::<_, TcpRequest>(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                let response = TcpResponse::Error {
                    message: format!("invalid request: {}", err),
                };
                write_message(&mut writer, &response).await?;
                continue;
            }
            Err(err) => return Err(err),
        };
        let response = execute(&store, request).await;
        write_message(&mut writer, &response).await?;
    }
}

/// Accepts clients until `cancel` fires.
pub async fn serve_tcp(
    listener: TcpListener,
    store: Arc<Store>,
    cancel: Shutdown,
) -> io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "tcp accept failed");
                    continue;
                }
            },
        };
        let store = store.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = handle_connection(stream, store) => {
                    if let Err(err) = result {
                        debug!(peer = %peer, error = %err, "tcp client disconnected");
                    }
                }
            }
        });
    }
}

//! Wire messages of the management socket.
//!
//! Framing is one JSON document per line. A connection carries any number of
//! unary request/response pairs in order; a [`Request::Watch`] turns it into a
//! server stream of [`Response::Snapshot`] lines until either side closes.

pub mod client;
pub mod server;

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::{
    error::{LvmdError, Result},
    service::lv_service::{
        CreateLvRequest, CreateSnapshotRequest, RemoveLvRequest, ResizeLvRequest,
    },
    volume::{LogicalVolume, VolumeGroupSnapshot},
};

/// Upper bound of a single frame, either direction.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    ListLogicalVolumes {
        #[serde(default)]
        device_class: String,
    },
    FreeBytes {
        #[serde(default)]
        device_class: String,
    },
    Watch {
        #[serde(default)]
        device_class: String,
    },
    CreateLv(CreateLvRequest),
    ResizeLv(ResizeLvRequest),
    RemoveLv(RemoveLvRequest),
    CreateSnapshot(CreateSnapshotRequest),
    Health,
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Self::ListLogicalVolumes { .. } => "list_logical_volumes",
            Self::FreeBytes { .. } => "free_bytes",
            Self::Watch { .. } => "watch",
            Self::CreateLv(_) => "create_lv",
            Self::ResizeLv(_) => "resize_lv",
            Self::RemoveLv(_) => "remove_lv",
            Self::CreateSnapshot(_) => "create_snapshot",
            Self::Health => "health",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Serving,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serving => f.write_str("SERVING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Response {
    LogicalVolumes(Vec<LogicalVolume>),
    FreeBytes(u64),
    LogicalVolume(LogicalVolume),
    Removed,
    Snapshot(VolumeGroupSnapshot),
    Health(HealthStatus),
    Error(LvmdError),
}

impl Response {
    fn kind(&self) -> &'static str {
        match self {
            Self::LogicalVolumes(_) => "logical_volumes",
            Self::FreeBytes(_) => "free_bytes",
            Self::LogicalVolume(_) => "logical_volume",
            Self::Removed => "removed",
            Self::Snapshot(_) => "snapshot",
            Self::Health(_) => "health",
            Self::Error(_) => "error",
        }
    }
}

/// Serializes one frame, newline included.
pub(crate) fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(msg).map_err(|e| LvmdError::Internal(e.to_string()))?;
    buf.push(b'\n');
    Ok(buf)
}

pub(crate) fn decode<T: DeserializeOwned>(frame: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(frame)
}

/// Splits a byte stream into newline-terminated frames of bounded size.
pub(crate) struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// `None` on a clean end of stream. Cancel-safe: a partially read frame
    /// stays buffered for the next call.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let available = self.inner.fill_buf().await.map_err(LvmdError::transport)?;
            if available.is_empty() {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(LvmdError::Transport("connection closed mid-frame".into()));
            }
            let (take, done) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos, true),
                None => (available.len(), false),
            };
            self.buf.extend_from_slice(&available[..take]);
            self.inner.consume(if done { take + 1 } else { take });

            if self.buf.len() > MAX_FRAME_BYTES {
                self.buf.clear();
                return Err(LvmdError::InvalidArgument(format!(
                    "frame exceeds {MAX_FRAME_BYTES} bytes"
                )));
            }
            if done {
                return Ok(Some(std::mem::take(&mut self.buf)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::volume::AccessType;

    #[test]
    fn request_wire_shape() {
        let req: Request = serde_json::from_value(json!({
            "method": "create_lv",
            "params": {"device_class": "ssd", "name": "pvc-1", "size_bytes": 1024}
        }))
        .unwrap();
        assert_eq!(
            req,
            Request::CreateLv(CreateLvRequest {
                device_class: "ssd".into(),
                name: "pvc-1".into(),
                size_bytes: 1024,
                lvcreate_option_class: None,
                tags: vec![],
            })
        );

        let health: Request = serde_json::from_str(r#"{"method":"health"}"#).unwrap();
        assert_eq!(health, Request::Health);

        let free: Request =
            serde_json::from_str(r#"{"method":"free_bytes","params":{}}"#).unwrap();
        assert_eq!(
            free,
            Request::FreeBytes {
                device_class: String::new()
            }
        );

        let snap: Request = serde_json::from_value(json!({
            "method": "create_snapshot",
            "params": {"source": "a", "name": "b", "access_type": "rw"}
        }))
        .unwrap();
        assert!(matches!(
            snap,
            Request::CreateSnapshot(CreateSnapshotRequest {
                access_type: AccessType::ReadWrite,
                ..
            })
        ));
    }

    #[test]
    fn error_response_wire_shape() {
        let resp = Response::Error(LvmdError::NotFound("device class 'x'".into()));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            v,
            json!({"kind": "error", "data": {"code": "not_found", "message": "device class 'x'"}})
        );
        assert_eq!(
            serde_json::to_value(Response::Health(HealthStatus::Serving)).unwrap(),
            json!({"kind": "health", "data": "SERVING"})
        );
    }

    #[tokio::test]
    async fn frame_reader_splits_lines() {
        let input: &[u8] = b"{\"a\":1}\n\n{\"b\":2}\npartial";
        let mut r = FrameReader::new(input);
        assert_eq!(r.next_frame().await.unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(r.next_frame().await.unwrap().unwrap(), b"");
        assert_eq!(r.next_frame().await.unwrap().unwrap(), b"{\"b\":2}");
        assert!(matches!(
            r.next_frame().await,
            Err(LvmdError::Transport(_))
        ));

        let mut empty = FrameReader::new(&b""[..]);
        assert!(empty.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn frame_reader_bounds_frame_size() {
        let big = vec![b'x'; MAX_FRAME_BYTES + 10];
        let mut r = FrameReader::new(&big[..]);
        assert!(matches!(
            r.next_frame().await,
            Err(LvmdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn frames_end_with_newline() {
        let buf = encode(&Request::Health).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);
    }
}

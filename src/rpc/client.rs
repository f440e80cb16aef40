//! Async client for the management socket.

use std::path::Path;

use tokio::{
    io::AsyncWriteExt,
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::debug;

use super::{FrameReader, HealthStatus, Request, Response, decode, encode};
use crate::{
    error::{LvmdError, Result},
    service::lv_service::{
        CreateLvRequest, CreateSnapshotRequest, RemoveLvRequest, ResizeLvRequest,
    },
    volume::{LogicalVolume, VolumeGroupSnapshot},
};

/// One connection. Calls are sequential; open more clients for concurrency.
pub struct LvmdClient {
    frames: FrameReader<OwnedReadHalf>,
    wr: OwnedWriteHalf,
}

impl LvmdClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| LvmdError::Transport(format!("connect {}: {e}", path.display())))?;
        debug!(socket = %path.display(), "connected");
        let (rd, wr) = stream.into_split();
        Ok(Self {
            frames: FrameReader::new(rd),
            wr,
        })
    }

    /// Sends one request and waits for its response. Server-side failures
    /// come back as the same [`LvmdError`] variant.
    pub async fn call(&mut self, req: &Request) -> Result<Response> {
        send(&mut self.wr, req).await?;
        match recv(&mut self.frames).await? {
            Some(Response::Error(e)) => Err(e),
            Some(resp) => Ok(resp),
            None => Err(LvmdError::Transport("server closed the connection".into())),
        }
    }

    pub async fn health(&mut self) -> Result<HealthStatus> {
        match self.call(&Request::Health).await? {
            Response::Health(s) => Ok(s),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn list_logical_volumes(&mut self, device_class: &str) -> Result<Vec<LogicalVolume>> {
        let req = Request::ListLogicalVolumes {
            device_class: device_class.to_string(),
        };
        match self.call(&req).await? {
            Response::LogicalVolumes(lvs) => Ok(lvs),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn free_bytes(&mut self, device_class: &str) -> Result<u64> {
        let req = Request::FreeBytes {
            device_class: device_class.to_string(),
        };
        match self.call(&req).await? {
            Response::FreeBytes(n) => Ok(n),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn create_lv(&mut self, req: CreateLvRequest) -> Result<LogicalVolume> {
        self.expect_volume(&Request::CreateLv(req)).await
    }

    pub async fn resize_lv(&mut self, req: ResizeLvRequest) -> Result<LogicalVolume> {
        self.expect_volume(&Request::ResizeLv(req)).await
    }

    pub async fn create_snapshot(&mut self, req: CreateSnapshotRequest) -> Result<LogicalVolume> {
        self.expect_volume(&Request::CreateSnapshot(req)).await
    }

    pub async fn remove_lv(&mut self, req: RemoveLvRequest) -> Result<()> {
        match self.call(&Request::RemoveLv(req)).await? {
            Response::Removed => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Turns the connection into a capacity stream.
    pub async fn watch(mut self, device_class: &str) -> Result<WatchStream> {
        let req = Request::Watch {
            device_class: device_class.to_string(),
        };
        send(&mut self.wr, &req).await?;
        Ok(WatchStream {
            frames: self.frames,
            wr: self.wr,
            done: false,
        })
    }

    async fn expect_volume(&mut self, req: &Request) -> Result<LogicalVolume> {
        match self.call(req).await? {
            Response::LogicalVolume(lv) => Ok(lv),
            other => Err(unexpected(&other)),
        }
    }
}

pub struct WatchStream {
    frames: FrameReader<OwnedReadHalf>,
    wr: OwnedWriteHalf,
    done: bool,
}

impl WatchStream {
    /// `None` once the server ended the stream. An `Err` item is final.
    pub async fn next(&mut self) -> Option<Result<VolumeGroupSnapshot>> {
        if self.done {
            return None;
        }
        let item = match recv(&mut self.frames).await {
            Ok(Some(Response::Snapshot(s))) => Ok(s),
            Ok(Some(Response::Error(e))) => Err(e),
            Ok(Some(other)) => Err(unexpected(&other)),
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => Err(e),
        };
        self.done = item.is_err();
        Some(item)
    }

    /// Half-closes the connection, which ends the stream server-side.
    pub async fn close(mut self) {
        let _ = self.wr.shutdown().await;
    }
}

async fn send(wr: &mut OwnedWriteHalf, req: &Request) -> Result<()> {
    let buf = encode(req)?;
    wr.write_all(&buf).await.map_err(LvmdError::transport)
}

async fn recv(frames: &mut FrameReader<OwnedReadHalf>) -> Result<Option<Response>> {
    let Some(frame) = frames.next_frame().await? else {
        return Ok(None);
    };
    decode(&frame)
        .map(Some)
        .map_err(|e| LvmdError::Transport(format!("malformed response: {e}")))
}

fn unexpected(resp: &Response) -> LvmdError {
    LvmdError::Transport(format!("unexpected response '{}'", resp.kind()))
}

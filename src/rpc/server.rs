//! Unix-socket server that dispatches [`Request`]s to the engine.

use std::{fs, io, os::unix::fs::FileTypeExt, path::Path};

use anyhow::{Context, bail};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing as log;

use super::{FrameReader, HealthStatus, Request, Response, decode, encode};
use crate::{
    error::{LvmdError, Result},
    service::{LvService, VgService},
};

/// Request handlers shared by every connection.
#[derive(Clone)]
pub struct Handlers {
    vg: VgService,
    lv: LvService,
}

impl Handlers {
    pub fn new(vg: VgService, lv: LvService) -> Self {
        Self { vg, lv }
    }

    /// Runs a unary call on the blocking pool; the engine shells out.
    async fn dispatch(&self, req: Request) -> Response {
        if matches!(req, Request::Health) {
            return Response::Health(HealthStatus::Serving);
        }
        let this = self.clone();
        let method = req.method();
        let result = tokio::task::spawn_blocking(move || this.call(req))
            .await
            .map_err(|e| LvmdError::Internal(format!("{method} task: {e}")))
            .and_then(|r| r);
        match result {
            Ok(resp) => resp,
            Err(e) => {
                log::warn!(method, code = e.code(), error = %e, "request failed");
                Response::Error(e)
            }
        }
    }

    fn call(&self, req: Request) -> Result<Response> {
        Ok(match req {
            Request::ListLogicalVolumes { device_class } => {
                Response::LogicalVolumes(self.vg.list_logical_volumes(&device_class)?)
            }
            Request::FreeBytes { device_class } => {
                Response::FreeBytes(self.vg.free_bytes(&device_class)?)
            }
            Request::CreateLv(r) => Response::LogicalVolume(self.lv.create_lv(&r)?),
            Request::ResizeLv(r) => Response::LogicalVolume(self.lv.resize_lv(&r)?),
            Request::RemoveLv(r) => {
                self.lv.remove_lv(&r)?;
                Response::Removed
            }
            Request::CreateSnapshot(r) => Response::LogicalVolume(self.lv.create_snapshot(&r)?),
            Request::Health => Response::Health(HealthStatus::Serving),
            Request::Watch { .. } => {
                return Err(LvmdError::InvalidArgument(
                    "watch is a streaming call".into(),
                ));
            }
        })
    }
}

pub struct RpcServer {
    listener: UnixListener,
    handlers: Handlers,
}

impl RpcServer {
    /// Binds `path`, replacing a stale socket left by a previous run. The
    /// caller must hold the instance lock.
    pub fn bind(path: &Path, handlers: Handlers) -> anyhow::Result<Self> {
        remove_stale_socket(path)?;
        let listener =
            UnixListener::bind(path).with_context(|| format!("bind {}", path.display()))?;
        log::info!(socket = %path.display(), "listening");
        Ok(Self { listener, handlers })
    }

    /// Serves until `shutdown` fires. Then stops accepting, ends every watch
    /// stream and waits for in-flight unary calls to finish.
    pub async fn serve(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handlers = self.handlers.clone();
                        let shutdown = shutdown.clone();
                        tracker.spawn(async move {
                            handle_connection(stream, handlers, shutdown).await;
                        });
                    }
                    Err(e) => log::warn!(error = %e, "accept failed"),
                },
            }
        }
        tracker.close();
        log::info!(connections = tracker.len(), "draining connections");
        tracker.wait().await;
        log::info!("server stopped");
    }
}

fn remove_stale_socket(path: &Path) -> anyhow::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path).with_context(|| format!("remove stale {}", path.display()))?;
            log::debug!(socket = %path.display(), "removed stale socket");
            Ok(())
        }
        Ok(_) => bail!("{} exists and is not a socket", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
    }
}

async fn handle_connection(stream: UnixStream, handlers: Handlers, shutdown: CancellationToken) {
    let (rd, mut wr) = stream.into_split();
    let mut frames = FrameReader::new(rd);
    log::debug!("connection opened");

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = frames.next_frame() => frame,
        };
        let frame = match frame {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                log::debug!(error = %e, "dropping connection");
                let _ = write_frame(&mut wr, &Response::Error(e)).await;
                break;
            }
        };
        let req: Request = match decode(&frame) {
            Ok(r) => r,
            Err(e) => {
                let err = LvmdError::InvalidArgument(format!("malformed request: {e}"));
                if write_frame(&mut wr, &Response::Error(err)).await.is_err() {
                    break;
                }
                continue;
            }
        };
        log::debug!(method = req.method(), "request");

        if let Request::Watch { device_class } = req {
            stream_watch(&handlers, &device_class, &mut frames, &mut wr, &shutdown).await;
            break;
        }
        let resp = handlers.dispatch(req).await;
        if let Err(e) = write_frame(&mut wr, &resp).await {
            log::debug!(error = %e, "client went away");
            break;
        }
    }
    let _ = wr.shutdown().await;
    log::debug!("connection closed");
}

/// Pushes one snapshot per delivery until the client closes its side, the
/// server shuts down, or an error is reported.
async fn stream_watch<R, W>(
    handlers: &Handlers,
    device_class: &str,
    frames: &mut FrameReader<R>,
    wr: &mut W,
    shutdown: &CancellationToken,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cancel = shutdown.child_token();
    let mut watch = match handlers.vg.watch(device_class, cancel.clone()) {
        Ok(w) => w,
        Err(e) => {
            let _ = write_frame(wr, &Response::Error(e)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            item = watch.next() => match item {
                None => break,
                Some(Ok(snap)) => {
                    if write_frame(wr, &Response::Snapshot(snap)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let _ = write_frame(wr, &Response::Error(e)).await;
                    break;
                }
            },
            // Any client input ends the stream; EOF is the normal close.
            _ = frames.next_frame() => break,
        }
    }
    cancel.cancel();
}

async fn write_frame<W: AsyncWrite + Unpin>(wr: &mut W, resp: &Response) -> Result<()> {
    let buf = encode(resp)?;
    wr.write_all(&buf).await.map_err(LvmdError::transport)?;
    wr.flush().await.map_err(LvmdError::transport)
}

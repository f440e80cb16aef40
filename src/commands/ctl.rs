use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tracing as log;

use crate::{
    config::Config,
    rpc::client::LvmdClient,
    service::lv_service::{
        CreateLvRequest, CreateSnapshotRequest, RemoveLvRequest, ResizeLvRequest,
    },
    ui::{human_bytes, print_snapshot, print_volumes},
    volume::AccessType,
};

/// Talks to a running daemon over its socket.
#[derive(Debug, Args)]
pub struct CtlArgs {
    /// Socket to connect to; defaults to `socket_name` from the config file.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: CtlCmd,
}

#[derive(Debug, Subcommand)]
pub enum CtlCmd {
    Health,
    /// List the logical volumes of a device class.
    List(ClassArg),
    /// Allocatable bytes of a device class.
    Free(ClassArg),
    /// Follow capacity changes of a device class.
    Watch {
        #[command(flatten)]
        class: ClassArg,
        /// Stop after this many snapshots.
        #[arg(long)]
        count: Option<usize>,
    },
    Create {
        #[command(flatten)]
        class: ClassArg,
        name: String,
        size_bytes: u64,
        #[arg(long)]
        option_class: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Grow a volume to `size_bytes`.
    Resize {
        #[command(flatten)]
        class: ClassArg,
        name: String,
        size_bytes: u64,
    },
    Remove {
        #[command(flatten)]
        class: ClassArg,
        name: String,
    },
    Snapshot {
        #[command(flatten)]
        class: ClassArg,
        source: String,
        name: String,
        #[arg(long)]
        writable: bool,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
}

#[derive(Debug, Args)]
pub struct ClassArg {
    /// Device class; empty selects the default class.
    #[arg(short = 'd', long = "device-class", default_value = "")]
    pub device_class: String,
}

impl CtlArgs {
    pub fn run(&self, config_path: &Path) -> Result<()> {
        let socket = match &self.socket {
            Some(s) => s.clone(),
            None => Config::load(config_path)?.socket_name,
        };
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build tokio runtime")?;
        rt.block_on(self.exec(socket))
    }

    async fn exec(&self, socket: PathBuf) -> Result<()> {
        let mut client = LvmdClient::connect(&socket).await?;
        match &self.cmd {
            CtlCmd::Health => println!("{}", client.health().await?),
            CtlCmd::List(c) => print_volumes(&client.list_logical_volumes(&c.device_class).await?),
            CtlCmd::Free(c) => {
                let free = client.free_bytes(&c.device_class).await?;
                println!("{free} ({})", human_bytes(free));
            }
            CtlCmd::Watch { class, count } => {
                let mut watch = client.watch(&class.device_class).await?;
                let mut seen = 0usize;
                while let Some(item) = watch.next().await {
                    print_snapshot(&item?);
                    seen += 1;
                    if count.is_some_and(|n| seen >= n) {
                        watch.close().await;
                        break;
                    }
                }
                log::debug!(snapshots = seen, "watch ended");
            }
            CtlCmd::Create {
                class,
                name,
                size_bytes,
                option_class,
                tags,
            } => {
                let lv = client
                    .create_lv(CreateLvRequest {
                        device_class: class.device_class.clone(),
                        name: name.clone(),
                        size_bytes: *size_bytes,
                        lvcreate_option_class: option_class.clone(),
                        tags: tags.clone(),
                    })
                    .await?;
                print_volumes(&[lv]);
            }
            CtlCmd::Resize {
                class,
                name,
                size_bytes,
            } => {
                let lv = client
                    .resize_lv(ResizeLvRequest {
                        device_class: class.device_class.clone(),
                        name: name.clone(),
                        size_bytes: *size_bytes,
                    })
                    .await?;
                print_volumes(&[lv]);
            }
            CtlCmd::Remove { class, name } => {
                client
                    .remove_lv(RemoveLvRequest {
                        device_class: class.device_class.clone(),
                        name: name.clone(),
                    })
                    .await?;
                log::info!(lv = %name, "removed");
            }
            CtlCmd::Snapshot {
                class,
                source,
                name,
                writable,
                tags,
            } => {
                let access_type = if *writable {
                    AccessType::ReadWrite
                } else {
                    AccessType::ReadOnly
                };
                let lv = client
                    .create_snapshot(CreateSnapshotRequest {
                        device_class: class.device_class.clone(),
                        source: source.clone(),
                        name: name.clone(),
                        access_type,
                        tags: tags.clone(),
                    })
                    .await?;
                print_volumes(&[lv]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Wrap {
        #[command(flatten)]
        ctl: CtlArgs,
    }

    #[test]
    fn parses_mutating_commands() {
        let w = Wrap::parse_from([
            "ctl", "--socket", "/tmp/s", "create", "-d", "ssd", "pvc-1", "1073741824", "--tag",
            "a", "--tag", "b",
        ]);
        assert_eq!(w.ctl.socket.as_deref(), Some(Path::new("/tmp/s")));
        match w.ctl.cmd {
            CtlCmd::Create {
                class,
                name,
                size_bytes,
                tags,
                option_class,
            } => {
                assert_eq!(class.device_class, "ssd");
                assert_eq!(name, "pvc-1");
                assert_eq!(size_bytes, 1 << 30);
                assert_eq!(tags, vec!["a", "b"]);
                assert!(option_class.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        let w = Wrap::parse_from(["ctl", "watch", "--count", "2"]);
        assert!(matches!(
            w.ctl.cmd,
            CtlCmd::Watch { ref class, count: Some(2) } if class.device_class.is_empty()
        ));
    }
}

//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::supervisor::DEFAULT_MAX_RESTARTS;

const KERNEL_NAME: &str = "PocketRAG_kernel";
const DEFAULT_BIND: &str = "127.0.0.1:4777";

#[derive(Parser, Debug)]
#[command(name = "pocketrag-host", version, about = "PocketRAG host process")]
pub struct HostArgs {
    /// Kernel executable. Defaults to `bin/PocketRAG_kernel` next to this binary.
    #[arg(long, env = "POCKETRAG_KERNEL_PATH")]
    pub kernel: Option<PathBuf>,

    /// User data directory shared with the kernel.
    #[arg(long, env = "POCKETRAG_USERDATA_PATH")]
    pub data_dir: Option<PathBuf>,

    /// Address windows connect to.
    #[arg(long, env = "POCKETRAG_BIND", default_value = DEFAULT_BIND)]
    pub bind: SocketAddr,

    /// Settings installed when the user's copy is missing or invalid.
    #[arg(long, env = "POCKETRAG_DEFAULT_SETTINGS")]
    pub default_settings: Option<PathBuf>,

    #[arg(long, env = "POCKETRAG_MAX_RESTARTS", default_value_t = DEFAULT_MAX_RESTARTS)]
    pub max_restarts: u32,

    /// How long to wait for the kernel's `stopAll` reply on quit.
    #[arg(long, env = "POCKETRAG_SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub kernel_path: PathBuf,
    pub data_dir: Option<PathBuf>,
    pub bind: SocketAddr,
    pub default_settings: PathBuf,
    pub max_restarts: u32,
    pub shutdown_timeout: Duration,
}

impl HostConfig {
    /// Fill unset paths relative to the running executable.
    pub fn from_args(args: HostArgs) -> anyhow::Result<Self> {
        let exe = std::env::current_exe().context("failed to locate the host executable")?;
        let exe_dir = exe
            .parent()
            .context("host executable has no parent directory")?;
        Ok(Self::resolve(args, exe_dir))
    }

    pub fn resolve(args: HostArgs, exe_dir: &Path) -> Self {
        Self {
            kernel_path: args
                .kernel
                .unwrap_or_else(|| exe_dir.join("bin").join(kernel_file_name())),
            data_dir: args.data_dir,
            bind: args.bind,
            default_settings: args
                .default_settings
                .unwrap_or_else(|| exe_dir.join("public").join("defaultSettings.json")),
            max_restarts: args.max_restarts,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        }
    }
}

fn kernel_file_name() -> String {
    if cfg!(windows) {
        format!("{KERNEL_NAME}.exe")
    } else {
        KERNEL_NAME.to_string()
    }
}

//! Client interface of the timer-storage transfer RPC.
//!
//! During takeover from a dead or departed node, the new owner pulls the
//! vbucket's timer directory from the previous owner's transfer endpoint
//! and imports its records locally. The server side lives outside this
//! crate; only the client seam and the directory convention are fixed here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::Vbucket;

/// Transfer failures. Both are transient from the rebalance protocol's
/// point of view and retried with fixed backoff.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to connect to remote transfer endpoint {addr}")]
    Connect { addr: String },

    #[error("failed to download timer directory {dir} from {addr}")]
    Download { dir: String, addr: String },
}

/// Name of the rebalance-transferable timer directory for one vbucket.
pub fn timer_dir_name(vb: Vbucket, app_name: &str) -> String {
    format!("reb_{vb}_{app_name}_timer.data")
}

/// Full path of the timer directory under an eventing directory.
pub fn timer_dir_path(eventing_dir: &Path, vb: Vbucket, app_name: &str) -> PathBuf {
    eventing_dir.join(timer_dir_name(vb, app_name))
}

/// One dialed transfer session against a remote worker's endpoint.
#[async_trait]
pub trait TransferSession: Send {
    /// Download `src_path` on the remote side into local `dst_path`.
    async fn download(&mut self, src_path: &Path, dst_path: &Path)
        -> Result<(), TransferError>;
}

/// Factory for transfer sessions.
#[async_trait]
pub trait TimerTransferClient: Send + Sync + 'static {
    /// Dial `host_port` at `/<worker_name>/`.
    async fn dial(
        &self,
        host_port: &str,
        worker_name: &str,
    ) -> Result<Box<dyn TransferSession>, TransferError>;
}

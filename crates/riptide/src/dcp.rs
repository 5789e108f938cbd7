//! Change-data-capture subscription interface.
//!
//! The CDC producer is an external collaborator. A stream delivers one
//! vbucket's mutations in sequence order and terminates with a
//! [`CdcMessage::StreamEnd`] marker after a close request (or producer-side
//! teardown). At most one stream per vbucket may be open cluster-wide; the
//! rebalance protocol is what enforces that.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Vbucket;

/// Kind of a CDC event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdcOp {
    Mutation,
    Deletion,
}

/// One mutation or deletion observed on a vbucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdcEvent {
    pub vb: Vbucket,
    pub seq: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub op: CdcOp,
}

/// Messages delivered on an open stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdcMessage {
    Event(CdcEvent),
    /// Terminal marker; no further messages follow for this vbucket.
    StreamEnd(Vbucket),
}

/// Where a stream begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStart {
    /// Resume from a recorded sequence (0 replays everything).
    Seq(u64),
    /// Start at the current tail; history is skipped.
    Tail,
}

/// Client half of the CDC producer.
#[async_trait]
pub trait CdcClient: Send + Sync + 'static {
    /// Open a stream for `vb` at `start`. Events arrive on the returned
    /// channel in sequence order.
    async fn open_stream(
        &self,
        vb: Vbucket,
        start: StreamStart,
    ) -> anyhow::Result<mpsc::Receiver<CdcMessage>>;

    /// Request stream close; the producer answers with `StreamEnd` on the
    /// event channel.
    async fn close_stream(&self, vb: Vbucket) -> anyhow::Result<()>;
}

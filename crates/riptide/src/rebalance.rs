//! Vbucket ownership give-up and takeover.
//!
//! Runs concurrently on every node against the same deterministic planner
//! output, so the protocol is decentralized but convergent. Give-up and
//! takeover fan out over independent shard tasks; the outer loop re-runs
//! takeover until nothing remains to own or a cancellation fires. Fresh
//! cancellation tokens are installed after each completed pass.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::Ordering;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::assignment::shard_vbuckets;
use crate::checkpoint::{
    self, epoch_secs, vb_blob_key, CasOutcome, CheckpointBlob, StreamStatus,
};
use crate::consumer::{initial_stream_start, Consumer};
use crate::retry::{retry_with_backoff, FixedBackoff};
use crate::timer_transfer::{timer_dir_name, timer_dir_path};
use crate::Vbucket;

/// Why a takeover attempt for one vbucket did not claim it.
#[derive(Debug, Error)]
pub enum TakeoverError {
    /// Another worker on this node holds it; that worker's give-up pass
    /// must release it first.
    #[error("vbucket is owned by another worker on the same node")]
    OwnedByAnotherWorker,

    /// A live node holds it; reconsidered on the next convergence pass.
    #[error("vbucket is owned by another node")]
    OwnedByAnotherNode,

    /// The blob is unreadable. Fatal for this vbucket in this pass; the
    /// next pass rebuilds from whatever the store then holds.
    #[error("unexpected vbucket stream status")]
    UnexpectedStreamStatus,

    #[error("dcp stream request failed")]
    StreamRequest(#[source] anyhow::Error),

    /// The pass's cancellation signal fired mid-takeover.
    #[error("takeover cancelled")]
    Cancelled,
}

impl Consumer {
    /// Vbuckets the planner gives this worker that it does not yet run.
    pub fn vbs_remaining_to_own(&self) -> Vec<Vbucket> {
        let node_uuid = self.node_uuid();
        self.assigned_vbs()
            .into_iter()
            .filter(|vb| {
                let stat = self.stats().get(*vb);
                stat.node_uuid != node_uuid || stat.assigned_worker != self.worker_name()
            })
            .collect()
    }

    /// Vbuckets this worker runs that the planner no longer gives it.
    pub fn vbs_remaining_to_give_up(&self) -> Vec<Vbucket> {
        let assigned: HashSet<Vbucket> = self.assigned_vbs().into_iter().collect();
        (0..self.inner.cfg.num_vbuckets)
            .filter(|vb| {
                let stat = self.stats().get(*vb);
                stat.assigned_worker == self.worker_name() && !assigned.contains(vb)
            })
            .collect()
    }

    fn node_should_own_vb(&self, vb: Vbucket) -> bool {
        self.inner
            .producer
            .vb_eventing_node_assign_map()
            .get(&vb)
            .map(|addr| *addr == self.host_port_addr())
            .unwrap_or(false)
    }

    /// Converge this worker's ownership onto the planner output: give up
    /// in parallel with repeated takeover passes, until both diffs are
    /// empty or cancellation fires.
    pub async fn vbs_state_update(&self) -> anyhow::Result<()> {
        let to_give_up = self.vbs_remaining_to_give_up();
        let to_own = self.vbs_remaining_to_own();
        if to_give_up.is_empty() && to_own.is_empty() {
            self.inner.rebalance_ongoing.store(false, Ordering::SeqCst);
            return Ok(());
        }
        if self
            .inner
            .rebalance_ongoing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!(
                worker = self.worker_name(),
                "ownership convergence already running"
            );
            return Ok(());
        }

        tracing::info!(
            worker = self.worker_name(),
            to_own = to_own.len(),
            to_give_up = to_give_up.len(),
            "starting ownership convergence"
        );

        let giveup = {
            let consumer = self.clone();
            tokio::spawn(async move { consumer.vb_giveup_pass(to_give_up).await })
        };

        loop {
            let cancel = self.inner.takeover_cancel.lock().unwrap().clone();
            let to_own = self.vbs_remaining_to_own();
            if to_own.is_empty() || cancel.is_cancelled() {
                break;
            }
            self.vb_takeover_pass(&to_own, &cancel).await;

            if self.vbs_remaining_to_own().is_empty() {
                break;
            }
            // Another node may not have released its streams yet; wait and
            // re-run the takeover phase.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.inner.cfg.intervals.dcp_stream_request_retry) => {}
            }
        }
        *self.inner.takeover_cancel.lock().unwrap() = CancellationToken::new();

        let _ = giveup.await;
        *self.inner.giveup_cancel.lock().unwrap() = CancellationToken::new();

        self.inner.rebalance_ongoing.store(false, Ordering::SeqCst);
        tracing::info!(worker = self.worker_name(), "ownership convergence finished");
        Ok(())
    }

    /// Interrupt an in-flight convergence; fresh tokens are reinstalled
    /// when the pass unwinds.
    pub fn cancel_rebalance(&self) {
        self.inner.giveup_cancel.lock().unwrap().cancel();
        self.inner.takeover_cancel.lock().unwrap().cancel();
    }

    pub fn is_rebalance_ongoing(&self) -> bool {
        self.inner.rebalance_ongoing.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------
    // Phase B: give-up
    // -----------------------------------------------------------------

    async fn vb_giveup_pass(&self, vbs: Vec<Vbucket>) {
        if vbs.is_empty() {
            return;
        }
        let cancel = self.inner.giveup_cancel.lock().unwrap().clone();
        let routines = self.inner.app.settings.vb_ownership_giveup_routine_count;
        let mut handles = Vec::new();
        for (shard_id, shard) in shard_vbuckets(&vbs, routines).into_iter().enumerate() {
            if shard.is_empty() {
                continue;
            }
            let consumer = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                for vb in shard {
                    if cancel.is_cancelled() {
                        tracing::info!(
                            worker = consumer.worker_name(),
                            shard_id,
                            "give-up shard cancelled"
                        );
                        return;
                    }
                    if let Err(err) = consumer.give_up_vb(vb, &cancel).await {
                        if cancel.is_cancelled() {
                            return;
                        }
                        tracing::error!(
                            worker = consumer.worker_name(),
                            vb,
                            error = ?err,
                            "vb give-up failed"
                        );
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn give_up_vb(&self, vb: Vbucket, cancel: &CancellationToken) -> anyhow::Result<()> {
        let key = vb_blob_key(self.app_name(), vb);
        let backoff = FixedBackoff::new(self.inner.cfg.intervals.bucket_op_retry);

        let Some((blob, _)) = retry_with_backoff(backoff, cancel, "read vb blob", || async {
            checkpoint::read_blob(&*self.inner.store, &key).await
        })
        .await?
        else {
            // Never checkpointed: nothing to hand over.
            self.clear_vb_ownership_stats(vb);
            return Ok(());
        };

        // Ownership already migrated elsewhere; close any lingering local
        // stream and forget the vbucket.
        if blob.node_uuid != self.node_uuid() && blob.stream_status == StreamStatus::Running {
            tracing::debug!(
                worker = self.worker_name(),
                vb,
                owner_uuid = %blob.node_uuid,
                "ownership already moved, closing local stream"
            );
            if let Err(err) = self.close_stream(vb).await {
                tracing::error!(worker = self.worker_name(), vb, error = ?err, "stream close failed");
            }
            self.clear_vb_ownership_stats(vb);
            return Ok(());
        }

        let stat = self.stats().get(vb);
        if stat.node_uuid != self.node_uuid() || stat.assigned_worker != self.worker_name() {
            return Ok(());
        }

        let first_close = self.inner.vbs_stream_closed.lock().unwrap().insert(vb);
        if let Err(err) = self.close_stream(vb).await {
            tracing::error!(worker = self.worker_name(), vb, error = ?err, "stream close failed");
        }
        if first_close {
            self.write_giveup_checkpoint(vb, cancel).await?;
        }

        // Wait until the stream is recorded down or a new owner claimed it.
        loop {
            if cancel.is_cancelled() {
                tracing::info!(
                    worker = self.worker_name(),
                    vb,
                    "exiting give-up wait on cancellation"
                );
                return Ok(());
            }
            let Some((blob, _)) = retry_with_backoff(backoff, cancel, "read vb blob", || async {
                checkpoint::read_blob(&*self.inner.store, &key).await
            })
            .await?
            else {
                return Ok(());
            };

            // Done once the stream is recorded down, or once the blob no
            // longer names exactly this consumer (a new owner claimed it).
            let names_us = blob.node_uuid == self.node_uuid()
                && blob.assigned_worker == self.worker_name();
            if blob.stream_status != StreamStatus::Running || !names_us {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.inner.cfg.intervals.vb_meta_state_check) => {}
            }
        }
        tracing::info!(worker = self.worker_name(), vb, "gracefully gave up vb");
        Ok(())
    }

    /// The terminal checkpoint of a give-up: owner fields cleared, previous
    /// owner snapshot recorded so the next owner can fetch timer state.
    async fn write_giveup_checkpoint(
        &self,
        vb: Vbucket,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let key = vb_blob_key(self.app_name(), vb);
        let stat = self.stats().get(vb);
        let update = |blob: &mut CheckpointBlob| {
            blob.previous_owner = self.host_port_addr();
            blob.previous_worker = self.worker_name().to_string();
            blob.previous_node_uuid = self.node_uuid();
            blob.previous_dir = self.inner.cfg.eventing_dir.display().to_string();
            blob.current_owner.clear();
            blob.assigned_worker.clear();
            blob.node_uuid.clear();
            blob.stream_status = StreamStatus::Stopped;
            blob.last_seq_processed = blob.last_seq_processed.max(stat.last_seq_processed);
            blob.last_timer_feedback_seq = blob
                .last_timer_feedback_seq
                .max(stat.last_timer_feedback_seq);
            blob.last_checkpoint_time = epoch_secs();
        };
        self.cas_blob_until_stored(&key, cancel, update).await?;
        self.clear_vb_ownership_stats(vb);
        tracing::info!(worker = self.worker_name(), vb, "wrote give-up checkpoint");
        Ok(())
    }

    fn clear_vb_ownership_stats(&self, vb: Vbucket) {
        self.stats().update(vb, |s| {
            s.current_vb_owner.clear();
            s.assigned_worker.clear();
            s.node_uuid.clear();
            s.stream_status = StreamStatus::Stopped;
        });
    }

    /// Read-modify-CAS loop that only terminates on a stored write or
    /// cancellation; transient store failures back off and retry.
    async fn cas_blob_until_stored<F>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        update: F,
    ) -> anyhow::Result<()>
    where
        F: Fn(&mut CheckpointBlob),
    {
        let backoff = FixedBackoff::new(self.inner.cfg.intervals.bucket_op_retry);
        loop {
            let existing = retry_with_backoff(backoff, cancel, "read vb blob", || async {
                checkpoint::read_blob(&*self.inner.store, key).await
            })
            .await?;
            let (mut blob, token) = match existing {
                Some((blob, token)) => (blob, Some(token)),
                None => (CheckpointBlob::default(), None),
            };
            update(&mut blob);

            match checkpoint::write_blob(&*self.inner.store, key, &blob, token).await {
                Ok(CasOutcome::Stored(_)) => return Ok(()),
                Ok(CasOutcome::Conflict) => continue,
                Err(err) => {
                    tracing::warn!(key, error = ?err, "checkpoint write failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => anyhow::bail!("checkpoint write cancelled"),
                        _ = tokio::time::sleep(backoff.interval) => {}
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Phase C: takeover
    // -----------------------------------------------------------------

    async fn vb_takeover_pass(&self, vbs: &[Vbucket], cancel: &CancellationToken) {
        let routines = self.inner.app.settings.vb_ownership_takeover_routine_count;
        let mut handles = Vec::new();
        for (shard_id, shard) in shard_vbuckets(vbs, routines).into_iter().enumerate() {
            if shard.is_empty() {
                continue;
            }
            let consumer = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                for vb in shard {
                    if cancel.is_cancelled() {
                        tracing::debug!(
                            worker = consumer.worker_name(),
                            shard_id,
                            next_vb = vb,
                            "takeover shard cancelled"
                        );
                        return;
                    }
                    loop {
                        match consumer.do_vb_takeover(vb).await {
                            Ok(()) => break,
                            Err(TakeoverError::Cancelled) => return,
                            Err(
                                err @ (TakeoverError::OwnedByAnotherWorker
                                | TakeoverError::OwnedByAnotherNode),
                            ) => {
                                tracing::info!(
                                    worker = consumer.worker_name(),
                                    vb,
                                    reason = %err,
                                    "takeover deferred to next pass"
                                );
                                break;
                            }
                            Err(err @ TakeoverError::UnexpectedStreamStatus) => {
                                tracing::error!(
                                    worker = consumer.worker_name(),
                                    vb,
                                    error = ?err,
                                    "giving up on vb for this pass"
                                );
                                break;
                            }
                            Err(err) => {
                                // Stream request failures are transient;
                                // retry this vbucket after a pause.
                                tracing::error!(
                                    worker = consumer.worker_name(),
                                    vb,
                                    error = ?err,
                                    "vb takeover failed, retrying"
                                );
                                tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    _ = tokio::time::sleep(
                                        consumer.inner.cfg.intervals.vb_takeover_retry,
                                    ) => {}
                                }
                            }
                        }
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// One takeover attempt for one vbucket, dispatching on the blob's
    /// stream status.
    pub async fn do_vb_takeover(&self, vb: Vbucket) -> Result<(), TakeoverError> {
        let key = vb_blob_key(self.app_name(), vb);
        let cancel = self.inner.takeover_cancel.lock().unwrap().clone();
        let backoff = FixedBackoff::new(self.inner.cfg.intervals.bucket_op_retry);

        let raw = retry_with_backoff(backoff, &cancel, "read vb blob", || async {
            self.inner.store.get(&key).await
        })
        .await
        .map_err(|_| TakeoverError::Cancelled)?;

        let blob = match raw {
            None => CheckpointBlob::default(),
            Some((bytes, _)) => serde_json::from_slice::<CheckpointBlob>(&bytes)
                .map_err(|_| TakeoverError::UnexpectedStreamStatus)?,
        };

        match blob.stream_status {
            StreamStatus::Running => {
                if blob.node_uuid == self.node_uuid()
                    && blob.assigned_worker == self.worker_name()
                {
                    // The blob already names this worker. When the local
                    // stream is live the request guard makes this a no-op;
                    // after a process restart it re-opens from recorded
                    // progress.
                    return self.update_vb_owner_and_start_stream(vb, blob, &cancel).await;
                }

                let owner_alive = self
                    .inner
                    .producer
                    .is_eventing_node_alive(&blob.current_owner, &blob.node_uuid)
                    .await;
                if blob.node_uuid != self.node_uuid()
                    && !owner_alive
                    && self.node_should_own_vb(vb)
                {
                    tracing::info!(
                        worker = self.worker_name(),
                        vb,
                        dead_owner = %blob.current_owner,
                        "taking over vb from dead node"
                    );
                    return self.update_vb_owner_and_start_stream(vb, blob, &cancel).await;
                }

                if blob.node_uuid == self.node_uuid()
                    && blob.assigned_worker != self.worker_name()
                {
                    return Err(TakeoverError::OwnedByAnotherWorker);
                }
                Err(TakeoverError::OwnedByAnotherNode)
            }
            StreamStatus::Stopped | StreamStatus::Uninitialised => {
                self.update_vb_owner_and_start_stream(vb, blob, &cancel).await
            }
        }
    }

    async fn update_vb_owner_and_start_stream(
        &self,
        vb: Vbucket,
        blob: CheckpointBlob,
        cancel: &CancellationToken,
    ) -> Result<(), TakeoverError> {
        // Seed the local mirror with the recorded progress before any event
        // arrives.
        self.stats().update(vb, |s| {
            s.last_seq_processed = blob.last_seq_processed;
            s.last_timer_feedback_seq = blob.last_timer_feedback_seq;
            s.last_checkpointed_seq = blob.last_seq_processed;
        });

        let start = initial_stream_start(self.inner.app.settings.dcp_stream_boundary, &blob);
        let opened = self
            .open_vb_stream(vb, start)
            .await
            .map_err(TakeoverError::StreamRequest)?;
        if !opened {
            // A concurrent request holds the guard; no side effects here.
            return Ok(());
        }
        // A stale give-up marker from a previous ownership stint must not
        // swallow the stopped checkpoint of a future stream end.
        self.inner.vbs_stream_closed.lock().unwrap().remove(&vb);

        if blob.node_uuid != self.node_uuid()
            && !blob.previous_node_uuid.is_empty()
            && blob.previous_node_uuid != self.node_uuid()
        {
            // Transfer failures are transient: keep pulling with backoff
            // until it lands or the pass is cancelled.
            let backoff = FixedBackoff::new(self.inner.cfg.intervals.bucket_op_retry);
            retry_with_backoff(backoff, cancel, "pull timer artifacts", || {
                self.pull_timer_artifacts(vb, &blob)
            })
            .await
            .map_err(|_| TakeoverError::Cancelled)?;
        } else if !blob.previous_worker.is_empty() {
            tracing::debug!(
                worker = self.worker_name(),
                vb,
                "previous owner was local, skipping timer transfer"
            );
        }

        self.claim_vb_ownership(vb, cancel).await?;
        Ok(())
    }

    /// Pull the previous owner's timer directory and import its records.
    async fn pull_timer_artifacts(
        &self,
        vb: Vbucket,
        blob: &CheckpointBlob,
    ) -> anyhow::Result<()> {
        let dir = timer_dir_name(vb, self.app_name());
        let src = format!("{}/{}", blob.previous_dir, dir);
        let staging = timer_dir_path(&self.inner.cfg.eventing_dir, vb, self.app_name());

        let mut session = self
            .inner
            .timer_rpc
            .dial(&blob.previous_owner, &blob.previous_worker)
            .await?;
        session.download(Path::new(&src), &staging).await?;
        tracing::debug!(
            worker = self.worker_name(),
            vb,
            src = %src,
            dst = %staging.display(),
            "downloaded timer directory"
        );

        self.import_timer_records(vb, &staging).await
    }

    /// Move downloaded timer records into the active local store.
    async fn import_timer_records(&self, vb: Vbucket, staging: &Path) -> anyhow::Result<()> {
        if tokio::fs::metadata(staging).await.is_err() {
            // Nothing transferred (fresh vb on the previous owner).
            return Ok(());
        }
        let active = self
            .inner
            .cfg
            .eventing_dir
            .join(format!("timers_{}_{}.data", vb, self.app_name()));
        let _ = tokio::fs::remove_dir_all(&active).await;
        tokio::fs::rename(staging, &active).await?;
        Ok(())
    }

    /// CAS the blob to name this node/worker as the running owner.
    async fn claim_vb_ownership(
        &self,
        vb: Vbucket,
        cancel: &CancellationToken,
    ) -> Result<(), TakeoverError> {
        let key = vb_blob_key(self.app_name(), vb);
        let update = |blob: &mut CheckpointBlob| {
            blob.current_owner = self.host_port_addr();
            blob.assigned_worker = self.worker_name().to_string();
            blob.node_uuid = self.node_uuid();
            blob.stream_status = StreamStatus::Running;
            blob.last_checkpoint_time = epoch_secs();
        };
        self.cas_blob_until_stored(&key, cancel, update)
            .await
            .map_err(|_| TakeoverError::Cancelled)?;

        self.stats().update(vb, |s| {
            s.current_vb_owner = self.host_port_addr();
            s.assigned_worker = self.worker_name().to_string();
            s.node_uuid = self.node_uuid();
            s.stream_status = StreamStatus::Running;
        });
        tracing::info!(worker = self.worker_name(), vb, "took vb ownership");
        Ok(())
    }

    /// Hand every owned vbucket back to the store: close its stream and
    /// write the give-up checkpoint so a successor can claim it. Used when
    /// this worker is being decommissioned (settings-driven replacement).
    pub async fn surrender_all_owned(&self) -> anyhow::Result<()> {
        let cancel = self.inner.giveup_cancel.lock().unwrap().clone();
        for vb in self.currently_owned_vbs() {
            let first_close = self.inner.vbs_stream_closed.lock().unwrap().insert(vb);
            if let Err(err) = self.close_stream(vb).await {
                tracing::error!(worker = self.worker_name(), vb, error = ?err, "stream close failed");
            }
            if first_close {
                self.write_giveup_checkpoint(vb, &cancel).await?;
            }
        }
        Ok(())
    }

    /// Re-assert ownership of one vbucket (engine-restart path) and verify
    /// the blob now names this worker.
    pub async fn reclaim_vb_ownership(&self, vb: Vbucket) -> anyhow::Result<()> {
        if let Err(err) = self.do_vb_takeover(vb).await {
            tracing::debug!(worker = self.worker_name(), vb, error = ?err, "reclaim attempt");
        }

        let key = vb_blob_key(self.app_name(), vb);
        let cancel = self.inner.takeover_cancel.lock().unwrap().clone();
        let backoff = FixedBackoff::new(self.inner.cfg.intervals.bucket_op_retry);
        let blob = retry_with_backoff(backoff, &cancel, "read vb blob", || async {
            checkpoint::read_blob(&*self.inner.store, &key).await
        })
        .await?
        .map(|(blob, _)| blob)
        .unwrap_or_default();

        anyhow::ensure!(
            blob.node_uuid == self.node_uuid() && blob.assigned_worker == self.worker_name(),
            "failed to reclaim ownership of vb {vb}"
        );
        Ok(())
    }
}

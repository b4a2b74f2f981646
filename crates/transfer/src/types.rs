use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uplink_protocol::{ChunkReceipt, PersistedState, ReceiptStatus, UploadStatus};

use crate::TransferError;
use crate::plan::ChunkPlan;

/// Opaque, caller-assigned session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-file upload state (thread-safe).
///
/// The remote handle slot moves Not-present → Pending → Concrete once per
/// transaction. [`reset`](Self::reset) swaps in a fresh slot so a later
/// attempt initiates a new transaction instead of reusing the stale one.
pub struct UploadSession {
    id: SessionId,
    file_name: String,
    path: PathBuf,
    container: String,
    plan: ChunkPlan,
    cancel: CancellationToken,
    key: OnceCell<String>,
    handle: Mutex<Arc<OnceCell<String>>>,
    cleanup_issued: AtomicBool,
    request_seq: AtomicU32,
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    status: UploadStatus,
    receipts: Vec<ChunkReceipt>,
    error: Option<String>,
    attempt: u32,
}

impl UploadSession {
    /// Creates a new pending session.
    pub fn new(
        id: SessionId,
        file_name: impl Into<String>,
        path: impl Into<PathBuf>,
        container: impl Into<String>,
        plan: ChunkPlan,
    ) -> Self {
        Self {
            id,
            file_name: file_name.into(),
            path: path.into(),
            container: container.into(),
            plan,
            cancel: CancellationToken::new(),
            key: OnceCell::new(),
            handle: Mutex::new(Arc::new(OnceCell::new())),
            cleanup_issued: AtomicBool::new(false),
            request_seq: AtomicU32::new(0),
            inner: RwLock::new(SessionInner {
                status: UploadStatus::Pending,
                receipts: Vec::new(),
                error: None,
                attempt: 0,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bucket or container the object is stored in.
    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn file_size(&self) -> u64 {
        self.plan.file_size()
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn status(&self) -> UploadStatus {
        self.inner.read().unwrap().status
    }

    /// Moves the session to `next`, rejecting transitions the lifecycle forbids.
    ///
    /// Returns `true` if the status changed and `false` if it already was
    /// `next`. Check and update happen under one lock, so of several callers
    /// racing to the same status exactly one sees `true`.
    pub fn transition(&self, next: UploadStatus) -> Result<bool, TransferError> {
        let mut s = self.inner.write().unwrap();
        if s.status == next {
            return Ok(false);
        }
        if !s.status.can_transition_to(next) {
            return Err(TransferError::InvalidTransition {
                from: s.status,
                to: next,
            });
        }
        debug!(session = %self.id, from = %s.status, to = %next, "status transition");
        s.status = next;
        Ok(true)
    }

    /// Marks the session as failed with an error message.
    ///
    /// Returns `true` if this call moved the session to `Failed`.
    pub fn fail(&self, err: &str) -> Result<bool, TransferError> {
        let changed = self.transition(UploadStatus::Failed)?;
        self.inner.write().unwrap().error = Some(err.to_string());
        Ok(changed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.read().unwrap().error.clone()
    }

    /// Starts a new attempt and returns its 1-based number.
    pub fn begin_attempt(&self) -> u32 {
        let mut s = self.inner.write().unwrap();
        s.attempt += 1;
        s.attempt
    }

    /// Next number in the per-session request sequence, starting at 1.
    ///
    /// Every outbound call draws a fresh number so retries never share a
    /// request id with the call they replace.
    pub fn next_request_seq(&self) -> u32 {
        self.request_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    // -- cancellation -------------------------------------------------------

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns `true` exactly once per session: the caller owns the cleanup request.
    pub fn claim_cleanup(&self) -> bool {
        !self.cleanup_issued.swap(true, Ordering::SeqCst)
    }

    // -- key ----------------------------------------------------------------

    /// Returns the resolved object key, if any.
    pub fn key(&self) -> Option<String> {
        self.key.get().cloned()
    }

    /// Returns the cached key, or runs `resolve` once to obtain it.
    ///
    /// The key survives resets; a restarted upload keeps the same object name.
    pub async fn key_or_resolve<F, Fut, E>(&self, resolve: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        self.key.get_or_try_init(resolve).await.cloned()
    }

    // -- remote handle ------------------------------------------------------

    /// Returns the current transaction id, if initiated.
    pub fn remote_handle(&self) -> Option<String> {
        self.handle.lock().unwrap().get().cloned()
    }

    /// Returns the transaction id, running `initiate` if none exists yet.
    ///
    /// Concurrent callers wait on the same in-flight call. If it fails the
    /// slot stays empty and the next caller runs `initiate` again.
    pub async fn handle_or_initiate<F, Fut, E>(&self, initiate: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let slot = Arc::clone(&self.handle.lock().unwrap());
        slot.get_or_try_init(initiate).await.cloned()
    }

    /// Discards the transaction id and every receipt.
    ///
    /// Moves the session to `ResetRequired`; the key is kept.
    pub fn reset(&self) -> Result<(), TransferError> {
        self.transition(UploadStatus::ResetRequired)?;
        *self.handle.lock().unwrap() = Arc::new(OnceCell::new());
        let mut s = self.inner.write().unwrap();
        let dropped = s.receipts.len();
        s.receipts.clear();
        debug!(session = %self.id, dropped, "session reset");
        Ok(())
    }

    // -- receipts -----------------------------------------------------------

    fn check_index(&self, index: u32) -> Result<(), TransferError> {
        if self.plan.descriptor(index).is_none() {
            return Err(TransferError::ChunkOutOfRange {
                index,
                chunks: self.plan.len(),
            });
        }
        Ok(())
    }

    /// Records that chunk `index` is being sent.
    ///
    /// A retried chunk keeps its existing receipt position.
    pub fn begin_chunk(&self, index: u32) -> Result<(), TransferError> {
        self.check_index(index)?;
        let mut s = self.inner.write().unwrap();
        if !s.receipts.iter().any(|r| r.index == index) {
            s.receipts.push(ChunkReceipt::pending(index));
        }
        Ok(())
    }

    /// Records the completion token the service returned for chunk `index`.
    pub fn ack_chunk(&self, index: u32, token: impl Into<String>) -> Result<(), TransferError> {
        self.check_index(index)?;
        let token = token.into();
        let mut s = self.inner.write().unwrap();
        match s.receipts.iter_mut().find(|r| r.index == index) {
            Some(receipt) => {
                receipt.token = token;
                receipt.status = ReceiptStatus::Acked;
            }
            None => s.receipts.push(ChunkReceipt {
                index,
                token,
                status: ReceiptStatus::Acked,
            }),
        }
        Ok(())
    }

    /// Returns `true` if chunk `index` already has an acked receipt.
    pub fn is_acked(&self, index: u32) -> bool {
        self.inner
            .read()
            .unwrap()
            .receipts
            .iter()
            .any(|r| r.index == index && r.is_acked())
    }

    /// Receipts in insertion order.
    pub fn receipts(&self) -> Vec<ChunkReceipt> {
        self.inner.read().unwrap().receipts.clone()
    }

    /// Acked receipts sorted ascending by chunk index.
    pub fn sorted_receipts(&self) -> Vec<ChunkReceipt> {
        let mut acked: Vec<ChunkReceipt> = self
            .inner
            .read()
            .unwrap()
            .receipts
            .iter()
            .filter(|r| r.is_acked())
            .cloned()
            .collect();
        acked.sort_by_key(|r| r.index);
        acked
    }

    pub fn acked_count(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .receipts
            .iter()
            .filter(|r| r.is_acked())
            .count()
    }

    /// Returns `true` when every planned chunk has an acked receipt.
    pub fn all_acked(&self) -> bool {
        self.acked_count() == self.plan.len()
    }

    // -- persistence --------------------------------------------------------

    /// Captures what is needed to resume after a restart.
    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            remote_handle: self.remote_handle(),
            key: self.key(),
            receipts: self.sorted_receipts(),
            file_size: self.plan.file_size(),
            chunk_size: self.plan.part_size(),
            container: self.container.clone(),
        }
    }

    /// Restores a persisted state into a fresh session.
    ///
    /// Returns `false` and leaves the session untouched if the state was
    /// recorded for a different file size, chunk size or container.
    pub fn restore(&self, state: PersistedState) -> bool {
        if state.file_size != self.plan.file_size()
            || state.chunk_size != self.plan.part_size()
            || state.container != self.container
        {
            debug!(session = %self.id, "persisted state does not match plan, ignoring");
            return false;
        }

        if let Some(key) = state.key {
            let _ = self.key.set(key);
        }
        if let Some(handle) = state.remote_handle {
            let _ = self.handle.lock().unwrap().set(handle);
        }

        let mut s = self.inner.write().unwrap();
        s.receipts = state
            .receipts
            .into_iter()
            .filter(|r| r.is_acked() && self.plan.descriptor(r.index).is_some())
            .collect();
        debug!(session = %self.id, receipts = s.receipts.len(), "restored persisted state");
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::plan::ChunkingConfig;

    fn session(size: u64, part: u64) -> UploadSession {
        let cfg = ChunkingConfig {
            enabled: true,
            part_size: part,
            min_file_size: 0,
        };
        let plan = ChunkPlan::compute(size, &cfg).unwrap();
        UploadSession::new("s1".into(), "a.bin", "/tmp/a.bin", "bucket", plan)
    }

    #[test]
    fn new_session_is_pending() {
        let s = session(10, 4);
        assert_eq!(s.status(), UploadStatus::Pending);
        assert_eq!(s.plan().len(), 3);
        assert!(s.receipts().is_empty());
        assert!(s.remote_handle().is_none());
    }

    #[test]
    fn receipts_sorted_regardless_of_ack_order() {
        let s = session(12, 4);
        for i in [2, 0, 1] {
            s.begin_chunk(i).unwrap();
        }
        s.ack_chunk(1, "t1").unwrap();
        s.ack_chunk(2, "t2").unwrap();
        assert!(!s.all_acked());
        s.ack_chunk(0, "t0").unwrap();
        assert!(s.all_acked());

        let order: Vec<u32> = s.receipts().iter().map(|r| r.index).collect();
        assert_eq!(order, vec![2, 0, 1]);
        let sorted: Vec<(u32, String)> = s
            .sorted_receipts()
            .into_iter()
            .map(|r| (r.index, r.token))
            .collect();
        assert_eq!(
            sorted,
            vec![(0, "t0".into()), (1, "t1".into()), (2, "t2".into())]
        );
    }

    #[test]
    fn ack_outside_plan_rejected() {
        let s = session(8, 4);
        assert!(matches!(
            s.ack_chunk(2, "x"),
            Err(TransferError::ChunkOutOfRange { index: 2, chunks: 2 })
        ));
        assert!(s.begin_chunk(5).is_err());
    }

    #[test]
    fn retried_chunk_keeps_single_receipt() {
        let s = session(8, 4);
        s.begin_chunk(0).unwrap();
        s.begin_chunk(0).unwrap();
        s.ack_chunk(0, "first").unwrap();
        s.ack_chunk(0, "second").unwrap();
        assert_eq!(s.receipts().len(), 1);
        assert_eq!(s.sorted_receipts()[0].token, "second");
        assert_eq!(s.acked_count(), 1);
    }

    #[test]
    fn illegal_transition_rejected() {
        let s = session(8, 4);
        let err = s.transition(UploadStatus::Finalizing).unwrap_err();
        assert!(matches!(err, TransferError::InvalidTransition { .. }));
        s.transition(UploadStatus::KeyResolving).unwrap();
        s.transition(UploadStatus::Canceled).unwrap();
        assert!(s.transition(UploadStatus::Failed).is_err());
    }

    #[test]
    fn racing_transitions_report_one_change() {
        let s = session(8, 4);
        let changed = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if s.transition(UploadStatus::KeyResolving).unwrap() {
                        changed.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(changed.load(Ordering::SeqCst), 1);
        assert!(!s.transition(UploadStatus::KeyResolving).unwrap());
    }

    #[test]
    fn fail_records_error_once() {
        let s = session(8, 4);
        assert!(s.fail("boom").unwrap());
        assert!(!s.fail("again").unwrap());
        assert_eq!(s.status(), UploadStatus::Failed);
        assert_eq!(s.last_error().as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn concurrent_initiate_runs_once() {
        let s = Arc::new(session(12, 4));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let s = Arc::clone(&s);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                s.handle_or_initiate(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok::<_, TransferError>("upload-1".to_string())
                })
                .await
                .unwrap()
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap(), "upload-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_initiate_leaves_slot_empty() {
        let s = session(12, 4);
        let res: Result<String, &str> = s.handle_or_initiate(|| async { Err("boom") }).await;
        assert!(res.is_err());
        assert!(s.remote_handle().is_none());
        let id = s
            .handle_or_initiate(|| async { Ok::<_, &str>("second".to_string()) })
            .await
            .unwrap();
        assert_eq!(id, "second");
    }

    #[tokio::test]
    async fn reset_discards_handle_and_receipts_keeps_key() {
        let s = session(12, 4);
        s.transition(UploadStatus::KeyResolving).unwrap();
        s.key_or_resolve(|| async { Ok::<_, ()>("k.bin".to_string()) })
            .await
            .unwrap();
        s.transition(UploadStatus::Initiating).unwrap();
        s.handle_or_initiate(|| async { Ok::<_, ()>("old".to_string()) })
            .await
            .unwrap();
        s.transition(UploadStatus::Transferring).unwrap();
        s.begin_chunk(0).unwrap();
        s.ack_chunk(0, "t0").unwrap();

        s.reset().unwrap();
        assert_eq!(s.status(), UploadStatus::ResetRequired);
        assert!(s.remote_handle().is_none());
        assert!(s.receipts().is_empty());
        assert_eq!(s.key().as_deref(), Some("k.bin"));

        let fresh = s
            .handle_or_initiate(|| async { Ok::<_, ()>("new".to_string()) })
            .await
            .unwrap();
        assert_eq!(fresh, "new");
    }

    #[test]
    fn cleanup_claimed_once() {
        let s = session(8, 4);
        assert!(s.claim_cleanup());
        assert!(!s.claim_cleanup());
    }

    #[test]
    fn snapshot_restore_carries_progress() {
        let a = session(12, 4);
        a.begin_chunk(1).unwrap();
        a.ack_chunk(1, "t1").unwrap();
        a.begin_chunk(2).unwrap();
        let state = a.snapshot();
        assert_eq!(state.receipts.len(), 1);

        let b = session(12, 4);
        assert!(b.restore(state));
        assert!(b.is_acked(1));
        assert!(!b.is_acked(2));
    }

    #[test]
    fn restore_rejects_mismatched_plan() {
        let a = session(12, 4);
        a.ack_chunk(0, "t0").unwrap();
        let state = a.snapshot();

        let b = session(12, 6);
        assert!(!b.restore(state));
        assert!(b.receipts().is_empty());
    }
}

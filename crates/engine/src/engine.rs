//! Upload engine.
//!
//! Drives each session through key resolution, initiation, bounded
//! concurrent chunk transfer, finalization and the optional success
//! notification. Failures are classified by the [`Coordinator`]; a reset
//! discards the transaction and every receipt and re-runs the session from
//! `Pending`.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uplink_protocol::UploadStatus;
use uplink_signer::{SasRequester, SignatureBroker, V4Signer};
use uplink_transfer::{
    ChunkDescriptor, ChunkPlan, ChunkingConfig, JsonFileStore, PersistenceAdapter, ProgressTracker,
    SessionId, SessionProgress, TransferError, UploadSession, read_range, validate_object_key,
};

use crate::backend::{AzureBackend, ChunkedUploadBackend, ContainerField, RequestContext, S3Backend};
use crate::config::{BackendConfig, EngineConfig, MAX_IN_FLIGHT};
use crate::coordinator::{Action, Coordinator, ExponentialBackoff, FailureLedger, RetryPolicy};
use crate::error::UploadError;
use crate::finalizer::{Finalized, Finalizer};
use crate::key::{KeyResolver, UuidKeyResolver};
use crate::notify::{SuccessNotifier, SuccessPayload};
use crate::store::{RunGuard, SessionStore};
use crate::transport::{ProgressFn, ReqwestTransport, Transport};
use crate::types::{UploadEvent, UploadOutcome};

const EVENT_BUFFER: usize = 1024;

/// Configures an [`UploadEngine`] around a backend.
pub struct EngineBuilder {
    backend: Arc<dyn ChunkedUploadBackend>,
    keys: Arc<dyn KeyResolver>,
    retry: Arc<dyn RetryPolicy>,
    chunking: ChunkingConfig,
    max_in_flight: usize,
    max_auth_failures: u32,
    extra_reset_codes: Vec<String>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    notifier: Option<SuccessNotifier>,
}

impl EngineBuilder {
    pub fn key_resolver(mut self, resolver: impl KeyResolver + 'static) -> Self {
        self.keys = Arc::new(resolver);
        self
    }

    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    pub fn chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    /// Concurrent chunk requests per session, clamped to `1..=6`.
    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n.clamp(1, MAX_IN_FLIGHT);
        self
    }

    pub fn max_auth_failures(mut self, n: u32) -> Self {
        self.max_auth_failures = n;
        self
    }

    pub fn extra_reset_codes(mut self, codes: impl IntoIterator<Item = String>) -> Self {
        self.extra_reset_codes.extend(codes);
        self
    }

    pub fn persistence(mut self, store: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: SuccessNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> UploadEngine {
        let mut coordinator = Coordinator::new(
            self.backend.reset_codes().iter().map(|c| c.to_string()),
            self.max_auth_failures,
        );
        coordinator.extend_reset_codes(self.extra_reset_codes);

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        UploadEngine {
            inner: Arc::new(EngineInner {
                backend: self.backend,
                keys: self.keys,
                retry: self.retry,
                coordinator,
                chunking: self.chunking,
                max_in_flight: self.max_in_flight,
                persistence: self.persistence,
                persist_lock: Arc::new(Mutex::new(())),
                notifier: self.notifier,
                sessions: SessionStore::new(),
                progress: Arc::new(ProgressTracker::new()),
                events_tx,
            }),
            events_rx: Some(events_rx),
        }
    }
}

/// Uploads files to the configured storage service.
pub struct UploadEngine {
    inner: Arc<EngineInner>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
}

struct EngineInner {
    backend: Arc<dyn ChunkedUploadBackend>,
    keys: Arc<dyn KeyResolver>,
    retry: Arc<dyn RetryPolicy>,
    coordinator: Coordinator,
    chunking: ChunkingConfig,
    max_in_flight: usize,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    /// Serializes writes to the persistence adapter.
    persist_lock: Arc<Mutex<()>>,
    notifier: Option<SuccessNotifier>,
    sessions: SessionStore,
    progress: Arc<ProgressTracker>,
    events_tx: mpsc::Sender<UploadEvent>,
}

impl UploadEngine {
    pub fn builder(backend: Arc<dyn ChunkedUploadBackend>) -> EngineBuilder {
        EngineBuilder {
            backend,
            keys: Arc::new(UuidKeyResolver::new()),
            retry: Arc::new(ExponentialBackoff::default()),
            chunking: ChunkingConfig::default(),
            max_in_flight: 3,
            max_auth_failures: 3,
            extra_reset_codes: Vec::new(),
            persistence: None,
            notifier: None,
        }
    }

    /// Builds an engine talking to real services as described by `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self, UploadError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(http.clone()));

        let backend: Arc<dyn ChunkedUploadBackend> = match &config.backend {
            BackendConfig::S3(s3) => {
                let signer = V4Signer::new(
                    http.clone(),
                    config.signature.clone(),
                    s3.access_key.clone(),
                    s3.region.clone(),
                )
                .with_clock_drift(chrono::Duration::seconds(s3.clock_drift_secs));
                let broker = Arc::new(SignatureBroker::new(Arc::new(signer)));
                Arc::new(S3Backend::new(
                    s3.clone(),
                    config.expected_status.s3,
                    broker,
                    transport,
                ))
            }
            BackendConfig::Azure(azure) => {
                let requester = SasRequester::new(http.clone(), config.signature.clone());
                let broker = Arc::new(SignatureBroker::new(Arc::new(requester)));
                Arc::new(AzureBackend::new(
                    azure.clone(),
                    config.expected_status.azure,
                    broker,
                    transport,
                ))
            }
        };

        let mut builder = Self::builder(backend)
            .chunking(config.chunking.clone())
            .max_in_flight(config.max_in_flight())
            .retry_policy(config.retry.backoff())
            .max_auth_failures(config.retry.max_auth_failures)
            .extra_reset_codes(config.extra_reset_codes.iter().cloned());

        if let Some(path) = config.resume_path() {
            builder = builder.persistence(Arc::new(JsonFileStore::new(path)?));
        }
        if let Some(success) = config.success.clone().filter(|s| !s.url.is_empty()) {
            builder = builder.notifier(SuccessNotifier::new(http, success));
        }
        Ok(builder.build())
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Registers `path` for upload under a fresh session id.
    pub async fn submit(
        &self,
        path: impl Into<PathBuf>,
        file_name: Option<String>,
    ) -> Result<SessionId, UploadError> {
        let id = SessionId::new(uuid::Uuid::new_v4().to_string());
        self.submit_with_id(id, path, file_name).await
    }

    /// Registers `path` under a caller-chosen id.
    ///
    /// When persistence is configured and holds state for `id` that matches
    /// the file, the upload resumes from the recorded receipts.
    pub async fn submit_with_id(
        &self,
        id: SessionId,
        path: impl Into<PathBuf>,
        file_name: Option<String>,
    ) -> Result<SessionId, UploadError> {
        let inner = &self.inner;
        let path = path.into();
        if inner.sessions.contains(&id) {
            return Err(UploadError::Precondition(format!("session {id} already exists")));
        }
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(UploadError::Precondition(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let file_name = match file_name {
            Some(name) => name,
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| UploadError::Precondition("path has no file name".into()))?,
        };

        let plan = ChunkPlan::compute(meta.len(), &inner.chunking)?;
        let session = Arc::new(UploadSession::new(
            id.clone(),
            file_name,
            path,
            inner.backend.container(),
            plan,
        ));
        inner.progress.track(&id, session.file_size());
        inner.restore(&session).await;

        info!(
            session = %id,
            file = %session.file_name(),
            size = session.file_size(),
            chunks = session.plan().len(),
            "upload submitted"
        );
        inner.sessions.insert(Arc::clone(&session));
        inner.emit(UploadEvent::StatusChanged {
            session: id.clone(),
            status: UploadStatus::Pending,
        });
        Ok(id)
    }

    /// Runs the upload for `id` to completion, failure or cancellation.
    pub async fn upload(&self, id: &SessionId) -> Result<UploadOutcome, UploadError> {
        let inner = &self.inner;
        let session = inner.sessions.get(id)?;
        let Some(_run) = RunGuard::acquire(&inner.sessions, id) else {
            return Err(UploadError::Precondition(format!("upload {id} is already running")));
        };
        if session.is_cancelled() {
            inner.stop(&session).await;
            return Err(UploadError::Cancelled);
        }
        let status = session.status();
        if status.is_terminal() {
            return Err(UploadError::Precondition(format!("session {id} is {status}")));
        }

        match inner.run(&session).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_cancelled() || session.is_cancelled() => {
                info!(session = %id, "upload cancelled");
                inner.stop(&session).await;
                Err(UploadError::Cancelled)
            }
            Err(e) => {
                inner.mark_failed(&session, &e);
                Err(e)
            }
        }
    }

    /// Requests cancellation of a pending or running upload.
    ///
    /// A running upload stops issuing chunks, waits for in-flight ones, then
    /// issues one cleanup request if anything reached the service.
    pub async fn cancel(&self, id: &SessionId) -> Result<(), UploadError> {
        let inner = &self.inner;
        let session = inner.sessions.get(id)?;
        let status = session.status();
        if status.is_terminal() {
            return Err(UploadError::Precondition(format!("session {id} is {status}")));
        }
        info!(session = %id, "cancel requested");
        inner.sessions.clear_suspended(id);
        session.request_cancel();
        if !inner.sessions.is_running(id) {
            inner.discard(&session).await;
        }
        Ok(())
    }

    /// Stops a pending or running upload without giving up on it.
    ///
    /// Unlike [`cancel`](Self::cancel) no cleanup request is sent and the
    /// persisted state is kept, so submitting the same file under the same
    /// id later resumes from the acked chunks. Without persistence, or for a
    /// file sent whole, there is nothing to resume from and this behaves
    /// like `cancel`.
    pub async fn suspend(&self, id: &SessionId) -> Result<(), UploadError> {
        let inner = &self.inner;
        let session = inner.sessions.get(id)?;
        let status = session.status();
        if status.is_terminal() {
            return Err(UploadError::Precondition(format!("session {id} is {status}")));
        }
        info!(session = %id, "suspend requested");
        inner.sessions.mark_suspended(id);
        session.request_cancel();
        if !inner.sessions.is_running(id) {
            inner.stop(&session).await;
        }
        Ok(())
    }

    /// Drops every trace of a session in any state, including its
    /// persisted state, cleaning up remotely when a transaction exists.
    pub async fn expunge(&self, id: &SessionId) -> Result<(), UploadError> {
        let inner = &self.inner;
        let session = inner.sessions.get(id)?;
        inner.sessions.clear_suspended(id);
        session.request_cancel();
        if inner.sessions.is_running(id) {
            debug!(session = %id, "expunge deferred to running upload");
            return Ok(());
        }
        inner.discard(&session).await;
        info!(session = %id, "session expunged");
        Ok(())
    }

    pub fn status(&self, id: &SessionId) -> Result<UploadStatus, UploadError> {
        Ok(self.inner.sessions.get(id)?.status())
    }

    /// Error message of a failed session.
    pub fn last_error(&self, id: &SessionId) -> Result<Option<String>, UploadError> {
        Ok(self.inner.sessions.get(id)?.last_error())
    }

    pub fn progress(&self, id: &SessionId) -> Option<SessionProgress> {
        self.inner.progress.snapshot(id)
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.inner.sessions.ids()
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> Result<(), UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

impl EngineInner {
    fn emit(&self, event: UploadEvent) {
        if self.events_tx.try_send(event).is_err() {
            debug!("event channel full or closed, event dropped");
        }
    }

    fn set_status(&self, session: &UploadSession, status: UploadStatus) -> Result<(), UploadError> {
        if !session.transition(status)? {
            return Ok(());
        }
        debug!(session = %session.id(), status = %status, "status changed");
        self.emit(UploadEvent::StatusChanged {
            session: session.id().clone(),
            status,
        });
        Ok(())
    }

    // -- persistence --------------------------------------------------------

    async fn restore(&self, session: &UploadSession) {
        let Some(store) = &self.persistence else {
            return;
        };
        match store.load(session.id()) {
            Ok(Some(state)) => {
                if session.restore(state) {
                    for receipt in session.sorted_receipts() {
                        if let Some(d) = session.plan().descriptor(receipt.index) {
                            self.progress.update(session.id(), d.index, d.size());
                        }
                    }
                    info!(session = %session.id(), acked = session.acked_count(), "resuming upload");
                } else {
                    self.forget(session.id()).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(session = %session.id(), error = %e, "failed to load resume state"),
        }
    }

    async fn persist(&self, session: &Arc<UploadSession>) {
        if !session.plan().is_chunked() {
            return;
        }
        let snapshot_of = Arc::clone(session);
        self.store_op(session.id(), "save", move |store| {
            store.save(snapshot_of.id(), &snapshot_of.snapshot())
        })
        .await;
    }

    async fn forget(&self, id: &SessionId) {
        let target = id.clone();
        self.store_op(id, "clear", move |store| store.clear(&target)).await;
    }

    /// Runs `op` against the persistence adapter on the blocking pool.
    ///
    /// Calls run one at a time. A save snapshots the session inside `op`, so
    /// the last write to land is also the newest state.
    async fn store_op<F>(&self, id: &SessionId, what: &'static str, op: F)
    where
        F: FnOnce(&dyn PersistenceAdapter) -> Result<(), TransferError> + Send + 'static,
    {
        let Some(store) = self.persistence.clone() else {
            return;
        };
        let lock = Arc::clone(&self.persist_lock);
        let outcome = tokio::task::spawn_blocking(move || {
            let _serial = lock.lock().unwrap();
            op(&*store)
        })
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = %id, op = what, error = %e, "resume state not updated"),
            Err(e) => warn!(session = %id, op = what, error = %e, "resume state task failed"),
        }
    }

    // -- attempt loop -------------------------------------------------------

    async fn run(self: &Arc<Self>, session: &Arc<UploadSession>) -> Result<UploadOutcome, UploadError> {
        let forbidden_resets = session.plan().is_chunked() && self.backend.forbidden_resets();
        let mut resets = 0u32;

        loop {
            let attempt = session.begin_attempt();
            let cancel = session.cancel_token().child_token();
            debug!(session = %session.id(), attempt, "starting attempt");

            let err = match self.run_attempt(session, &cancel).await {
                Ok(mut outcome) => {
                    outcome.resets = resets;
                    return Ok(outcome);
                }
                Err(e) => e,
            };
            cancel.cancel();

            match self.coordinator.settle(&err, forbidden_resets) {
                Action::Reset => {
                    resets += 1;
                    if !self.retry.should_retry(resets) {
                        warn!(session = %session.id(), resets, error = %err, "reset limit reached");
                        return Err(err);
                    }
                    self.reset(session, &err).await?;
                    sleep_or_cancel(&session.cancel_token(), self.retry.delay(resets)).await?;
                    self.set_status(session, UploadStatus::Pending)?;
                }
                Action::Cancel => return Err(UploadError::Cancelled),
                Action::Retry | Action::Fatal => return Err(err),
            }
        }
    }

    async fn reset(&self, session: &Arc<UploadSession>, cause: &UploadError) -> Result<(), UploadError> {
        warn!(session = %session.id(), error = %cause, "discarding transaction and restarting upload");
        session.reset()?;
        self.progress.clear(session.id());
        self.persist(session).await;
        self.emit(UploadEvent::StatusChanged {
            session: session.id().clone(),
            status: UploadStatus::ResetRequired,
        });
        self.emit(UploadEvent::Reset {
            session: session.id().clone(),
            reason: cause.to_string(),
        });
        Ok(())
    }

    async fn run_attempt(
        self: &Arc<Self>,
        session: &Arc<UploadSession>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        self.set_status(session, UploadStatus::KeyResolving)?;
        let key = self.resolve_key(session).await?;
        let ctx = RequestContext::new(Arc::clone(session), key, cancel.clone());

        let chunked = session.plan().is_chunked();
        let (finalized, etag) = if chunked {
            self.set_status(session, UploadStatus::Initiating)?;
            self.run_chunks(&ctx).await?;
            self.set_status(session, UploadStatus::Transferring)?;
            self.set_status(session, UploadStatus::Finalizing)?;
            let forbidden = self.backend.forbidden_resets();
            let finalized = self
                .retrying(&ctx, forbidden, "finalize", || {
                    Finalizer::finalize(&ctx, self.backend.as_ref())
                })
                .await?;
            (finalized, None)
        } else {
            self.set_status(session, UploadStatus::Transferring)?;
            let etag = self.run_whole(&ctx).await?;
            self.set_status(session, UploadStatus::Finalizing)?;
            let finalized = Finalized {
                container: session.container().to_string(),
                key: ctx.key.clone(),
                parts: 1,
            };
            (finalized, etag)
        };

        self.notify(&ctx, &finalized, etag).await?;
        self.set_status(session, UploadStatus::Complete)?;

        self.forget(session.id()).await;
        self.progress.untrack(session.id());
        self.sessions.remove(session.id());
        info!(
            session = %session.id(),
            key = %finalized.key,
            container = %finalized.container,
            parts = finalized.parts,
            "upload complete"
        );
        self.emit(UploadEvent::Completed {
            session: session.id().clone(),
            key: finalized.key.clone(),
            container: finalized.container.clone(),
        });

        Ok(UploadOutcome {
            session: session.id().clone(),
            key: finalized.key,
            container: finalized.container,
            parts: finalized.parts,
            bytes: session.file_size(),
            resets: 0,
        })
    }

    async fn resolve_key(&self, session: &UploadSession) -> Result<String, UploadError> {
        let key = session
            .key_or_resolve(|| self.keys.resolve(session.id(), session.file_name()))
            .await
            .map_err(|e| match e {
                UploadError::KeyResolution(_) => e,
                other => UploadError::KeyResolution(other.to_string()),
            })?;
        validate_object_key(&key).map_err(|e| UploadError::KeyResolution(e.to_string()))?;
        debug!(session = %session.id(), key = %key, "key resolved");
        Ok(key)
    }

    /// Runs `op` until it succeeds, fails in a way retrying cannot fix, or
    /// the retry policy gives up.
    async fn retrying<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        forbidden_resets: bool,
        what: &'static str,
        mut op: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        let mut ledger = FailureLedger::new(forbidden_resets);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if ctx.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if self.coordinator.classify(&err, &mut ledger) != Action::Retry
                || !self.retry.should_retry(attempt)
            {
                return Err(err);
            }
            let delay = self.retry.delay(attempt);
            warn!(
                session = %ctx.session.id(),
                op = what,
                chunk = ?err.chunk(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            sleep_or_cancel(&ctx.cancel, delay).await?;
        }
    }

    // -- transfer -----------------------------------------------------------

    /// Returns the transaction handle, initiating it on first use.
    ///
    /// Every worker calls this; only one initiate request is in flight per
    /// transaction. If it fails the attempt is cancelled so waiting workers
    /// do not initiate again. A new handle is persisted right away so a
    /// suspended upload can reuse the transaction before any chunk is acked.
    async fn ensure_handle(&self, ctx: &RequestContext) -> Result<Option<String>, UploadError> {
        if !self.backend.uses_transaction() {
            return Ok(None);
        }
        let forbidden = self.backend.forbidden_resets();
        let initiated = AtomicBool::new(false);
        let handle = ctx
            .session
            .handle_or_initiate(|| async {
                if ctx.cancel.is_cancelled() {
                    return Err(UploadError::Cancelled);
                }
                initiated.store(true, Ordering::SeqCst);
                let result = self
                    .retrying(ctx, forbidden, "initiate", || self.backend.initiate(ctx))
                    .await
                    .and_then(|h| {
                        h.ok_or(UploadError::Protocol(
                            uplink_protocol::ProtocolError::MissingElement("UploadId"),
                        ))
                    });
                if result.is_err() {
                    ctx.cancel.cancel();
                }
                result
            })
            .await?;
        if initiated.load(Ordering::SeqCst) {
            self.persist(&ctx.session).await;
        }
        Ok(Some(handle))
    }

    async fn run_chunks(self: &Arc<Self>, ctx: &RequestContext) -> Result<(), UploadError> {
        let session = &ctx.session;
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut workers = JoinSet::new();

        for descriptor in session.plan().descriptors().iter().copied() {
            if session.is_acked(descriptor.index) {
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            if ctx.cancel.is_cancelled() {
                break;
            }

            let inner = Arc::clone(self);
            let ctx = ctx.clone();
            workers.spawn(async move {
                let _permit = permit;
                let result = inner.run_chunk(&ctx, descriptor).await;
                if let Err(e) = &result {
                    if !e.is_cancelled() {
                        ctx.cancel.cancel();
                    }
                }
                result
            });
        }

        // Join barrier: nothing is finalized or retried while a chunk is in flight.
        let mut failure: Option<UploadError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(UploadError::Io(std::io::Error::other(format!(
                    "chunk worker failed: {e}"
                ))))
            });
            if let Err(err) = result {
                ctx.cancel.cancel();
                failure = match failure {
                    None => Some(err),
                    Some(prev) if prev.is_cancelled() && !err.is_cancelled() => Some(err),
                    keep => keep,
                };
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if ctx.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }

    async fn run_chunk(&self, ctx: &RequestContext, descriptor: ChunkDescriptor) -> Result<(), UploadError> {
        let session = &ctx.session;
        let index = descriptor.index;
        let handle = self.ensure_handle(ctx).await?;
        self.set_status(session, UploadStatus::Transferring)?;

        session.begin_chunk(index)?;
        let body = read_range(session.path(), &descriptor).await?;
        let progress = self.progress_fn(session.id(), index);
        let forbidden = self.backend.forbidden_resets();

        let token = self
            .retrying(ctx, forbidden, "chunk", || {
                self.progress.restart_chunk(session.id(), index);
                self.backend.upload_chunk(
                    ctx,
                    handle.as_deref(),
                    descriptor,
                    body.clone(),
                    Some(Arc::clone(&progress)),
                )
            })
            .await?;

        session.ack_chunk(index, token)?;
        self.progress.update(session.id(), index, descriptor.size());
        self.persist(session).await;
        let acked = session.acked_count();
        debug!(session = %session.id(), chunk = index, acked, "chunk acked");
        self.emit(UploadEvent::ChunkAcked {
            session: session.id().clone(),
            chunk: index,
            acked,
            total: session.plan().len(),
        });
        Ok(())
    }

    async fn run_whole(&self, ctx: &RequestContext) -> Result<Option<String>, UploadError> {
        let session = &ctx.session;
        let descriptor = session
            .plan()
            .descriptor(0)
            .copied()
            .ok_or_else(|| UploadError::Precondition("empty plan".into()))?;
        session.begin_chunk(0)?;
        let body = read_range(session.path(), &descriptor).await?;
        let progress = self.progress_fn(session.id(), 0);

        let etag = self
            .retrying(ctx, false, "whole", || {
                self.progress.restart_chunk(session.id(), 0);
                self.backend
                    .upload_whole(ctx, body.clone(), Some(Arc::clone(&progress)))
            })
            .await?;

        session.ack_chunk(0, etag.clone().unwrap_or_default())?;
        self.emit(UploadEvent::ChunkAcked {
            session: session.id().clone(),
            chunk: 0,
            acked: 1,
            total: 1,
        });
        Ok(etag)
    }

    fn progress_fn(&self, id: &SessionId, chunk: u32) -> ProgressFn {
        let tracker = Arc::clone(&self.progress);
        let events = self.events_tx.clone();
        let id = id.clone();
        Arc::new(move |sent| {
            if let Some(p) = tracker.update(&id, chunk, sent) {
                let _ = events.try_send(UploadEvent::ChunkProgress {
                    session: id.clone(),
                    chunk,
                    sent,
                    transferred: p.transferred,
                    total: p.total,
                });
            }
        })
    }

    async fn notify(
        &self,
        ctx: &RequestContext,
        finalized: &Finalized,
        etag: Option<String>,
    ) -> Result<(), UploadError> {
        let Some(notifier) = &self.notifier else {
            return Ok(());
        };
        let (bucket, container) = match self.backend.container_field() {
            ContainerField::Container => (None, Some(finalized.container.clone())),
            ContainerField::Bucket => (Some(finalized.container.clone()), None),
        };
        let payload = SuccessPayload {
            key: finalized.key.clone(),
            uuid: ctx.session.id().to_string(),
            name: ctx.session.file_name().to_string(),
            bucket,
            container,
            etag,
        };
        self.retrying(ctx, false, "notify", || notifier.notify(&payload))
            .await
    }

    // -- teardown -----------------------------------------------------------

    fn mark_failed(&self, session: &UploadSession, err: &UploadError) {
        error!(session = %session.id(), error = %err, "upload failed");
        if let Ok(true) = session.fail(&err.to_string()) {
            self.emit(UploadEvent::StatusChanged {
                session: session.id().clone(),
                status: UploadStatus::Failed,
            });
        }
        self.emit(UploadEvent::Failed {
            session: session.id().clone(),
            error: err.to_string(),
        });
    }

    /// Ends a cancelled session. A suspended one is released with its
    /// resume state intact when there is state to resume from; anything
    /// else is discarded.
    async fn stop(&self, session: &Arc<UploadSession>) {
        let resumable = self.persistence.is_some() && session.plan().is_chunked();
        if resumable && self.sessions.is_suspended(session.id()) {
            self.release(session);
        } else {
            self.discard(session).await;
        }
    }

    /// Drops the session from memory only; the remote transaction and the
    /// persisted state stay for a later resume.
    fn release(&self, session: &UploadSession) {
        let id = session.id().clone();
        let canceled = !session.status().is_terminal()
            && self.set_status(session, UploadStatus::Canceled).is_ok();

        self.progress.untrack(&id);
        self.sessions.remove(&id);
        info!(session = %id, acked = session.acked_count(), "upload suspended, resume state kept");
        if canceled {
            self.emit(UploadEvent::Canceled { session: id });
        }
    }

    /// Cancels the session, cleans up remotely and forgets it.
    async fn discard(&self, session: &Arc<UploadSession>) {
        let id = session.id().clone();
        let canceled = !session.status().is_terminal()
            && self.set_status(session, UploadStatus::Canceled).is_ok();

        self.cleanup(session).await;

        self.forget(&id).await;
        self.progress.untrack(&id);
        self.sessions.remove(&id);
        if canceled {
            self.emit(UploadEvent::Canceled { session: id });
        }
    }

    /// Issues at most one cleanup request per session, and only when
    /// something may exist remotely.
    async fn cleanup(&self, session: &Arc<UploadSession>) {
        let handle = session.remote_handle();
        if session.receipts().is_empty() && handle.is_none() {
            debug!(session = %session.id(), "nothing uploaded, no cleanup needed");
            return;
        }
        let Some(key) = session.key() else {
            return;
        };
        if !session.claim_cleanup() {
            return;
        }

        // Cleanup runs after the session token is cancelled, so it gets its own.
        let ctx = RequestContext::new(Arc::clone(session), key, CancellationToken::new());
        match self.backend.abort(&ctx, handle.as_deref()).await {
            Ok(()) => info!(session = %session.id(), "remote upload cleaned up"),
            Err(e) => warn!(session = %session.id(), error = %e, "cleanup request failed"),
        }
    }
}

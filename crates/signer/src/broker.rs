//! Signature broker: deduplicated access to the signing server.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::{debug, warn};

use crate::error::AuthorizationError;
use crate::request::{AuthorizationGrant, AuthorizationRequest, RequestId};

/// A trusted server that authorizes storage requests.
///
/// Implemented by [`V4Signer`](crate::V4Signer) and
/// [`SasRequester`](crate::SasRequester); tests substitute mocks.
pub trait SigningServer: Send + Sync {
    fn sign<'a>(
        &'a self,
        request: &'a AuthorizationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AuthorizationGrant, AuthorizationError>> + Send + 'a>>;
}

type PendingGrant = Shared<BoxFuture<'static, Result<AuthorizationGrant, AuthorizationError>>>;

/// Routes authorization requests to a [`SigningServer`].
///
/// Callers that present the same [`RequestId`] while a request is in flight
/// share its result. The entry is dropped as soon as it settles, so a grant
/// is never handed to a later request.
pub struct SignatureBroker {
    server: Arc<dyn SigningServer>,
    pending: Mutex<HashMap<RequestId, PendingGrant>>,
}

impl SignatureBroker {
    pub fn new(server: Arc<dyn SigningServer>) -> Self {
        Self {
            server,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Authorizes `request`, joining an in-flight call with the same id.
    pub async fn authorize(
        &self,
        request: AuthorizationRequest,
    ) -> Result<AuthorizationGrant, AuthorizationError> {
        let id = request.id.clone();
        let verb = request.verb.clone();

        let fut = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(&id) {
                Some(existing) => {
                    debug!(request = %id, "joining in-flight authorization");
                    existing.clone()
                }
                None => {
                    let server = Arc::clone(&self.server);
                    let fut = async move { server.sign(&request).await }
                        .boxed()
                        .shared();
                    pending.insert(id.clone(), fut.clone());
                    fut
                }
            }
        };

        let entry = PendingEntry {
            pending: &self.pending,
            id: &id,
            fut: fut.clone(),
        };
        let result = fut.await;
        drop(entry);

        let grant = result?;
        if grant.id != id || grant.verb != verb {
            warn!(request = %id, granted = %grant.id, "grant does not match request");
            return Err(AuthorizationError::InvalidResponse(format!(
                "grant for {} {} does not match request {} {}",
                grant.verb, grant.id, verb, id
            )));
        }
        Ok(grant)
    }
}

/// Removes an in-flight entry once its caller is done with it, including
/// when the caller's future is dropped before the grant arrives.
struct PendingEntry<'a> {
    pending: &'a Mutex<HashMap<RequestId, PendingGrant>>,
    id: &'a RequestId,
    fut: PendingGrant,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap();
        if pending.get(self.id).is_some_and(|f| f.ptr_eq(&self.fut)) {
            pending.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use reqwest::Method;

    use super::*;
    use crate::request::{CanonicalTarget, ContentDescriptor, Credential, Operation};

    struct MockServer {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl MockServer {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    impl SigningServer for MockServer {
        fn sign<'a>(
            &'a self,
            request: &'a AuthorizationRequest,
        ) -> Pin<Box<dyn Future<Output = Result<AuthorizationGrant, AuthorizationError>> + Send + 'a>>
        {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.seen.lock().unwrap().push(request.id.to_string());
                tokio::time::sleep(Duration::from_millis(10)).await;
                if self.fail {
                    return Err(AuthorizationError::Rejected {
                        status: 403,
                        body: "denied".into(),
                    });
                }
                Ok(AuthorizationGrant {
                    id: request.id.clone(),
                    verb: request.verb.clone(),
                    target: request.target.clone(),
                    content_sha256: request.content.sha256.clone(),
                    credential: Credential::Headers(vec![(
                        "Authorization".into(),
                        format!("sig-{}", request.id),
                    )]),
                })
            })
        }
    }

    fn request(op: Operation, attempt: u32) -> AuthorizationRequest {
        AuthorizationRequest {
            id: RequestId::new("file-1", op, attempt),
            verb: Method::PUT,
            target: CanonicalTarget::new("https://b.s3.amazonaws.com", "/k"),
            content: ContentDescriptor::default(),
            headers: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_id_shares_one_call() {
        let server = MockServer::new(false);
        let broker = SignatureBroker::new(server.clone());

        let (a, b) = tokio::join!(
            broker.authorize(request(Operation::Chunk(0), 1)),
            broker.authorize(request(Operation::Chunk(0), 1)),
        );
        assert_eq!(a.unwrap().credential, b.unwrap().credential);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_chunks_do_not_collide() {
        let server = MockServer::new(false);
        let broker = SignatureBroker::new(server.clone());

        let (a, b) = tokio::join!(
            broker.authorize(request(Operation::Chunk(0), 1)),
            broker.authorize(request(Operation::Chunk(1), 1)),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_ne!(a.credential, b.credential);
        assert_eq!(a.id.operation(), Operation::Chunk(0));
        assert_eq!(b.id.operation(), Operation::Chunk(1));
        assert_eq!(server.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn grants_not_cached_after_settling() {
        let server = MockServer::new(false);
        let broker = SignatureBroker::new(server.clone());

        broker.authorize(request(Operation::Initiate, 1)).await.unwrap();
        broker.authorize(request(Operation::Initiate, 1)).await.unwrap();
        assert_eq!(server.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_delivered_to_all_waiters() {
        let server = MockServer::new(true);
        let broker = SignatureBroker::new(server.clone());

        let (a, b) = tokio::join!(
            broker.authorize(request(Operation::Complete, 1)),
            broker.authorize(request(Operation::Complete, 1)),
        );
        assert!(matches!(a, Err(AuthorizationError::Rejected { status: 403, .. })));
        assert_eq!(a.unwrap_err(), b.unwrap_err());
        assert_eq!(server.seen.lock().unwrap().as_slice(), ["file-1.complete.1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_leaves_nothing_in_flight() {
        let server = MockServer::new(false);
        let broker = SignatureBroker::new(server.clone());

        let timed_out = tokio::time::timeout(
            Duration::from_millis(1),
            broker.authorize(request(Operation::Chunk(2), 1)),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(broker.in_flight(), 0);

        broker.authorize(request(Operation::Chunk(2), 1)).await.unwrap();
        assert_eq!(server.calls.load(Ordering::SeqCst), 2);
        assert_eq!(broker.in_flight(), 0);
    }

    struct WrongIdServer;

    impl SigningServer for WrongIdServer {
        fn sign<'a>(
            &'a self,
            request: &'a AuthorizationRequest,
        ) -> Pin<Box<dyn Future<Output = Result<AuthorizationGrant, AuthorizationError>> + Send + 'a>>
        {
            Box::pin(async move {
                Ok(AuthorizationGrant {
                    id: RequestId::new("other", Operation::Abort, 9),
                    verb: request.verb.clone(),
                    target: request.target.clone(),
                    content_sha256: String::new(),
                    credential: Credential::Headers(Vec::new()),
                })
            })
        }
    }

    #[tokio::test]
    async fn mismatched_grant_rejected() {
        let broker = SignatureBroker::new(Arc::new(WrongIdServer));
        let err = broker
            .authorize(request(Operation::Chunk(3), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorizationError::InvalidResponse(_)));
    }
}

//! Pending requests tracker
//!
//! Correlates requests forwarded through a tunnel with the response frames
//! that come back on the control channel. State is two-level: one table per
//! session, one entry per in-flight request, so sessions never contend with
//! each other.
//!
//! Every way an entry can end (response, deadline, session teardown, caller
//! giving up) goes through a single `DashMap::remove`. Whoever gets the entry
//! out of the map resolves it; everyone else sees `None` and backs off.

use crate::session::SessionId;
use burrow_proto::{RequestId, ResponseFrame, DEFAULT_REQUEST_TIMEOUT};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("Session {0} is closed")]
    SessionClosed(SessionId),
}

/// How a pending request ended
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Response(ResponseFrame),
    TimedOut,
    /// The session went away; carries the teardown reason
    Cancelled(String),
}

struct PendingEntry {
    subdomain: String,
    created_at: Instant,
    tx: oneshot::Sender<RequestOutcome>,
    timer: Option<AbortHandle>,
}

impl PendingEntry {
    fn resolve(self, outcome: RequestOutcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The receiver may already be gone; the entry is settled either way
        let _ = self.tx.send(outcome);
    }
}

#[derive(Default)]
struct SessionTable {
    requests: DashMap<RequestId, PendingEntry>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Tracks requests awaiting a response, per session
#[derive(Clone)]
pub struct PendingRequests {
    sessions: Arc<DashMap<SessionId, Arc<SessionTable>>>,
    default_timeout: Duration,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Create the request table for a new session
    ///
    /// Returns `false` if the session already had one.
    pub fn open_session(&self, session_id: SessionId) -> bool {
        let mut created = false;
        self.sessions.entry(session_id).or_insert_with(|| {
            created = true;
            Arc::new(SessionTable {
                next_id: AtomicU64::new(1),
                ..Default::default()
            })
        });
        if created {
            debug!("Opened request table for session {}", session_id);
        }
        created
    }

    fn table(&self, session_id: SessionId) -> Option<Arc<SessionTable>> {
        self.sessions.get(&session_id).map(|t| t.value().clone())
    }

    /// Register a new pending request
    ///
    /// Allocates the next request id for the session and arms a deadline
    /// timer (`timeout`, or the default when `None`). Must be called from
    /// within a tokio runtime.
    pub fn create_pending(
        &self,
        session_id: SessionId,
        subdomain: &str,
        timeout: Option<Duration>,
    ) -> Result<(RequestId, PendingResponse), CorrelatorError> {
        let table = self
            .table(session_id)
            .ok_or(CorrelatorError::SessionClosed(session_id))?;

        if table.closed.load(Ordering::SeqCst) {
            return Err(CorrelatorError::SessionClosed(session_id));
        }

        let id = RequestId(table.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();
        let deadline = created_at + timeout.unwrap_or(self.default_timeout);

        table.requests.insert(
            id,
            PendingEntry {
                subdomain: subdomain.to_string(),
                created_at,
                tx,
                timer: None,
            },
        );

        // Teardown may have started between the check and the insert
        if table.closed.load(Ordering::SeqCst) {
            table.requests.remove(&id);
            return Err(CorrelatorError::SessionClosed(session_id));
        }

        let timer = {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                this.expire(session_id, id);
            })
        };

        match table.requests.get_mut(&id) {
            Some(mut entry) => entry.timer = Some(timer.abort_handle()),
            // Already resolved
            None => timer.abort(),
        }

        trace!(
            "Registered pending request {} for session {} ({})",
            id,
            session_id,
            subdomain
        );

        Ok((
            id,
            PendingResponse {
                session_id,
                id,
                deadline,
                rx,
                correlator: self.clone(),
                settled: false,
            },
        ))
    }

    fn take(&self, session_id: SessionId, id: RequestId) -> Option<PendingEntry> {
        let table = self.table(session_id)?;
        let (_, entry) = table.requests.remove(&id)?;
        Some(entry)
    }

    /// Deliver a response frame
    ///
    /// Returns `true` if this call resolved the request, `false` if it was
    /// unknown or already resolved (late response after a timeout, etc).
    pub fn complete(&self, session_id: SessionId, id: RequestId, response: ResponseFrame) -> bool {
        match self.take(session_id, id) {
            Some(entry) => {
                debug!(
                    "Routing response for request {} ({}) after {:?}",
                    id,
                    entry.subdomain,
                    entry.created_at.elapsed()
                );
                entry.resolve(RequestOutcome::Response(response));
                true
            }
            None => {
                debug!(
                    "No pending request {} for session {}, dropping response",
                    id, session_id
                );
                false
            }
        }
    }

    /// Resolve a request as timed out
    pub fn expire(&self, session_id: SessionId, id: RequestId) -> bool {
        match self.take(session_id, id) {
            Some(entry) => {
                warn!(
                    "Request {} for {} timed out after {:?}",
                    id,
                    entry.subdomain,
                    entry.created_at.elapsed()
                );
                entry.resolve(RequestOutcome::TimedOut);
                true
            }
            None => false,
        }
    }

    /// Release an entry whose caller stopped waiting
    fn abandon(&self, session_id: SessionId, id: RequestId) -> bool {
        match self.take(session_id, id) {
            Some(entry) => {
                debug!("Request {} for {} abandoned by caller", id, entry.subdomain);
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Close the session's table and fail every request still pending on it
    ///
    /// Returns the number of requests cancelled. Later calls for the same
    /// session are no-ops returning 0.
    pub fn cancel_all(&self, session_id: SessionId, reason: &str) -> usize {
        let Some((_, table)) = self.sessions.remove(&session_id) else {
            return 0;
        };
        table.closed.store(true, Ordering::SeqCst);

        let ids: Vec<RequestId> = table.requests.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0;

        for id in ids {
            if let Some((_, entry)) = table.requests.remove(&id) {
                entry.resolve(RequestOutcome::Cancelled(reason.to_string()));
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            debug!(
                "Cancelled {} pending requests for session {}: {}",
                cancelled, session_id, reason
            );
        }
        cancelled
    }

    /// Whether the session still accepts new requests
    pub fn is_open(&self, session_id: SessionId) -> bool {
        self.table(session_id)
            .map(|t| !t.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Get count of pending requests for one session
    pub fn pending_count(&self, session_id: SessionId) -> usize {
        self.table(session_id)
            .map(|t| t.requests.len())
            .unwrap_or(0)
    }

    /// Get count of pending requests across all sessions
    pub fn total_pending(&self) -> usize {
        self.sessions.iter().map(|t| t.requests.len()).sum()
    }

    /// Number of sessions with an open table
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaitable side of a pending request
///
/// Dropping it before the outcome arrives removes the entry from the
/// tracker.
pub struct PendingResponse {
    session_id: SessionId,
    id: RequestId,
    deadline: Instant,
    rx: oneshot::Receiver<RequestOutcome>,
    correlator: PendingRequests,
    settled: bool,
}

impl PendingResponse {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the request to resolve
    ///
    /// Never waits past the deadline, even if the timer task was starved.
    pub async fn outcome(mut self) -> RequestOutcome {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => RequestOutcome::Cancelled("request tracker dropped".to_string()),
            Err(_) => {
                self.correlator.expire(self.session_id, self.id);
                // A response may have won the race against the local deadline
                self.rx.try_recv().unwrap_or(RequestOutcome::TimedOut)
            }
        };
        self.settled = true;
        outcome
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.settled {
            self.correlator.abandon(self.session_id, self.id);
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("session_id", &self.session_id)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(id: RequestId) -> ResponseFrame {
        ResponseFrame::text(id, 200, "ok")
    }

    fn tracker_with_session() -> (PendingRequests, SessionId) {
        let tracker = PendingRequests::new();
        let session = SessionId::new();
        assert!(tracker.open_session(session));
        (tracker, session)
    }

    #[tokio::test]
    async fn test_register_and_complete() {
        let (tracker, session) = tracker_with_session();

        let (id, pending) = tracker.create_pending(session, "abcd1234", None).unwrap();
        assert_eq!(tracker.pending_count(session), 1);
        assert_eq!(tracker.total_pending(), 1);

        assert!(tracker.complete(session, id, ok(id)));
        assert_eq!(tracker.pending_count(session), 0);

        assert_eq!(pending.outcome().await, RequestOutcome::Response(ok(id)));
    }

    #[tokio::test]
    async fn test_request_ids_are_monotonic_per_session() {
        let tracker = PendingRequests::new();
        let a = SessionId::new();
        let b = SessionId::new();
        tracker.open_session(a);
        tracker.open_session(b);

        let (a1, _p1) = tracker.create_pending(a, "aaa", None).unwrap();
        let (a2, _p2) = tracker.create_pending(a, "aaa", None).unwrap();
        let (b1, _p3) = tracker.create_pending(b, "bbb", None).unwrap();

        assert_eq!(a1, RequestId(1));
        assert_eq!(a2, RequestId(2));
        assert_eq!(b1, RequestId(1));
    }

    #[tokio::test]
    async fn test_open_session_is_once() {
        let (tracker, session) = tracker_with_session();
        assert!(!tracker.open_session(session));
        assert_eq!(tracker.session_count(), 1);
    }

    #[tokio::test]
    async fn test_completion_is_exactly_once() {
        let (tracker, session) = tracker_with_session();
        let (id, pending) = tracker.create_pending(session, "abcd1234", None).unwrap();

        assert!(tracker.complete(session, id, ok(id)));
        assert!(!tracker.complete(session, id, ResponseFrame::text(id, 500, "second")));
        assert!(!tracker.expire(session, id));
        assert_eq!(tracker.cancel_all(session, "closing"), 0);

        assert_eq!(pending.outcome().await, RequestOutcome::Response(ok(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out_at_deadline() {
        let (tracker, session) = tracker_with_session();
        let start = Instant::now();

        let (_, pending) = tracker.create_pending(session, "abcd1234", None).unwrap();
        assert_eq!(pending.outcome().await, RequestOutcome::TimedOut);

        let waited = start.elapsed();
        assert!(waited >= DEFAULT_REQUEST_TIMEOUT);
        assert!(waited < DEFAULT_REQUEST_TIMEOUT + Duration::from_secs(1));
        assert_eq!(tracker.pending_count(session), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_after_timeout_is_dropped() {
        let (tracker, session) = tracker_with_session();

        let (id, pending) = tracker
            .create_pending(session, "abcd1234", Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(pending.outcome().await, RequestOutcome::TimedOut);

        // Response arrives after the caller already got its 504
        assert!(!tracker.complete(session, id, ok(id)));
        assert_eq!(tracker.pending_count(session), 0);
        assert_eq!(tracker.total_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expires_entry_without_anyone_waiting() {
        let (tracker, session) = tracker_with_session();

        let (_, _pending) = tracker
            .create_pending(session, "abcd1234", Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(tracker.pending_count(session), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(tracker.pending_count(session), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_fails_every_pending_request() {
        let (tracker, session) = tracker_with_session();

        let (_, p1) = tracker.create_pending(session, "abcd1234", None).unwrap();
        let (id2, p2) = tracker.create_pending(session, "abcd1234", None).unwrap();

        assert_eq!(tracker.cancel_all(session, "channel closed"), 2);
        assert_eq!(
            p1.outcome().await,
            RequestOutcome::Cancelled("channel closed".to_string())
        );
        assert_eq!(
            p2.outcome().await,
            RequestOutcome::Cancelled("channel closed".to_string())
        );

        // Closed table refuses new work and ignores late responses
        assert!(!tracker.is_open(session));
        assert_eq!(
            tracker.create_pending(session, "abcd1234", None).unwrap_err(),
            CorrelatorError::SessionClosed(session)
        );
        assert!(!tracker.complete(session, id2, ok(id2)));
        assert_eq!(tracker.session_count(), 0);
        assert_eq!(tracker.cancel_all(session, "again"), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_leaves_other_sessions_alone() {
        let tracker = PendingRequests::new();
        let a = SessionId::new();
        let b = SessionId::new();
        tracker.open_session(a);
        tracker.open_session(b);

        let (_, _pa) = tracker.create_pending(a, "aaa", None).unwrap();
        let (id_b, pb) = tracker.create_pending(b, "bbb", None).unwrap();

        assert_eq!(tracker.cancel_all(a, "gone"), 1);
        assert_eq!(tracker.pending_count(b), 1);

        assert!(tracker.complete(b, id_b, ok(id_b)));
        assert_eq!(pb.outcome().await, RequestOutcome::Response(ok(id_b)));
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected() {
        let tracker = PendingRequests::new();
        let session = SessionId::new();

        assert_eq!(
            tracker.create_pending(session, "abcd1234", None).unwrap_err(),
            CorrelatorError::SessionClosed(session)
        );
        assert!(!tracker.complete(session, RequestId(1), ok(RequestId(1))));
    }

    #[tokio::test]
    async fn test_dropped_awaitable_releases_entry() {
        let (tracker, session) = tracker_with_session();

        let (id, pending) = tracker.create_pending(session, "abcd1234", None).unwrap();
        drop(pending);

        assert_eq!(tracker.pending_count(session), 0);
        assert!(!tracker.complete(session, id, ok(id)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_resolutions_have_one_winner() {
        let (tracker, session) = tracker_with_session();

        for _ in 0..50 {
            let (id, pending) = tracker.create_pending(session, "abcd1234", None).unwrap();

            let t1 = tracker.clone();
            let t2 = tracker.clone();
            let completer = tokio::spawn(async move { t1.complete(session, id, ok(id)) });
            let expirer = tokio::spawn(async move { t2.expire(session, id) });

            let completed = completer.await.unwrap();
            let expired = expirer.await.unwrap();
            assert!(completed ^ expired, "exactly one resolution must win");

            let outcome = pending.outcome().await;
            if completed {
                assert_eq!(outcome, RequestOutcome::Response(ok(id)));
            } else {
                assert_eq!(outcome, RequestOutcome::TimedOut);
            }
        }
        assert_eq!(tracker.pending_count(session), 0);
    }
}

//! Queries submitted in async mode.
//!
//! Submitting returns an [`AsyncQueryHandle`] right away. A spawned poller
//! follows the query to completion and reports exactly one outcome through
//! the handle.
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::errors::{Result, SnowflakeError};
use crate::query::{self, Query, QueryData, into_data, is_in_progress, poll_once, result_path};
use crate::req::{Envelope, RequestId};
use crate::retry::Endpoint;
use crate::session::SessionManager;

/// Lifecycle of an async query. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AsyncStatus {
    Submitted = 0,
    Polling = 1,
    Complete = 2,
    Failed = 3,
}

impl AsyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Submitted,
            1 => Self::Polling,
            2 => Self::Complete,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new() -> Self {
        Self(AtomicU8::new(AsyncStatus::Submitted as u8))
    }

    fn get(&self) -> AsyncStatus {
        AsyncStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Returns false if the transition would go backwards or leave a terminal
    /// state.
    fn advance(&self, to: AsyncStatus) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = AsyncStatus::from_u8(current);
                if current.is_terminal() || to <= current {
                    None
                } else {
                    Some(to as u8)
                }
            })
            .is_ok()
    }
}

/// What the caller wants back once the query is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultMode {
    /// Affected row count only.
    #[default]
    Exec,
    /// Result metadata, with the chunk downloader started.
    Rows,
    /// Result metadata, without fetching anything.
    RowsNoFetch,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    pub mode: ResultMode,
    /// Give up polling this long after submission.
    pub deadline: Option<Duration>,
    /// Statements in the submitted text. Required for batches, `Some(0)`
    /// accepts any count.
    pub multi_statement_count: Option<u32>,
}

impl SubmitOptions {
    pub fn rows() -> Self {
        Self {
            mode: ResultMode::Rows,
            ..Default::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_multi_statement_count(mut self, count: u32) -> Self {
        self.multi_statement_count = Some(count);
        self
    }
}

#[derive(Debug)]
pub enum AsyncOutcome {
    Exec {
        query_id: String,
        affected_rows: i64,
    },
    Rows {
        query_id: String,
        data: QueryData,
        /// Child results of a multi-statement query.
        children: Vec<QueryData>,
    },
}

impl AsyncOutcome {
    pub fn query_id(&self) -> &str {
        match self {
            Self::Exec { query_id, .. } | Self::Rows { query_id, .. } => query_id,
        }
    }
}

/// Starts downloading result chunks. Decoding them is somebody else's job.
#[async_trait]
pub trait ChunkDownloader: Sync + Send + Debug {
    async fn start(&self, data: &QueryData) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopChunkDownloader;

#[async_trait]
impl ChunkDownloader for NoopChunkDownloader {
    async fn start(&self, _data: &QueryData) -> Result<()> {
        Ok(())
    }
}

/// Placeholder for a query running in the background.
#[derive(Debug)]
pub struct AsyncQueryHandle {
    query_id: String,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<Result<AsyncOutcome>>,
}

impl AsyncQueryHandle {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn status(&self) -> AsyncStatus {
        self.status.get()
    }

    /// Ask the poller to stop. Takes effect before its next poll.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> Result<AsyncOutcome> {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.status.advance(AsyncStatus::Failed);
                Err(SnowflakeError::Internal(format!(
                    "poller for query {} exited without reporting",
                    self.query_id
                )))
            }
        }
    }
}

/// Submit `query` in async mode and spawn the poller.
pub(crate) async fn submit_async(
    session: Arc<SessionManager>,
    downloader: Arc<dyn ChunkDownloader>,
    query: Query,
    sequence_id: u64,
    opts: SubmitOptions,
) -> Result<AsyncQueryHandle> {
    let started = Instant::now();
    let request_id = RequestId::new();
    let res = query
        .submit(&session, request_id, sequence_id, true)
        .await?;

    if !res.success {
        return Err(query::query_failure(res));
    }

    let data = res.data.as_ref();
    let query_id = data
        .and_then(|d| d.query_id.clone())
        .ok_or_else(|| SnowflakeError::Internal("async submission returned no query id".to_string()))?;
    let result_url = data
        .and_then(|d| d.get_result_url.clone())
        .unwrap_or_else(|| result_path(&query_id));
    // A query can finish before the submission returns.
    let pending = if is_in_progress(&res) { None } else { Some(res) };

    let status = Arc::new(StatusCell::new());
    let cancel = CancellationToken::new();
    let (tx, rx) = oneshot::channel();

    let poller = Poller {
        session,
        downloader,
        query_id: query_id.clone(),
        request_id,
        sql: query.sql,
        result_url,
        opts,
        status: status.clone(),
        cancel: cancel.clone(),
        started,
    };
    let span = debug_span!("async_query", %query_id);
    tokio::spawn(poller.run(pending, tx).instrument(span));
    debug!(%query_id, "submitted async query");

    Ok(AsyncQueryHandle {
        query_id,
        status,
        cancel,
        outcome: rx,
    })
}

#[derive(Debug)]
struct Poller {
    session: Arc<SessionManager>,
    downloader: Arc<dyn ChunkDownloader>,
    query_id: String,
    request_id: RequestId,
    sql: String,
    result_url: String,
    opts: SubmitOptions,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
    started: Instant,
}

impl Poller {
    async fn run(
        self,
        pending: Option<Envelope<QueryData>>,
        tx: oneshot::Sender<Result<AsyncOutcome>>,
    ) {
        self.status.advance(AsyncStatus::Polling);

        let outcome = self.poll(pending, &tx).await;
        match &outcome {
            Ok(_) => {
                self.status.advance(AsyncStatus::Complete);
                debug!("async query complete");
            }
            Err(e) => {
                self.status.advance(AsyncStatus::Failed);
                warn!(%e, "async query failed");
            }
        }

        // Sending consumes the sender. The caller may have stopped listening.
        if tx.send(outcome).is_err() {
            trace!("async query handle dropped before outcome");
        }
    }

    async fn poll(
        &self,
        mut pending: Option<Envelope<QueryData>>,
        tx: &oneshot::Sender<Result<AsyncOutcome>>,
    ) -> Result<AsyncOutcome> {
        let base_policy = self.session.client().policy(Endpoint::Query);

        let res = loop {
            if let Some(res) = pending.take() {
                break res;
            }
            if self.cancel.is_cancelled() {
                self.abort().await;
                return Err(SnowflakeError::AsyncCancelled {
                    query_id: self.query_id.clone(),
                });
            }
            if tx.is_closed() {
                return Err(SnowflakeError::Internal(
                    "async query handle dropped".to_string(),
                ));
            }

            let mut policy = base_policy;
            if let Some(deadline) = self.opts.deadline {
                let remaining = deadline.saturating_sub(self.started.elapsed());
                if remaining.is_zero() {
                    return Err(self.deadline_exceeded(deadline).await);
                }
                let budget = base_policy
                    .total_timeout
                    .map_or(remaining, |total| total.min(remaining));
                policy = policy.with_total_timeout(Some(budget));
            }

            let res = match poll_once(&self.session, &self.result_url, &policy).await {
                Ok(res) => res,
                Err(SnowflakeError::RetryTimeout { .. }) if self.past_deadline() => {
                    let deadline = self.opts.deadline.unwrap_or_default();
                    return Err(self.deadline_exceeded(deadline).await);
                }
                Err(e) => return Err(e),
            };
            if !is_in_progress(&res) {
                break res;
            }
            trace!(progress = ?res.data.as_ref().and_then(|d| d.progress_desc.as_deref()), "query still running");
        };

        let data = into_data(res).map_err(|e| self.attach_query_id(e))?;
        let query_id = data
            .query_id
            .clone()
            .unwrap_or_else(|| self.query_id.clone());

        match self.opts.mode {
            ResultMode::Exec => {
                let affected_rows = query::affected_rows(&self.session, &data).await?;
                Ok(AsyncOutcome::Exec {
                    query_id,
                    affected_rows,
                })
            }
            ResultMode::Rows => {
                let children = if data.is_multi_statement() {
                    let children = query::fetch_children(&self.session, &data).await?;
                    for child in &children {
                        self.downloader.start(child).await?;
                    }
                    children
                } else {
                    self.downloader.start(&data).await?;
                    Vec::new()
                };
                Ok(AsyncOutcome::Rows {
                    query_id,
                    data,
                    children,
                })
            }
            ResultMode::RowsNoFetch => Ok(AsyncOutcome::Rows {
                query_id,
                data,
                children: Vec::new(),
            }),
        }
    }

    fn past_deadline(&self) -> bool {
        self.opts
            .deadline
            .is_some_and(|deadline| self.started.elapsed() >= deadline)
    }

    async fn deadline_exceeded(&self, deadline: Duration) -> SnowflakeError {
        self.abort().await;
        SnowflakeError::AsyncDeadlineExceeded {
            query_id: self.query_id.clone(),
            deadline,
        }
    }

    async fn abort(&self) {
        if let Err(e) = query::abort(&self.session, self.request_id, &self.sql).await {
            warn!(%e, "failed to abort async query");
        }
    }

    fn attach_query_id(&self, e: SnowflakeError) -> SnowflakeError {
        match e {
            SnowflakeError::QueryError {
                code,
                message,
                sql_state,
                query_id: None,
            } => SnowflakeError::QueryError {
                code,
                message,
                sql_state,
                query_id: Some(self.query_id.clone()),
            },
            e => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;
    use crate::errors::{QUERY_IN_PROGRESS_ASYNC_CODE, QUERY_IN_PROGRESS_CODE};
    use crate::query::{
        ABORT_ENDPOINT, QUERY_ENDPOINT, STATEMENT_TYPE_INSERT, STATEMENT_TYPE_MULTI_STATEMENT,
        STATEMENT_TYPE_SELECT, STATEMENT_TYPE_UPDATE,
    };
    use crate::session::tests::{test_client, test_tokens};
    use crate::testutil::{FnTransport, RecordedRequest, envelope};
    use crate::transport::{HttpResponse, Transport};

    #[derive(Debug, Default)]
    struct RecordingDownloader {
        started: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl ChunkDownloader for RecordingDownloader {
        async fn start(&self, data: &QueryData) -> Result<()> {
            self.started.lock().push(data.query_id.clone());
            Ok(())
        }
    }

    fn session(transport: Arc<dyn Transport>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(test_client(transport), test_tokens("tok")))
    }

    fn submitted(req: &RecordedRequest) -> Option<Result<HttpResponse>> {
        (req.url.path() == QUERY_ENDPOINT).then(|| {
            envelope(
                json!({"queryId": "q1", "getResultUrl": "/queries/q1/result"}),
                Some(QUERY_IN_PROGRESS_ASYNC_CODE),
                true,
            )
        })
    }

    #[test]
    fn status_only_moves_forward() {
        let cell = StatusCell::new();
        assert!(cell.advance(AsyncStatus::Polling));
        assert!(!cell.advance(AsyncStatus::Submitted));
        assert!(cell.advance(AsyncStatus::Complete));
        assert!(!cell.advance(AsyncStatus::Failed));
        assert_eq!(AsyncStatus::Complete, cell.get());

        let cell = StatusCell::new();
        assert!(cell.advance(AsyncStatus::Failed));
        assert!(!cell.advance(AsyncStatus::Polling));
        assert_eq!(AsyncStatus::Failed, cell.get());
    }

    #[tokio::test(start_paused = true)]
    async fn dml_completes_with_affected_rows() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let transport = Arc::new(FnTransport::new(move |req| {
            if let Some(res) = submitted(req) {
                return res;
            }
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => envelope(json!({"queryId": "q1"}), Some(QUERY_IN_PROGRESS_ASYNC_CODE), true),
                1 => envelope(json!({"queryId": "q1"}), Some(QUERY_IN_PROGRESS_CODE), true),
                _ => envelope(
                    json!({"queryId": "q1", "statementTypeId": STATEMENT_TYPE_UPDATE, "rowset": [["2", "3"]]}),
                    None,
                    true,
                ),
            }
        }));

        let handle = submit_async(
            session(transport.clone()),
            Arc::new(NoopChunkDownloader),
            Query::new("update t set a = 1"),
            1,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!("q1", handle.query_id());
        assert_eq!(AsyncStatus::Submitted, handle.status());

        let status = handle.status.clone();
        match handle.wait().await.unwrap() {
            AsyncOutcome::Exec {
                query_id,
                affected_rows,
            } => {
                assert_eq!("q1", query_id);
                assert_eq!(5, affected_rows);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(AsyncStatus::Complete, status.get());
        assert_eq!(3, transport.requests_to("/queries/q1/result").len());

        let submit = &transport.requests_to(QUERY_ENDPOINT)[0];
        assert_eq!(json!(true), submit.json_body()["asyncExec"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_reported_once() {
        let transport = Arc::new(FnTransport::new(|req| {
            if let Some(res) = submitted(req) {
                return res;
            }
            envelope(json!({"sqlState": "22012"}), Some("100051"), false)
        }));

        let handle = submit_async(
            session(transport),
            Arc::new(NoopChunkDownloader),
            Query::new("select 1/0"),
            1,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
        let status = handle.status.clone();

        match handle.wait().await.unwrap_err() {
            SnowflakeError::QueryError {
                code,
                sql_state,
                query_id,
                ..
            } => {
                assert_eq!("100051", code);
                assert_eq!(Some("22012".to_string()), sql_state);
                assert_eq!(Some("q1".to_string()), query_id);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(AsyncStatus::Failed, status.get());
    }

    fn never_finishes(req: &RecordedRequest) -> Result<HttpResponse> {
        if let Some(res) = submitted(req) {
            return res;
        }
        if req.url.path() == ABORT_ENDPOINT {
            return envelope(Value::Null, None, true);
        }
        envelope(json!({"queryId": "q1"}), Some(QUERY_IN_PROGRESS_ASYNC_CODE), true)
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_fails_handle_and_aborts() {
        let transport = Arc::new(
            FnTransport::new(never_finishes).with_delay(Duration::from_millis(100)),
        );

        let handle = submit_async(
            session(transport.clone()),
            Arc::new(NoopChunkDownloader),
            Query::new("select system$wait(100)"),
            1,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
        let status = handle.status.clone();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(AsyncStatus::Polling, status.get());
        handle.cancel();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, SnowflakeError::AsyncCancelled { ref query_id } if query_id == "q1"), "{err}");
        assert_eq!(AsyncStatus::Failed, status.get());

        let aborts = transport.requests_to(ABORT_ENDPOINT);
        assert_eq!(1, aborts.len());
        assert_eq!(json!("select system$wait(100)"), aborts[0].json_body()["sqlText"]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_handle() {
        let transport = Arc::new(
            FnTransport::new(never_finishes).with_delay(Duration::from_secs(1)),
        );

        let handle = submit_async(
            session(transport.clone()),
            Arc::new(NoopChunkDownloader),
            Query::new("select 1"),
            1,
            SubmitOptions::default().with_deadline(Duration::from_millis(4500)),
        )
        .await
        .unwrap();
        let status = handle.status.clone();

        let err = handle.wait().await.unwrap_err();
        assert!(
            matches!(err, SnowflakeError::AsyncDeadlineExceeded { deadline, .. } if deadline == Duration::from_millis(4500)),
            "{err}"
        );
        assert_eq!(AsyncStatus::Failed, status.get());
        assert_eq!(1, transport.requests_to(ABORT_ENDPOINT).len());
    }

    /// Every poll finds the session expired and renewal never answers.
    #[derive(Debug, Default)]
    struct StuckRenewal {
        renewals: AtomicUsize,
    }

    #[async_trait]
    impl Transport for StuckRenewal {
        async fn execute(&self, request: reqwest::Request) -> Result<HttpResponse> {
            let recorded = RecordedRequest {
                method: request.method().clone(),
                url: request.url().clone(),
                headers: request.headers().clone(),
                body: None,
            };
            if let Some(res) = submitted(&recorded) {
                return res;
            }
            match request.url().path() {
                ABORT_ENDPOINT => envelope(Value::Null, None, true),
                "/session/token-request" => {
                    self.renewals.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    envelope(Value::Null, None, true)
                }
                _ => envelope(Value::Null, Some(crate::errors::SESSION_EXPIRED_CODE), false),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_covers_session_renewal() {
        let transport = Arc::new(StuckRenewal::default());
        let deadline = Duration::from_secs(5);

        let start = Instant::now();
        let handle = submit_async(
            session(transport.clone()),
            Arc::new(NoopChunkDownloader),
            Query::new("select 1"),
            1,
            SubmitOptions::default().with_deadline(deadline),
        )
        .await
        .unwrap();

        let err = handle.wait().await.unwrap_err();
        let elapsed = start.elapsed();
        assert!(
            matches!(err, SnowflakeError::AsyncDeadlineExceeded { .. }),
            "{err}"
        );
        assert!(elapsed >= deadline, "elapsed: {elapsed:?}");
        assert!(elapsed < deadline + Duration::from_secs(1), "elapsed: {elapsed:?}");
        assert_eq!(1, transport.renewals.load(Ordering::SeqCst));
    }

    fn multi_statement_server(req: &RecordedRequest) -> Result<HttpResponse> {
        match req.url.path() {
            QUERY_ENDPOINT => envelope(
                json!({"queryId": "parent", "getResultUrl": "/queries/parent/result"}),
                Some(QUERY_IN_PROGRESS_ASYNC_CODE),
                true,
            ),
            "/queries/parent/result" => envelope(
                json!({
                    "queryId": "parent",
                    "statementTypeId": STATEMENT_TYPE_MULTI_STATEMENT,
                    "resultIds": "c1,c2,c3",
                }),
                None,
                true,
            ),
            "/queries/c1/result" => envelope(
                json!({"queryId": "c1", "statementTypeId": STATEMENT_TYPE_INSERT, "rowset": [["4"]]}),
                None,
                true,
            ),
            "/queries/c2/result" => envelope(
                json!({"queryId": "c2", "statementTypeId": STATEMENT_TYPE_SELECT, "rowset": [["1"]]}),
                None,
                true,
            ),
            "/queries/c3/result" => envelope(
                json!({"queryId": "c3", "statementTypeId": STATEMENT_TYPE_UPDATE, "rowset": [["6"]]}),
                None,
                true,
            ),
            other => panic!("unexpected path {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn multi_statement_exec_sums_children() {
        let transport = Arc::new(FnTransport::new(multi_statement_server));
        let handle = submit_async(
            session(transport),
            Arc::new(NoopChunkDownloader),
            Query::new("insert ...; select ...; update ..."),
            1,
            SubmitOptions::default(),
        )
        .await
        .unwrap();

        match handle.wait().await.unwrap() {
            AsyncOutcome::Exec { affected_rows, .. } => assert_eq!(10, affected_rows),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn multi_statement_rows_start_downloads() {
        let transport = Arc::new(FnTransport::new(multi_statement_server));
        let downloader = Arc::new(RecordingDownloader::default());
        let handle = submit_async(
            session(transport),
            downloader.clone(),
            Query::new("select 1; select 2; select 3"),
            1,
            SubmitOptions::rows(),
        )
        .await
        .unwrap();

        match handle.wait().await.unwrap() {
            AsyncOutcome::Rows {
                query_id, children, ..
            } => {
                assert_eq!("parent", query_id);
                assert_eq!(3, children.len());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            vec![Some("c1".to_string()), Some("c2".to_string()), Some("c3".to_string())],
            *downloader.started.lock()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_fetch_skips_downloader() {
        let transport = Arc::new(FnTransport::new(|req| {
            if let Some(res) = submitted(req) {
                return res;
            }
            envelope(json!({"queryId": "q1", "total": 3}), None, true)
        }));
        let downloader = Arc::new(RecordingDownloader::default());
        let handle = submit_async(
            session(transport),
            downloader.clone(),
            Query::new("select 1"),
            1,
            SubmitOptions {
                mode: ResultMode::RowsNoFetch,
                deadline: None,
                multi_statement_count: None,
            },
        )
        .await
        .unwrap();

        match handle.wait().await.unwrap() {
            AsyncOutcome::Rows { data, .. } => assert_eq!(Some(3), data.total),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(downloader.started.lock().is_empty());
    }
}

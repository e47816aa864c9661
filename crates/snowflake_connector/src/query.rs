use std::collections::HashMap;
use std::fmt;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::errors::{
    QUERY_IN_PROGRESS_ASYNC_CODE, QUERY_IN_PROGRESS_CODE, Result, SnowflakeError,
};
use crate::req::{Envelope, RequestId, RequestIdParams};
use crate::retry::{Endpoint, RetryPolicy};
use crate::session::SessionManager;

pub const QUERY_ENDPOINT: &str = "/queries/v1/query-request";
pub const ABORT_ENDPOINT: &str = "/queries/v1/abort-request";
const MONITORING_ENDPOINT: &str = "/monitoring/queries";

pub const STATEMENT_TYPE_SELECT: i64 = 0x1000;
pub const STATEMENT_TYPE_MULTI_STATEMENT: i64 = 0xA000;
pub const STATEMENT_TYPE_DML: i64 = 0x3000;
pub const STATEMENT_TYPE_INSERT: i64 = STATEMENT_TYPE_DML + 0x100;
pub const STATEMENT_TYPE_UPDATE: i64 = STATEMENT_TYPE_DML + 0x200;
pub const STATEMENT_TYPE_DELETE: i64 = STATEMENT_TYPE_DML + 0x300;
pub const STATEMENT_TYPE_MERGE: i64 = STATEMENT_TYPE_DML + 0x400;
pub const STATEMENT_TYPE_MULTI_TABLE_INSERT: i64 = STATEMENT_TYPE_DML + 0x500;

pub fn result_path(query_id: &str) -> String {
    format!("/queries/{query_id}/result")
}

#[derive(Debug, Serialize, Clone)]
pub struct QueryBindParameter {
    #[serde(rename = "type")]
    pub r#type: String,
    pub value: serde_json::Value,
}

impl QueryBindParameter {
    pub fn new(r#type: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            r#type: r#type.into(),
            value,
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct QueryBodyParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    multi_statement_count: Option<u32>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    sql_text: &'a str,
    async_exec: bool,
    sequence_id: u64,
    is_internal: bool,
    describe_only: bool,
    parameters: QueryBodyParameters,

    #[serde(skip_serializing_if = "Option::is_none")]
    bindings: Option<HashMap<String, &'a QueryBindParameter>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryParams {
    request_id: RequestId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AbortBody<'a> {
    sql_text: &'a str,
    request_id: RequestId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryDataRowType {
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub nullable: bool,
    pub precision: Option<i64>,
    pub scale: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResultChunkMeta {
    pub url: String,
    pub row_count: i64,
    #[serde(default)]
    pub uncompressed_size: i64,
    #[serde(default)]
    pub compressed_size: i64,
}

/// The `data` part of a query response.
///
/// Results themselves are left undecoded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryData {
    pub query_id: Option<String>,
    pub sql_state: Option<String>,
    pub statement_type_id: Option<i64>,
    pub total: Option<i64>,
    pub returned: Option<i64>,

    pub rowtype: Option<Vec<QueryDataRowType>>,
    pub rowset: Option<Vec<Vec<Option<String>>>>,
    pub rowset_base64: Option<String>,
    pub query_result_format: Option<String>,
    pub chunks: Option<Vec<QueryResultChunkMeta>>,
    pub qrmk: Option<String>,
    pub chunk_headers: Option<HashMap<String, String>>,

    pub get_result_url: Option<String>,
    pub progress_desc: Option<String>,
    pub query_aborts_after_secs: Option<i64>,
    pub result_ids: Option<String>,
    pub result_types: Option<String>,
}

impl QueryData {
    pub fn is_dml(&self) -> bool {
        self.statement_type_id.is_some_and(is_dml)
    }

    /// Multi-statement batches either say so, or come back as a select with
    /// child result ids.
    pub fn is_multi_statement(&self) -> bool {
        let has_children = self.result_ids.as_deref().is_some_and(|ids| !ids.is_empty());
        match self.statement_type_id {
            Some(STATEMENT_TYPE_MULTI_STATEMENT) => true,
            Some(STATEMENT_TYPE_SELECT) => has_children,
            _ => false,
        }
    }

    /// Ids of child results of a multi-statement query.
    pub fn child_result_ids(&self) -> Vec<&str> {
        self.result_ids
            .as_deref()
            .map(|ids| ids.split(',').map(str::trim).filter(|id| !id.is_empty()).collect())
            .unwrap_or_default()
    }

    /// Affected rows of a DML statement, the sum of the columns of the first
    /// row.
    pub fn update_rows(&self) -> Result<i64> {
        let Some(row) = self.rowset.as_ref().and_then(|rows| rows.first()) else {
            return Ok(0);
        };
        let mut count = 0;
        for val in row.iter().flatten() {
            let v: i64 = val.parse().map_err(|_| {
                SnowflakeError::Internal(format!("affected row count '{val}' is not an integer"))
            })?;
            count += v;
        }
        Ok(count)
    }
}

pub fn is_dml(statement_type_id: i64) -> bool {
    (STATEMENT_TYPE_INSERT..=STATEMENT_TYPE_MULTI_TABLE_INSERT).contains(&statement_type_id)
}

/// Whether the response says the query hasn't finished yet.
pub fn is_in_progress<T>(res: &Envelope<T>) -> bool {
    res.success
        && (res.has_code(QUERY_IN_PROGRESS_CODE) || res.has_code(QUERY_IN_PROGRESS_ASYNC_CODE))
}

/// Turn a terminal response into its data or a query error.
pub fn into_data(res: Envelope<QueryData>) -> Result<QueryData> {
    if !res.success {
        return Err(query_failure(res));
    }
    Ok(res.data.unwrap_or_default())
}

/// Error for an unsuccessful response.
pub fn query_failure(res: Envelope<QueryData>) -> SnowflakeError {
    let (sql_state, query_id) = match res.data {
        Some(data) => (data.sql_state, data.query_id),
        None => (None, None),
    };
    SnowflakeError::query_error(res.code, res.message, sql_state, query_id)
}

#[derive(Debug)]
pub struct Query {
    pub sql: String,
    pub bindings: Vec<QueryBindParameter>,
    /// Number of statements when submitting a multi-statement query. `Some(0)`
    /// accepts any count.
    pub multi_statement_count: Option<u32>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bindings: Vec::new(),
            multi_statement_count: None,
        }
    }

    pub fn with_bindings(mut self, bindings: Vec<QueryBindParameter>) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_multi_statement_count(mut self, count: u32) -> Self {
        self.multi_statement_count = Some(count);
        self
    }

    fn body(&self, sequence_id: u64, async_exec: bool) -> QueryBody<'_> {
        let bindings = if self.bindings.is_empty() {
            None
        } else {
            Some(
                self.bindings
                    .iter()
                    .enumerate()
                    .map(|(idx, b)| ((idx + 1).to_string(), b))
                    .collect(),
            )
        };

        QueryBody {
            sql_text: &self.sql,
            async_exec,
            sequence_id,
            parameters: QueryBodyParameters {
                multi_statement_count: self.multi_statement_count,
            },
            bindings,
            ..Default::default()
        }
    }

    /// Submit the query. Returns the raw response, which may still be in
    /// progress.
    pub async fn submit(
        &self,
        session: &SessionManager,
        request_id: RequestId,
        sequence_id: u64,
        async_exec: bool,
    ) -> Result<Envelope<QueryData>> {
        let policy = session.client().policy(Endpoint::Query);
        let body = self.body(sequence_id, async_exec);
        debug!(%request_id, sequence_id, async_exec, "submitting query");
        session
            .execute_json(
                Method::POST,
                QUERY_ENDPOINT,
                Some(&QueryParams { request_id }),
                Some(&body),
                &policy,
            )
            .await
    }

    /// Submit synchronously, polling inline if the server hands back a
    /// result url instead of a result.
    pub async fn exec_sync(
        &self,
        session: &SessionManager,
        request_id: RequestId,
        sequence_id: u64,
    ) -> Result<QueryData> {
        let res = self.submit(session, request_id, sequence_id, false).await?;
        if !is_in_progress(&res) {
            return into_data(res);
        }

        let url = res
            .data
            .and_then(|d| d.get_result_url)
            .ok_or_else(|| SnowflakeError::Internal("in progress response without result url".to_string()))?;
        let policy = session.client().policy(Endpoint::Query);
        poll_until_done(session, &url, &policy).await
    }
}

/// Single GET against a result url.
pub(crate) async fn poll_once(
    session: &SessionManager,
    url: &str,
    policy: &RetryPolicy,
) -> Result<Envelope<QueryData>> {
    session
        .execute_json(
            Method::GET,
            url,
            Some(&RequestIdParams::new()),
            None::<&()>,
            policy,
        )
        .await
}

async fn poll_until_done(
    session: &SessionManager,
    url: &str,
    policy: &RetryPolicy,
) -> Result<QueryData> {
    loop {
        let res = poll_once(session, url, policy).await?;
        if !is_in_progress(&res) {
            return into_data(res);
        }
        trace!(url, "query still in progress");
    }
}

/// Fetch every child result of a multi-statement query.
pub async fn fetch_children(session: &SessionManager, data: &QueryData) -> Result<Vec<QueryData>> {
    let mut children = Vec::new();
    for id in data.child_result_ids() {
        trace!(child = id, "fetching child result");
        children.push(fetch_result(session, id).await?);
    }
    Ok(children)
}

/// Affected rows of a finished statement. Multi-statement queries sum over
/// their DML children.
pub async fn affected_rows(session: &SessionManager, data: &QueryData) -> Result<i64> {
    if data.is_dml() {
        return data.update_rows();
    }
    if !data.is_multi_statement() {
        return Ok(0);
    }
    let mut total = 0;
    for child in fetch_children(session, data).await? {
        if child.is_dml() {
            total += child.update_rows()?;
        }
    }
    Ok(total)
}

/// Best-effort abort of a running request.
pub async fn abort(session: &SessionManager, request_id: RequestId, sql: &str) -> Result<()> {
    let policy = session.client().policy(Endpoint::Generic);
    let body = AbortBody {
        sql_text: sql,
        request_id,
    };
    let res: Envelope<serde_json::Value> = session
        .execute_json(
            Method::POST,
            ABORT_ENDPOINT,
            Some(&RequestIdParams::new()),
            Some(&body),
            &policy,
        )
        .await?;
    if !res.success {
        return Err(SnowflakeError::query_error(
            res.code, res.message, None, None,
        ));
    }
    debug!(%request_id, "aborted request");
    Ok(())
}

/// Fetch the result of a query by id.
pub async fn fetch_result(session: &SessionManager, query_id: &str) -> Result<QueryData> {
    let policy = session.client().policy(Endpoint::Query);
    let res = poll_once(session, &result_path(query_id), &policy).await?;
    let mut data = into_data(res).map_err(|e| match e {
        SnowflakeError::QueryError {
            code,
            message,
            sql_state,
            query_id: None,
        } => SnowflakeError::QueryError {
            code,
            message,
            sql_state,
            query_id: Some(query_id.to_string()),
        },
        e => e,
    })?;
    data.query_id.get_or_insert_with(|| query_id.to_string());
    Ok(data)
}

/// Server side state of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Running,
    Aborting,
    Success,
    FailedWithError,
    Aborted,
    Queued,
    FailedWithIncident,
    Disconnected,
    ResumingWarehouse,
    QueuedRepairingWarehouse,
    Restarted,
    Blocked,
    NoData,
}

impl QueryStatus {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Running
                | Self::ResumingWarehouse
                | Self::Queued
                | Self::QueuedRepairingWarehouse
                | Self::NoData
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Aborting
                | Self::FailedWithError
                | Self::Aborted
                | Self::FailedWithIncident
                | Self::Disconnected
                | Self::Blocked
        )
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Aborting => "ABORTING",
            Self::Success => "SUCCESS",
            Self::FailedWithError => "FAILED_WITH_ERROR",
            Self::Aborted => "ABORTED",
            Self::Queued => "QUEUED",
            Self::FailedWithIncident => "FAILED_WITH_INCIDENT",
            Self::Disconnected => "DISCONNECTED",
            Self::ResumingWarehouse => "RESUMING_WAREHOUSE",
            Self::QueuedRepairingWarehouse => "QUEUED_REPAIRING_WAREHOUSE",
            Self::Restarted => "RESTARTED",
            Self::Blocked => "BLOCKED",
            Self::NoData => "NO_DATA",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitoredQuery {
    status: QueryStatus,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    error_code: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MonitoringData {
    #[serde(default)]
    queries: Vec<MonitoredQuery>,
}

/// Ask the monitoring endpoint for the status of a query.
///
/// A query the server reports with an error code is returned as an error.
pub async fn query_status(session: &SessionManager, query_id: &str) -> Result<QueryStatus> {
    let policy = session.client().policy(Endpoint::Generic);
    let res: Envelope<MonitoringData> = session
        .execute_json(
            Method::GET,
            &format!("{MONITORING_ENDPOINT}/{query_id}"),
            None::<&()>,
            None::<&()>,
            &policy,
        )
        .await?;

    let query = match res.data.map(|d| d.queries) {
        Some(queries) if res.success => queries.into_iter().next(),
        _ => None,
    };
    let Some(query) = query else {
        return Err(SnowflakeError::query_error(
            res.code,
            Some("status query returned not-success or no status".to_string()),
            None,
            Some(query_id.to_string()),
        ));
    };

    let error_code = match query.error_code {
        Some(serde_json::Value::Number(n)) if n.as_i64() != Some(0) => Some(n.to_string()),
        Some(serde_json::Value::String(s)) if !s.is_empty() && s != "0" => Some(s),
        _ => None,
    };
    if let Some(code) = error_code {
        return Err(SnowflakeError::QueryError {
            code,
            message: query.error_message.unwrap_or_default(),
            sql_state: None,
            query_id: Some(query_id.to_string()),
        });
    }

    Ok(query.status)
}

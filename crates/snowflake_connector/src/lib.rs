use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;
use url::Url;

use crate::async_query::{AsyncQueryHandle, ChunkDownloader, NoopChunkDownloader, SubmitOptions};
use crate::auth::{AuthOptions, Authenticator, PasswordAuthenticator};
use crate::config::ClientConfig;
use crate::credentials::CredentialCache;
use crate::errors::{Result, SnowflakeError};
use crate::heartbeat::{Heartbeat, HeartbeatHandle};
use crate::query::{Query, QueryBindParameter, QueryData, QueryStatus};
use crate::req::{RequestId, SnowflakeClient};
use crate::retry::{RetryPolicy, RetryRequest};
use crate::session::{SessionManager, SessionTokens};
use crate::transport::{HttpResponse, ReqwestTransport, Transport};

pub mod async_query;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod heartbeat;
pub mod query;
pub mod req;
pub mod retry;
pub mod session;
pub mod single_flight;
pub mod transport;

#[cfg(test)]
mod testutil;

pub struct ConnectionBuilder {
    account_name: String,
    login_name: String,

    password: Option<String>,
    database_name: Option<String>,
    schema_name: Option<String>,
    warehouse: Option<String>,
    role_name: Option<String>,

    base_url: Option<String>,
    config: Option<ClientConfig>,
    transport: Option<Arc<dyn Transport>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    tokens: Option<SessionTokens>,
    credential_cache: Option<Arc<dyn CredentialCache>>,
    chunk_downloader: Option<Arc<dyn ChunkDownloader>>,
}

macro_rules! builder_fn {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, $name: $ty) -> Self {
            self.$name = Some($name);
            self
        }
    };
}

impl ConnectionBuilder {
    builder_fn! {password, String}

    builder_fn! {database_name, String}

    builder_fn! {schema_name, String}

    builder_fn! {warehouse, String}

    builder_fn! {role_name, String}

    builder_fn! {base_url, String}

    builder_fn! {config, ClientConfig}

    builder_fn! {transport, Arc<dyn Transport>}

    builder_fn! {authenticator, Arc<dyn Authenticator>}

    builder_fn! {tokens, SessionTokens}

    builder_fn! {credential_cache, Arc<dyn CredentialCache>}

    builder_fn! {chunk_downloader, Arc<dyn ChunkDownloader>}

    pub fn new(account_name: String, login_name: String) -> Self {
        Self {
            account_name,
            login_name,

            password: None,
            database_name: None,
            schema_name: None,
            warehouse: None,
            role_name: None,

            base_url: None,
            config: None,
            transport: None,
            authenticator: None,
            tokens: None,
            credential_cache: None,
            chunk_downloader: None,
        }
    }

    pub async fn build(self) -> Result<Connection> {
        if self.account_name.is_empty() || self.login_name.is_empty() {
            return Err(SnowflakeError::InvalidConnectionParameters(
                "account_name and login_name cannot be empty".to_string(),
            ));
        }

        let url = self
            .base_url
            .unwrap_or_else(|| format!("https://{}.snowflakecomputing.com:443", self.account_name));
        let url = Url::parse(&url).map_err(|e| SnowflakeError::UrlParseError(format!("{e}")))?;
        let host = url.host_str().unwrap_or_default().to_string();

        let config = self.config.unwrap_or_default();
        if config.keep_session_alive && config.heartbeat_interval.is_zero() {
            return Err(SnowflakeError::InvalidConnectionParameters(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                ReqwestTransport::builder()
                    .connect_timeout(config.connect_timeout)
                    .build()?,
            ),
        };
        let client = SnowflakeClient::new(url, transport, config.clone());

        let tokens = match (self.tokens, self.authenticator) {
            (Some(tokens), _) => tokens,
            (None, Some(auth)) => auth.authenticate(&client).await?,
            (None, None) => {
                let password =
                    self.password
                        .ok_or(SnowflakeError::InvalidConnectionParameters(
                            "password is required for default authentication".to_string(),
                        ))?;
                let auth = PasswordAuthenticator {
                    account_name: self.account_name,
                    login_name: self.login_name.clone(),
                    password,
                    options: AuthOptions {
                        database_name: self.database_name,
                        schema_name: self.schema_name,
                        warehouse: self.warehouse,
                        role_name: self.role_name,
                    },
                };
                auth.authenticate(&client).await?
            }
        };

        let mut session = SessionManager::new(client, tokens);
        if let Some(cache) = self.credential_cache {
            session = session.with_credential_cache(cache, host, self.login_name);
        }
        let session = Arc::new(session);

        let heartbeat = config
            .keep_session_alive
            .then(|| Heartbeat::new(session.clone(), config.heartbeat_interval).start());

        Ok(Connection {
            session,
            heartbeat,
            sequence: AtomicU64::new(0),
            chunk_downloader: self
                .chunk_downloader
                .unwrap_or_else(|| Arc::new(NoopChunkDownloader)),
        })
    }
}

#[derive(Debug)]
pub struct Connection {
    session: Arc<SessionManager>,
    heartbeat: Option<HeartbeatHandle>,
    sequence: AtomicU64,
    chunk_downloader: Arc<dyn ChunkDownloader>,
}

impl Connection {
    pub fn builder(account_name: String, login_name: String) -> ConnectionBuilder {
        ConnectionBuilder::new(account_name, login_name)
    }

    fn next_sequence_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn tokens(&self) -> SessionTokens {
        self.session.tokens()
    }

    /// Stop the heartbeat (if any) and delete the session.
    pub async fn close(mut self) -> Result<()> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        self.session.close().await
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn exec(&self, sql: String, bindings: Vec<QueryBindParameter>) -> Result<i64> {
        self.exec_query(Query::new(sql).with_bindings(bindings)).await
    }

    /// Execute a batch of `count` statements and return the affected rows
    /// summed over all of them.
    pub async fn exec_multi_statement(
        &self,
        sql: String,
        bindings: Vec<QueryBindParameter>,
        count: u32,
    ) -> Result<i64> {
        let q = Query::new(sql)
            .with_bindings(bindings)
            .with_multi_statement_count(count);
        self.exec_query(q).await
    }

    async fn exec_query(&self, q: Query) -> Result<i64> {
        let data = q
            .exec_sync(&self.session, RequestId::new(), self.next_sequence_id())
            .await?;
        query::affected_rows(&self.session, &data).await
    }

    /// Execute a query and return the (undecoded) result.
    pub async fn query_sync(
        &self,
        sql: String,
        bindings: Vec<QueryBindParameter>,
    ) -> Result<QueryData> {
        let q = Query::new(sql).with_bindings(bindings);
        let data = q
            .exec_sync(&self.session, RequestId::new(), self.next_sequence_id())
            .await?;
        self.chunk_downloader.start(&data).await?;
        Ok(data)
    }

    /// Submit a query without waiting for it. The returned handle tracks it
    /// to completion.
    pub async fn submit_async(
        &self,
        sql: String,
        bindings: Vec<QueryBindParameter>,
        opts: SubmitOptions,
    ) -> Result<AsyncQueryHandle> {
        let mut q = Query::new(sql).with_bindings(bindings);
        if let Some(count) = opts.multi_statement_count {
            q = q.with_multi_statement_count(count);
        }
        async_query::submit_async(
            self.session.clone(),
            self.chunk_downloader.clone(),
            q,
            self.next_sequence_id(),
            opts,
        )
        .await
    }

    /// Send an arbitrary request through the retry executor.
    pub async fn execute_with_retry(
        &self,
        request: &RetryRequest<'_>,
        policy: &RetryPolicy,
    ) -> Result<HttpResponse> {
        self.session.client().execute_request(request, policy).await
    }

    pub async fn query_status(&self, query_id: &str) -> Result<QueryStatus> {
        query::query_status(&self.session, query_id).await
    }

    pub async fn fetch_result(&self, query_id: &str) -> Result<QueryData> {
        query::fetch_result(&self.session, query_id).await
    }

    pub async fn abort(&self, request_id: RequestId, sql: &str) -> Result<()> {
        query::abort(&self.session, request_id, sql).await
    }

    pub async fn renew_session(&self) -> Result<()> {
        debug!("renewing session on request");
        self.session.renew_session().await
    }
}

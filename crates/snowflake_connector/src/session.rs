//! Session tokens and everything that keeps them valid.
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::credentials::{CredentialCache, TokenSpec};
use crate::errors::{LastFailure, MASTER_TOKEN_EXPIRED_CODE, Result, SnowflakeError};
use crate::req::{Envelope, RequestId, RequestIdParams, SnowflakeClient};
use crate::retry::{Endpoint, RetryPolicy};
use crate::single_flight::{Awaited, SingleFlight};

const TOKEN_REQUEST_ENDPOINT: &str = "/session/token-request";
const HEARTBEAT_ENDPOINT: &str = "/session/heartbeat";
const SESSION_ENDPOINT: &str = "/session";

#[derive(Clone)]
pub struct Token {
    value: String,
    validity: Duration,
    created_at: DateTime<Utc>,
}

impl Token {
    pub fn new(value: String, validity_in_seconds: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            value,
            validity: Duration::seconds(validity_in_seconds),
            created_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

// Never print the secret.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("validity", &self.validity)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// The token triple a session is identified by.
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub session_token: Token,
    pub master_token: Token,
    pub session_id: i64,
}

/// Holds the current tokens of a connection.
///
/// Readers always get a consistent snapshot. The lock is never held across
/// an await.
#[derive(Debug)]
pub struct TokenStore {
    inner: Mutex<SessionTokens>,
}

impl TokenStore {
    pub fn new(tokens: SessionTokens) -> Self {
        Self {
            inner: Mutex::new(tokens),
        }
    }

    pub fn get(&self) -> SessionTokens {
        self.inner.lock().clone()
    }

    pub fn session_token(&self) -> String {
        self.inner.lock().session_token.value.clone()
    }

    pub fn set(&self, tokens: SessionTokens) {
        *self.inner.lock() = tokens;
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenewRequest<'a> {
    old_session_token: &'a str,
    request_type: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenewData {
    session_token: String,
    #[serde(rename = "validityInSecondsST")]
    session_validity: Option<i64>,
    master_token: Option<String>,
    #[serde(rename = "validityInSecondsMT")]
    master_validity: Option<i64>,
    session_id: Option<i64>,
}

impl RenewData {
    fn apply(self, prev: SessionTokens) -> SessionTokens {
        let now = Utc::now();
        let session_validity = self
            .session_validity
            .unwrap_or_else(|| prev.session_token.validity.num_seconds());
        let master_token = match self.master_token {
            Some(master) => Token::new(
                master,
                self.master_validity
                    .unwrap_or_else(|| prev.master_token.validity.num_seconds()),
                now,
            ),
            None => prev.master_token,
        };
        SessionTokens {
            session_token: Token::new(self.session_token, session_validity, now),
            master_token,
            session_id: self.session_id.unwrap_or(prev.session_id),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloseParams {
    delete: bool,
    request_id: RequestId,
}

/// Where to drop the cached id token once the master token is gone.
#[derive(Debug, Clone)]
struct CredentialTarget {
    cache: Arc<dyn CredentialCache>,
    host: String,
    user: String,
}

/// Keeps a session alive: renews tokens, retries calls that hit an expired
/// session, and heartbeats.
#[derive(Debug)]
pub struct SessionManager {
    client: SnowflakeClient,
    tokens: TokenStore,
    renewals: SingleFlight<i64>,
    credentials: Option<CredentialTarget>,
}

impl SessionManager {
    pub fn new(client: SnowflakeClient, tokens: SessionTokens) -> Self {
        Self {
            client,
            tokens: TokenStore::new(tokens),
            renewals: SingleFlight::new(),
            credentials: None,
        }
    }

    pub fn with_credential_cache(
        mut self,
        cache: Arc<dyn CredentialCache>,
        host: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        self.credentials = Some(CredentialTarget {
            cache,
            host: host.into(),
            user: user.into(),
        });
        self
    }

    pub fn client(&self) -> &SnowflakeClient {
        &self.client
    }

    pub fn tokens(&self) -> SessionTokens {
        self.tokens.get()
    }

    /// Execute a json request with the current session token.
    ///
    /// If the session expired, renew once and retry once. A second expiry is
    /// returned as `SessionExpired`. The policy's total timeout covers the
    /// first attempt, the renewal and the retry together.
    pub async fn execute_json<P, B, R>(
        &self,
        method: Method,
        path: &str,
        params: Option<&P>,
        body: Option<&B>,
        policy: &RetryPolicy,
    ) -> Result<Envelope<R>>
    where
        P: Serialize,
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let started = Instant::now();
        let deadline = policy.total_timeout.map(|total| started + total);

        let token = self.tokens.session_token();
        let res: Envelope<R> = self
            .client
            .execute(method.clone(), path, params, body, Some(&token), policy)
            .await?;
        if !res.is_session_expired() {
            return Ok(res);
        }

        debug!(path, "session expired, renewing");
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.renew_from(&token))
                .await
                .map_err(|_| SnowflakeError::RetryTimeout {
                    elapsed: started.elapsed(),
                    attempts: 1,
                    last: LastFailure::Error(Box::new(SnowflakeError::Internal(
                        "session renewal did not finish in time".to_string(),
                    ))),
                })??,
            None => self.renew_from(&token).await?,
        }

        let policy = match deadline {
            Some(deadline) => policy.with_total_timeout(Some(
                deadline.saturating_duration_since(Instant::now()),
            )),
            None => *policy,
        };
        let token = self.tokens.session_token();
        let res: Envelope<R> = self
            .client
            .execute(method, path, params, body, Some(&token), &policy)
            .await?;
        if res.is_session_expired() {
            warn!(path, "session expired again after renewal");
            return Err(SnowflakeError::SessionExpired);
        }
        Ok(res)
    }

    /// Renew the current session token.
    pub async fn renew_session(&self) -> Result<()> {
        let stale = self.tokens.session_token();
        self.renew_from(&stale).await
    }

    /// Renew, unless somebody already replaced `stale`.
    ///
    /// Concurrent callers holding the same stale token share one renewal
    /// request.
    async fn renew_from(&self, stale: &str) -> Result<()> {
        let session_id = self.tokens.get().session_id;
        let awaited = self
            .renewals
            .await_value(
                session_id,
                || Ok::<_, SnowflakeError>(self.tokens.session_token()),
                |current| matches!(current, Ok(token) if token != stale),
                String::new,
            )
            .await;

        match awaited {
            Awaited::Ready(res) => res.map(|_| ()),
            Awaited::Worker { turn, .. } => match self.request_renewal(stale).await {
                Ok(()) => {
                    turn.done();
                    Ok(())
                }
                Err(e) => {
                    turn.resume_one();
                    Err(e)
                }
            },
        }
    }

    async fn request_renewal(&self, stale: &str) -> Result<()> {
        let current = self.tokens.get();
        let body = RenewRequest {
            old_session_token: stale,
            request_type: "RENEW",
        };
        let policy = self.client.policy(Endpoint::Generic);
        let res: Envelope<RenewData> = self
            .client
            .execute(
                Method::POST,
                TOKEN_REQUEST_ENDPOINT,
                Some(&RequestIdParams::new()),
                Some(&body),
                Some(current.master_token.value()),
                &policy,
            )
            .await?;

        if !res.success {
            let code = res.code.unwrap_or_default();
            warn!(%code, session_id = current.session_id, "failed to renew session");
            if code == MASTER_TOKEN_EXPIRED_CODE {
                self.forget_id_token();
            }
            return Err(SnowflakeError::RenewError {
                code,
                message: res.message.unwrap_or_default(),
            });
        }

        let data = res.data.ok_or_else(|| {
            SnowflakeError::Internal("renewal response is missing data".to_string())
        })?;
        self.tokens.set(data.apply(current));
        debug!(session_id = self.tokens.get().session_id, "session renewed");
        Ok(())
    }

    fn forget_id_token(&self) {
        if let Some(target) = &self.credentials {
            debug!(host = %target.host, "dropping cached id token");
            target
                .cache
                .delete_credential(&TokenSpec::id_token(&target.host, &target.user));
        }
    }

    /// Send one heartbeat, renewing the session if it has expired.
    pub async fn heartbeat(&self) -> Result<()> {
        let policy = self.client.policy(Endpoint::Generic);
        let res: Envelope<serde_json::Value> = self
            .execute_json(
                Method::POST,
                HEARTBEAT_ENDPOINT,
                Some(&RequestIdParams::new()),
                None::<&()>,
                &policy,
            )
            .await?;
        if !res.success {
            return Err(SnowflakeError::query_error(
                res.code,
                res.message,
                None,
                None,
            ));
        }
        Ok(())
    }

    /// Delete the session on the server.
    pub async fn close(&self) -> Result<()> {
        let params = CloseParams {
            delete: true,
            request_id: RequestId::new(),
        };
        let token = self.tokens.session_token();
        let policy = self.client.policy(Endpoint::Generic);
        let res: Envelope<serde_json::Value> = self
            .client
            .execute(
                Method::POST,
                SESSION_ENDPOINT,
                Some(&params),
                None::<&()>,
                Some(&token),
                &policy,
            )
            .await?;
        if !res.success {
            // An expired session is as good as closed.
            if res.is_session_expired() {
                return Ok(());
            }
            return Err(SnowflakeError::query_error(
                res.code,
                res.message,
                None,
                None,
            ));
        }
        debug!("session closed");
        Ok(())
    }
}

use std::fmt::{self, Debug};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Result, SnowflakeError};
use crate::req::{Envelope, RequestId, SnowflakeClient};
use crate::retry::Endpoint;
use crate::session::{SessionTokens, Token};

const AUTH_ENDPOINT: &str = "/session/v1/login-request";

const CLIENT_APP_ID: &str = "Go";
const CLIENT_APP_VERSION: &str = "1.6.18";

/// Produces the initial session tokens.
#[async_trait]
pub trait Authenticator: Sync + Send + Debug {
    async fn authenticate(&self, client: &SnowflakeClient) -> Result<SessionTokens>;
}

#[derive(Debug, Default, Clone)]
pub struct AuthOptions {
    pub database_name: Option<String>,
    pub schema_name: Option<String>,
    pub warehouse: Option<String>,
    pub role_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthParams<'a> {
    request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    database_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role_name: Option<&'a str>,
}

impl<'a> From<&'a AuthOptions> for AuthParams<'a> {
    fn from(value: &'a AuthOptions) -> Self {
        Self {
            request_id: RequestId::new(),
            database_name: value.database_name.as_deref(),
            schema_name: value.schema_name.as_deref(),
            warehouse: value.warehouse.as_deref(),
            role_name: value.role_name.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct ClientEnvironment {
    application: &'static str,
    os: &'static str,
    os_version: &'static str,
}

impl Default for ClientEnvironment {
    fn default() -> Self {
        Self {
            application: CLIENT_APP_ID,
            os: std::env::consts::OS,
            os_version: std::env::consts::ARCH,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct AuthBodyData<'a> {
    // Identify as a supported client, the server only hands out some result
    // formats to clients it knows.
    client_app_id: &'static str,
    client_app_version: &'static str,
    client_environment: ClientEnvironment,

    account_name: &'a str,
    login_name: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    data: AuthBodyData<'a>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: Option<String>,
    validity_in_seconds: Option<i64>,
    master_token: Option<String>,
    master_validity_in_seconds: Option<i64>,
    session_id: Option<i64>,
}

impl TryFrom<TokenResponse> for SessionTokens {
    type Error = SnowflakeError;

    fn try_from(value: TokenResponse) -> Result<Self> {
        let missing = |what: &str| SnowflakeError::AuthError {
            code: String::new(),
            message: format!("login response is missing {what}"),
        };
        let created_at = Utc::now();
        Ok(Self {
            session_token: Token::new(
                value.token.ok_or_else(|| missing("token"))?,
                value
                    .validity_in_seconds
                    .ok_or_else(|| missing("token validity"))?,
                created_at,
            ),
            master_token: Token::new(
                value.master_token.ok_or_else(|| missing("master token"))?,
                value
                    .master_validity_in_seconds
                    .ok_or_else(|| missing("master token validity"))?,
                created_at,
            ),
            session_id: value.session_id.unwrap_or_default(),
        })
    }
}

/// Plain user and password login.
pub struct PasswordAuthenticator {
    pub account_name: String,
    pub login_name: String,
    pub password: String,
    pub options: AuthOptions,
}

impl Debug for PasswordAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuthenticator")
            .field("account_name", &self.account_name)
            .field("login_name", &self.login_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    async fn authenticate(&self, client: &SnowflakeClient) -> Result<SessionTokens> {
        let params = AuthParams::from(&self.options);
        let body = AuthRequest {
            data: AuthBodyData {
                client_app_id: CLIENT_APP_ID,
                client_app_version: CLIENT_APP_VERSION,
                client_environment: ClientEnvironment::default(),
                account_name: &self.account_name,
                login_name: &self.login_name,
                password: &self.password,
            },
        };

        let policy = client.policy(Endpoint::Login);
        let res: Envelope<TokenResponse> = client
            .execute(
                Method::POST,
                AUTH_ENDPOINT,
                Some(&params),
                Some(&body),
                /* token = */ None,
                &policy,
            )
            .await?;

        if !res.success {
            return Err(SnowflakeError::AuthError {
                code: res.code.unwrap_or_default(),
                message: res.message.unwrap_or_default(),
            });
        }

        let data = res.data.ok_or_else(|| SnowflakeError::AuthError {
            code: String::new(),
            message: "login response is missing data".to_string(),
        })?;
        let tokens = SessionTokens::try_from(data)?;
        debug!(session_id = tokens.session_id, "logged in");
        Ok(tokens)
    }
}

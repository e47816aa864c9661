
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use reqwest::Method;
use serde_json::json;
use snowflake_connector::async_query::{AsyncOutcome, SubmitOptions};
use snowflake_connector::config::ClientConfig;
use snowflake_connector::req::SnowflakeClient;
use snowflake_connector::retry::{Endpoint, RetryRequest};
use snowflake_connector::session::{SessionTokens, Token};
use snowflake_connector::{Connection, ConnectionBuilder};
use url::Url;

use crate::setup::{BASE_URL, FakeSnowflake, POLLS_BEFORE_DONE, ROWS_PER_STATEMENT};

fn builder(server: &Arc<FakeSnowflake>) -> ConnectionBuilder {
    Connection::builder("acct".to_string(), "alice".to_string())
        .base_url(BASE_URL.to_string())
        .transport(server.clone())
}

#[tokio::test(start_paused = true)]
async fn async_dml_survives_session_expiry() {
    logutil::init_test();
    let server = Arc::new(FakeSnowflake::new());

    let conn = builder(&server)
        .password("hunter2".to_string())
        .warehouse("wh".to_string())
        .build()
        .await
        .unwrap();
    assert_eq!(1, server.state.lock().logins);
    assert_eq!("session-1", conn.tokens().session_token.value());

    let handle = conn
        .submit_async(
            "insert into t values (1), (2), (3)".to_string(),
            Vec::new(),
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let query_id = handle.query_id().to_string();

    // Expire before the poller's first request.
    server.expire_session();

    match handle.wait().await.unwrap() {
        AsyncOutcome::Exec {
            query_id: id,
            affected_rows,
        } => {
            assert_eq!(query_id, id);
            assert_eq!(ROWS_PER_STATEMENT, affected_rows);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    {
        let state = server.state.lock();
        assert_eq!(1, state.renewals);
        // One expired poll, then the in-progress ones, then the result.
        assert_eq!(POLLS_BEFORE_DONE + 1, state.polls[&query_id]);
    }
    assert_eq!(
        POLLS_BEFORE_DONE + 2,
        server.count(&format!("/queries/{query_id}/result"))
    );
    assert_eq!("session-2", conn.tokens().session_token.value());

    conn.close().await.unwrap();
    assert!(server.state.lock().closed);
}

#[tokio::test(start_paused = true)]
async fn concurrent_statements_share_one_renewal() {
    logutil::init_test();
    let server = Arc::new(FakeSnowflake::with_latency(Duration::from_millis(25)));
    server.state.lock().session_token = "session-1".to_string();
    server.state.lock().master_token = "master".to_string();

    let now = Utc::now();
    let conn = builder(&server)
        .tokens(SessionTokens {
            session_token: Token::new("session-1".to_string(), 3600, now),
            master_token: Token::new("master".to_string(), 14400, now),
            session_id: 7,
        })
        .build()
        .await
        .unwrap();
    server.expire_session();

    let results = join_all((0..6).map(|i| conn.exec(format!("insert into t values ({i})"), Vec::new()))).await;
    for res in results {
        assert_eq!(ROWS_PER_STATEMENT, res.unwrap());
    }

    let state = server.state.lock();
    assert_eq!(0, state.logins);
    assert_eq!(1, state.renewals);
    drop(state);
    assert_eq!(12, server.count("/queries/v1/query-request"));
}

#[tokio::test(start_paused = true)]
async fn batches_send_statement_count() {
    let server = Arc::new(FakeSnowflake::new());
    let conn = builder(&server)
        .password("hunter2".to_string())
        .build()
        .await
        .unwrap();

    let rows = conn
        .exec_multi_statement(
            "insert into t values (1); insert into t values (2)".to_string(),
            Vec::new(),
            2,
        )
        .await
        .unwrap();
    assert_eq!(2 * ROWS_PER_STATEMENT, rows);

    let handle = conn
        .submit_async(
            "insert into t values (1); insert into t values (2); insert into t values (3)"
                .to_string(),
            Vec::new(),
            SubmitOptions::default().with_multi_statement_count(3),
        )
        .await
        .unwrap();
    match handle.wait().await.unwrap() {
        AsyncOutcome::Exec { affected_rows, .. } => {
            assert_eq!(3 * ROWS_PER_STATEMENT, affected_rows)
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // Single statements leave the count out.
    assert_eq!(
        ROWS_PER_STATEMENT,
        conn.exec("insert into t values (4)".to_string(), Vec::new())
            .await
            .unwrap()
    );

    let state = server.state.lock();
    let counts: Vec<_> = state
        .query_bodies
        .iter()
        .map(|body| body["parameters"].clone())
        .collect();
    assert_eq!(
        vec![
            json!({"MULTI_STATEMENT_COUNT": 2}),
            json!({"MULTI_STATEMENT_COUNT": 3}),
            json!({}),
        ],
        counts
    );
}

#[tokio::test(start_paused = true)]
async fn heartbeat_runs_until_close() {
    let server = Arc::new(FakeSnowflake::new());
    let conn = builder(&server)
        .password("hunter2".to_string())
        .config(ClientConfig {
            keep_session_alive: true,
            heartbeat_interval: Duration::from_secs(30),
            ..Default::default()
        })
        .build()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(95)).await;
    assert_eq!(3, server.state.lock().heartbeats);

    conn.close().await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(3, server.state.lock().heartbeats);
}

#[tokio::test(start_paused = true)]
async fn fetch_result_and_raw_requests() {
    let server = Arc::new(FakeSnowflake::new());
    let conn = builder(&server)
        .password("hunter2".to_string())
        .build()
        .await
        .unwrap();

    let data = conn.fetch_result("q42").await.unwrap();
    // Still running on the server.
    assert_eq!(Some("q42".to_string()), data.query_id);
    assert_eq!(None, data.statement_type_id);

    let config = ClientConfig::default();
    let url = Url::parse(BASE_URL).unwrap().join("/session/heartbeat").unwrap();
    let token = conn.tokens().session_token.value().to_string();
    let request = RetryRequest::new(Method::POST, url)
        .with_headers(SnowflakeClient::headers(Some(&token)).unwrap());
    let res = conn
        .execute_with_retry(&request, &config.retry_policy(Endpoint::Generic))
        .await
        .unwrap();
    assert!(res.status.is_success());
    assert_eq!(1, server.state.lock().heartbeats);
}

#[tokio::test]
async fn missing_password_is_rejected() {
    let server = Arc::new(FakeSnowflake::new());
    let err = builder(&server).build().await.unwrap_err();
    assert!(err.to_string().contains("password"), "{err}");
    assert_eq!(0, server.state.lock().logins);
}

#[tokio::test]
async fn zero_heartbeat_interval_is_rejected() {
    let server = Arc::new(FakeSnowflake::new());
    let err = builder(&server)
        .password("hunter2".to_string())
        .config(ClientConfig {
            keep_session_alive: true,
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        })
        .build()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("heartbeat_interval"), "{err}");
    assert_eq!(0, server.state.lock().logins);
}

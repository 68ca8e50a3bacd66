//! Integration tests for the relational engines, run against an in-memory backend.

mod common;

use common::{Fault, FakeSqlFactory, params};
use orm_connection_pool::config::PoolOptions;
use orm_connection_pool::db::{Connection, DirectSqlEngine, PooledSqlEngine};
use orm_connection_pool::error::EngineError;
use orm_connection_pool::models::{Output, Params};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn pooled(max: u32) -> (PooledSqlEngine<FakeSqlFactory>, FakeSqlFactory) {
    let factory = FakeSqlFactory::default();
    let engine = PooledSqlEngine::new(factory.clone(), PoolOptions::with_max_connections(max));
    (engine, factory)
}

async fn assert_all_released(engine: &PooledSqlEngine<FakeSqlFactory>) {
    let status = engine.pool().await.unwrap().status();
    assert_eq!(status.in_use, 0, "a borrowed handle was not returned");
    assert_eq!(status.idle, status.size);
}

#[tokio::test]
async fn test_insert_returns_generated_id() {
    let (engine, _) = pooled(2);
    let output = engine
        .execute(
            "INSERT INTO users (name) VALUES (:name)",
            &params(json!({"name": "ada"})),
            None,
        )
        .await
        .unwrap();
    assert_eq!(output, Output::Scalar(json!(1)));

    let output = engine
        .execute("insert into users (name) values ('bob')", &Params::new(), None)
        .await
        .unwrap();
    assert_eq!(output, Output::Scalar(json!(2)));
}

#[tokio::test]
async fn test_update_and_other_return_rows() {
    let (engine, factory) = pooled(2);

    let output = engine
        .execute(
            "UPDATE users SET name = :name WHERE id = :id",
            &params(json!({"id": 1, "name": "ada"})),
            None,
        )
        .await
        .unwrap();
    assert_eq!(output, Output::Rows(Vec::new()));
    assert_eq!(factory.state.last_args(), vec![json!("ada"), json!(1)]);

    let output = engine
        .execute("SeLeCt * FROM users WHERE id = :id", &params(json!({"id": 7})), None)
        .await
        .unwrap();
    let rows = output.rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["args"], json!([7]));

    let output = engine
        .execute("DELETE FROM users", &Params::new(), None)
        .await
        .unwrap();
    assert_eq!(output, Output::Rows(Vec::new()));
}

#[tokio::test]
async fn test_handle_released_on_success_and_error() {
    let (engine, factory) = pooled(1);

    engine
        .execute("SELECT 1", &Params::new(), None)
        .await
        .unwrap();
    assert_all_released(&engine).await;

    factory.state.inject(Fault::Syntax);
    let err = engine
        .execute("SELEC 1", &Params::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(1064));
    assert_all_released(&engine).await;

    let err = engine
        .execute("SELECT :a", &Params::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.sql_state(), Some("HY093"));
    assert_all_released(&engine).await;

    // With a cap of one, a leaked handle would make this call hang
    engine
        .execute("SELECT 2", &Params::new(), None)
        .await
        .unwrap();
    assert_eq!(factory.state.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_non_transient_error_is_not_retried() {
    let (engine, factory) = pooled(2);
    factory.state.inject(Fault::Syntax);

    let err = engine
        .execute("SELECT 1", &Params::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Connection { .. }));
    assert!(err.to_string().contains("SQLSTATE[42000][1064]"));
    assert_eq!(factory.state.executed().len(), 1);
}

#[tokio::test]
async fn test_single_transient_failure_is_retried_on_fresh_handle() {
    let (engine, factory) = pooled(2);
    engine
        .execute("SELECT 0", &Params::new(), None)
        .await
        .unwrap();

    factory.state.inject(Fault::ServerGone);
    let output = engine
        .execute("SELECT 1", &Params::new(), None)
        .await
        .unwrap();
    assert_eq!(output.rows().map(<[_]>::len), Some(1));

    let executed = factory.state.executed();
    assert_eq!(executed.len(), 3);
    // The broken handle is discarded and the retry runs on a new one
    assert_ne!(executed[1].0, executed[2].0);
    assert_eq!(factory.state.live.load(Ordering::SeqCst), 1);
    assert_all_released(&engine).await;
}

#[tokio::test]
async fn test_two_transient_failures_surface_error() {
    let (engine, factory) = pooled(2);
    factory.state.inject(Fault::ServerGone);
    factory.state.inject(Fault::ServerGone);

    let err = engine
        .execute("SELECT 1", &Params::new(), None)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(err.code(), Some(2006));
    assert_eq!(factory.state.executed().len(), 2);
    assert_all_released(&engine).await;
}

#[tokio::test]
async fn test_binding_errors_surface_at_execution() {
    let (engine, factory) = pooled(2);

    let err = engine
        .execute(
            "SELECT * FROM t WHERE id = :id",
            &params(json!({"id": 1, "other": 2})),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.sql_state(), Some("HY093"));

    let err = engine
        .execute("SELECT * FROM t WHERE id = :id", &Params::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.sql_state(), Some("HY093"));
    assert!(factory.state.executed().is_empty());
}

#[tokio::test]
async fn test_caller_supplied_handle_is_not_released_or_retried() {
    let (engine, factory) = pooled(2);
    let mut handle = engine.handle().await.unwrap();

    engine
        .execute("SELECT 1", &Params::new(), Some(&mut handle))
        .await
        .unwrap();
    let status = engine.pool().await.unwrap().status();
    assert_eq!(status.in_use, 1, "caller still owns the handle");

    factory.state.inject(Fault::ServerGone);
    let err = engine
        .execute("SELECT 2", &Params::new(), Some(&mut handle))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(factory.state.executed().len(), 2);

    handle.release();
    assert_all_released(&engine).await;
}

#[tokio::test]
async fn test_pooled_transactions_unsupported() {
    let (engine, _) = pooled(2);
    assert!(matches!(
        engine.start_transaction().await.err(),
        Some(EngineError::Unsupported { .. })
    ));
    assert!(matches!(
        engine.commit().await.err(),
        Some(EngineError::Unsupported { .. })
    ));
    assert!(matches!(
        engine.rollback().await.err(),
        Some(EngineError::Unsupported { .. })
    ));
    assert!(matches!(
        engine.last_insert_id().await.err(),
        Some(EngineError::Unsupported { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_first_calls_share_one_pool() {
    let (engine, factory) = pooled(4);
    let engine = Arc::new(engine);

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .execute("SELECT :i", &params(json!({"i": i})), None)
                    .await
                    .unwrap()
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert!(factory.state.created.load(Ordering::SeqCst) <= 4);
    assert_all_released(&engine).await;
}

#[tokio::test]
async fn test_zero_cap_fails_on_connect() {
    let (engine, _) = pooled(0);
    let err = engine.connect(false).await.unwrap_err();
    assert!(matches!(err, EngineError::Precondition { .. }));
}

#[tokio::test]
async fn test_force_reconnect_drops_idle_handles() {
    let (engine, factory) = pooled(2);
    engine
        .execute("SELECT 1", &Params::new(), None)
        .await
        .unwrap();
    assert_eq!(factory.state.live.load(Ordering::SeqCst), 1);

    let pool = engine.connect(true).await.unwrap();
    assert_eq!(pool.status().size, 0);
    assert_eq!(factory.state.live.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Direct engine
// =============================================================================

#[tokio::test]
async fn test_direct_transaction_flag() {
    let factory = FakeSqlFactory::default();
    let engine = DirectSqlEngine::new(factory.clone());

    let err = engine.commit().await.err().unwrap();
    assert!(matches!(err, EngineError::Transaction { .. }));
    assert!(err.to_string().contains("not started"));
    assert!(matches!(
        engine.rollback().await.err(),
        Some(EngineError::Transaction { .. })
    ));

    engine.start_transaction().await.unwrap();
    assert!(engine.in_transaction());
    let err = engine.start_transaction().await.err().unwrap();
    assert!(err.to_string().contains("already started"));

    engine
        .execute("INSERT INTO t VALUES (1)", &Params::new(), None)
        .await
        .unwrap();
    engine.commit().await.unwrap();
    assert!(!engine.in_transaction());

    engine.start_transaction().await.unwrap();
    engine.rollback().await.unwrap();

    let sql: Vec<String> = factory
        .state
        .executed()
        .into_iter()
        .map(|(_, sql)| sql)
        .collect();
    assert_eq!(
        sql,
        vec![
            "START TRANSACTION",
            "INSERT INTO t VALUES (1)",
            "COMMIT",
            "START TRANSACTION",
            "ROLLBACK"
        ]
    );
}

#[tokio::test]
async fn test_direct_last_insert_id() {
    let engine = DirectSqlEngine::new(FakeSqlFactory::default());
    assert!(engine.last_insert_id().await.is_err());

    let output = engine
        .execute("INSERT INTO t VALUES (1)", &Params::new(), None)
        .await
        .unwrap();
    assert_eq!(output, Output::Scalar(json!(1)));
    assert_eq!(engine.last_insert_id().await.unwrap(), 1);
}

#[tokio::test]
async fn test_direct_retries_outside_transaction() {
    let factory = FakeSqlFactory::default();
    let engine = DirectSqlEngine::new(factory.clone());
    engine.connect(false).await.unwrap();

    factory.state.inject(Fault::ServerGone);
    engine
        .execute("SELECT 1", &Params::new(), None)
        .await
        .unwrap();
    assert_eq!(factory.state.created.load(Ordering::SeqCst), 2);
    assert_eq!(factory.state.live.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_direct_disconnect_inside_transaction_ends_it() {
    let factory = FakeSqlFactory::default();
    let engine = DirectSqlEngine::new(factory.clone());
    engine.start_transaction().await.unwrap();

    factory.state.inject(Fault::ServerGone);
    let err = engine
        .execute("UPDATE t SET a = 1", &Params::new(), None)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(!engine.in_transaction());
    // No retry: the statement ran once
    assert_eq!(factory.state.executed().len(), 2);
}

#[tokio::test]
async fn test_direct_force_reconnect_reopens() {
    let factory = FakeSqlFactory::default();
    let engine = DirectSqlEngine::new(factory.clone());
    engine.connect(false).await.unwrap();
    engine.connect(false).await.unwrap();
    assert_eq!(factory.state.created.load(Ordering::SeqCst), 1);

    engine.connect(true).await.unwrap();
    assert_eq!(factory.state.created.load(Ordering::SeqCst), 2);
    assert_eq!(factory.state.live.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_direct_caller_handle_is_independent() {
    let factory = FakeSqlFactory::default();
    let engine = DirectSqlEngine::new(factory.clone());
    let mut own = engine.open_handle().await.unwrap();

    engine
        .execute("SELECT 1", &Params::new(), Some(&mut own))
        .await
        .unwrap();
    assert_eq!(factory.state.executed(), vec![(own.id, "SELECT 1".to_string())]);
    // The engine's own handle was never opened
    assert!(engine.last_insert_id().await.is_err());
}

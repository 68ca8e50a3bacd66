//! In-memory backends for engine tests.

#![allow(dead_code)]

use async_trait::async_trait;
use orm_connection_pool::db::{BoundStatement, HandleFactory, KvHandle, SqlHandle};
use orm_connection_pool::error::{EngineError, EngineResult};
use orm_connection_pool::models::{Params, Row};
use serde_json::{Value as JsonValue, json};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn params(value: JsonValue) -> Params {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("params must be an object, got {other}"),
    }
}

/// Failure injected into the next statement run by any fake SQL handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// "MySQL server has gone away"
    ServerGone,
    /// Syntax error
    Syntax,
}

#[derive(Default)]
pub struct SqlState {
    faults: Mutex<VecDeque<Fault>>,
    executed: Mutex<Vec<(usize, String, Vec<JsonValue>)>>,
    next_id: AtomicU64,
    pub created: AtomicUsize,
    pub live: AtomicUsize,
}

impl SqlState {
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    /// Statements run so far as (handle id, sql).
    pub fn executed(&self) -> Vec<(usize, String)> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(id, sql, _)| (*id, sql.clone()))
            .collect()
    }

    pub fn last_args(&self) -> Vec<JsonValue> {
        self.executed
            .lock()
            .unwrap()
            .last()
            .map(|(_, _, args)| args.clone())
            .unwrap_or_default()
    }

    fn record(&self, handle: usize, stmt: &BoundStatement) -> EngineResult<()> {
        self.executed
            .lock()
            .unwrap()
            .push((handle, stmt.sql.clone(), stmt.args.clone()));
        match self.faults.lock().unwrap().pop_front() {
            Some(Fault::ServerGone) => Err(EngineError::backend(
                "MySQL server has gone away",
                Some("HY000".into()),
                Some(2006),
            )),
            Some(Fault::Syntax) => Err(EngineError::backend(
                "You have an error in your SQL syntax",
                Some("42000".into()),
                Some(1064),
            )),
            None => Ok(()),
        }
    }
}

pub struct FakeSqlHandle {
    pub id: usize,
    state: Arc<SqlState>,
    last_insert_id: u64,
}

impl Drop for FakeSqlHandle {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SqlHandle for FakeSqlHandle {
    async fn fetch_rows(&mut self, stmt: &BoundStatement) -> EngineResult<Vec<Row>> {
        tokio::task::yield_now().await;
        self.state.record(self.id, stmt)?;
        let is_select = stmt
            .sql
            .split_whitespace()
            .next()
            .is_some_and(|t| t.eq_ignore_ascii_case("select"));
        if !is_select {
            return Ok(Vec::new());
        }
        let mut row = Row::new();
        row.insert("handle".into(), json!(self.id));
        row.insert("args".into(), JsonValue::Array(stmt.args.clone()));
        Ok(vec![row])
    }

    async fn execute_insert(&mut self, stmt: &BoundStatement) -> EngineResult<u64> {
        tokio::task::yield_now().await;
        self.state.record(self.id, stmt)?;
        self.last_insert_id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.last_insert_id)
    }

    async fn last_insert_id(&mut self) -> EngineResult<u64> {
        Ok(self.last_insert_id)
    }
}

#[derive(Clone, Default)]
pub struct FakeSqlFactory {
    pub state: Arc<SqlState>,
}

#[async_trait]
impl HandleFactory for FakeSqlFactory {
    type Handle = FakeSqlHandle;

    async fn create(&self) -> EngineResult<FakeSqlHandle> {
        let id = self.state.created.fetch_add(1, Ordering::SeqCst);
        self.state.live.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSqlHandle {
            id,
            state: Arc::clone(&self.state),
            last_insert_id: 0,
        })
    }

    fn backend(&self) -> &'static str {
        "fake-sql"
    }
}

#[derive(Default)]
pub struct KvState {
    pub store: Mutex<BTreeMap<String, String>>,
    /// Keys whose writes fail
    pub failing: Mutex<HashSet<String>>,
    /// Keys whose reads and writes drop the connection
    pub dropping: Mutex<HashSet<String>>,
    pub gets: AtomicUsize,
    pub mgets: AtomicUsize,
    pub created: AtomicUsize,
}

pub struct FakeKvHandle {
    state: Arc<KvState>,
}

/// Glob match supporting `*` and `?`.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn go(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => go(&p[1..], n) || (!n.is_empty() && go(p, &n[1..])),
            (Some('?'), Some(_)) => go(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => go(&p[1..], &n[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    go(&p, &n)
}

impl FakeKvHandle {
    fn check_dropped(&self, key: &str) -> EngineResult<()> {
        if self.state.dropping.lock().unwrap().contains(key) {
            return Err(EngineError::disconnected(format!("connection reset reading {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl KvHandle for FakeKvHandle {
    async fn get(&mut self, key: &str) -> EngineResult<Option<String>> {
        self.state.gets.fetch_add(1, Ordering::SeqCst);
        self.check_dropped(key)?;
        Ok(self.state.store.lock().unwrap().get(key).cloned())
    }

    async fn mget(&mut self, keys: &[String]) -> EngineResult<Vec<Option<String>>> {
        self.state.mgets.fetch_add(1, Ordering::SeqCst);
        for key in keys {
            self.check_dropped(key)?;
        }
        let store = self.state.store.lock().unwrap();
        Ok(keys.iter().map(|k| store.get(k).cloned()).collect())
    }

    async fn set(&mut self, key: &str, value: &str) -> EngineResult<()> {
        self.check_dropped(key)?;
        if self.state.failing.lock().unwrap().contains(key) {
            return Err(EngineError::connection(format!("OOM writing {key}")));
        }
        self.state
            .store
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&mut self, key: &str) -> EngineResult<u64> {
        Ok(u64::from(self.state.store.lock().unwrap().remove(key).is_some()))
    }

    async fn keys(&mut self, pattern: &str) -> EngineResult<Vec<String>> {
        Ok(self
            .state
            .store
            .lock()
            .unwrap()
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct FakeKvFactory {
    pub state: Arc<KvState>,
}

#[async_trait]
impl HandleFactory for FakeKvFactory {
    type Handle = FakeKvHandle;

    async fn create(&self) -> EngineResult<FakeKvHandle> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeKvHandle {
            state: Arc::clone(&self.state),
        })
    }

    fn backend(&self) -> &'static str {
        "fake-kv"
    }
}

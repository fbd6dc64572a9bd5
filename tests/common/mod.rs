//! Scripted in-memory driver and listen connector for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use pgpool_lease::config::PoolConfig;
use pgpool_lease::db::{Connection, ConnectionSource, Driver, PoolRegistry};
use pgpool_lease::listen::{ListenConnector, ListenSession, Notification};
use pgpool_lease::models::{ConnectionIdentity, QueryOutput, QueryParam, Row};
use pgpool_lease::{DbError, DbResult};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Something the fake database observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Acquired(usize),
    Statement { conn: usize, sql: String },
    Released(usize),
}

/// Shared script and event log of the fake database.
#[derive(Default)]
pub struct Script {
    events: Mutex<Vec<Event>>,
    failing: Mutex<Vec<String>>,
    fetch_batches: Mutex<VecDeque<Vec<Row>>>,
    fail_acquire: AtomicBool,
    next_conn: AtomicUsize,
}

impl Script {
    /// Statements starting with `prefix` fail with a database error.
    pub fn fail_on(&self, prefix: &str) {
        self.failing.lock().unwrap().push(prefix.to_string());
    }

    /// Queue the rows returned by the next FETCH. FETCH returns no rows once
    /// the queue is empty.
    pub fn push_fetch(&self, rows: Vec<Row>) {
        self.fetch_batches.lock().unwrap().push_back(rows);
    }

    pub fn set_fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Every statement as `(connection id, sql)`.
    pub fn statements(&self) -> Vec<(usize, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Statement { conn, sql } => Some((conn, sql)),
                _ => None,
            })
            .collect()
    }

    /// Statements issued on one connection.
    pub fn statements_on(&self, conn: usize) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, sql)| sql)
            .collect()
    }

    pub fn count_statements(&self, prefix: &str) -> usize {
        self.statements()
            .iter()
            .filter(|(_, sql)| sql.starts_with(prefix))
            .count()
    }

    pub fn released(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Released(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn should_fail(&self, sql: &str) -> bool {
        self.failing
            .lock()
            .unwrap()
            .iter()
            .any(|prefix| sql.starts_with(prefix.as_str()))
    }
}

pub struct FakeConnection {
    id: usize,
    script: Arc<Script>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<QueryOutput> {
        self.script.record(Event::Statement {
            conn: self.id,
            sql: sql.to_string(),
        });

        if self.script.should_fail(sql) {
            return Err(DbError::database(
                format!("scripted failure: {sql}"),
                Some("XX000".to_string()),
                "scripted",
            ));
        }

        if sql.starts_with("FETCH") {
            let rows = self
                .script
                .fetch_batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            return Ok(QueryOutput {
                row_count: rows.len() as u64,
                rows,
            });
        }

        if sql.starts_with("SELECT") {
            return Ok(QueryOutput {
                row_count: 1,
                rows: vec![row(json!({"conn": self.id}))],
            });
        }

        Ok(QueryOutput::empty())
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.script.record(Event::Released(self.id));
    }
}

pub struct FakeSource {
    script: Arc<Script>,
}

#[async_trait]
impl ConnectionSource for FakeSource {
    async fn acquire(&self) -> DbResult<Box<dyn Connection>> {
        if self.script.fail_acquire.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection refused", "start the server"));
        }
        let id = self.script.next_conn.fetch_add(1, Ordering::SeqCst);
        self.script.record(Event::Acquired(id));
        Ok(Box::new(FakeConnection {
            id,
            script: Arc::clone(&self.script),
        }))
    }
}

pub struct FakeDriver {
    pub script: Arc<Script>,
}

#[async_trait]
impl Driver for FakeDriver {
    async fn open(&self, _config: &PoolConfig) -> DbResult<Arc<dyn ConnectionSource>> {
        Ok(Arc::new(FakeSource {
            script: Arc::clone(&self.script),
        }))
    }
}

/// Registry backed by a fresh scripted database.
pub fn registry() -> (PoolRegistry, Arc<Script>) {
    let script = Arc::new(Script::default());
    let registry = PoolRegistry::new(Arc::new(FakeDriver {
        script: Arc::clone(&script),
    }));
    (registry, script)
}

pub fn config() -> PoolConfig {
    PoolConfig::new(ConnectionIdentity::new("app", "localhost", 5432, "test"))
}

pub fn config_with_max(max: u32) -> PoolConfig {
    config().with_max_connections(max)
}

pub fn row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("row must be an object, got {other}"),
    }
}

/// Let spawned tasks (background rollbacks, watchdogs) run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Listen/notify
// =============================================================================

/// What the next session opened by [`FakeListen`] does.
#[derive(Debug, Clone)]
pub enum SessionPlan {
    RefuseConnect,
    RejectListen,
    Deliver(Vec<SessionEvent>),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Notify(&'static str),
    Error,
}

/// Listen connector replaying a plan. Once the plan is used up, sessions
/// connect and then wait forever.
#[derive(Default)]
pub struct FakeListen {
    plan: Mutex<VecDeque<SessionPlan>>,
    connect_times: Mutex<Vec<tokio::time::Instant>>,
    listened: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

impl FakeListen {
    pub fn with_plan(plan: Vec<SessionPlan>) -> Arc<Self> {
        Arc::new(Self {
            plan: Mutex::new(plan.into()),
            ..Default::default()
        })
    }

    pub fn connects(&self) -> usize {
        self.connect_times.lock().unwrap().len()
    }

    /// Milliseconds between consecutive connect attempts.
    pub fn connect_gaps_ms(&self) -> Vec<u128> {
        let times = self.connect_times.lock().unwrap();
        times
            .windows(2)
            .map(|w| w[1].duration_since(w[0]).as_millis())
            .collect()
    }

    pub fn listened(&self) -> Vec<String> {
        self.listened.lock().unwrap().clone()
    }

    pub fn closed_sessions(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListenConnector for FakeListen {
    async fn connect(&self) -> DbResult<Box<dyn ListenSession>> {
        self.connect_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());

        let plan = self
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SessionPlan::Deliver(Vec::new()));

        let (reject_listen, events) = match plan {
            SessionPlan::RefuseConnect => {
                return Err(DbError::connection("connection refused", "start the server"));
            }
            SessionPlan::RejectListen => (true, VecDeque::new()),
            SessionPlan::Deliver(events) => (false, events.into()),
        };

        Ok(Box::new(FakeSession {
            channel: String::new(),
            reject_listen,
            events,
            listened: Arc::clone(&self.listened),
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct FakeSession {
    channel: String,
    reject_listen: bool,
    events: VecDeque<SessionEvent>,
    listened: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ListenSession for FakeSession {
    async fn listen(&mut self, channel: &str) -> DbResult<()> {
        if self.reject_listen {
            return Err(DbError::database("LISTEN rejected", None, "scripted"));
        }
        self.channel = channel.to_string();
        self.listened.lock().unwrap().push(channel.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> DbResult<Notification> {
        match self.events.pop_front() {
            Some(SessionEvent::Notify(payload)) => Ok(Notification {
                channel: self.channel.clone(),
                payload: payload.to_string(),
                process_id: 4242,
            }),
            Some(SessionEvent::Error) => Err(DbError::connection("connection reset", "retry")),
            None => std::future::pending().await,
        }
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A duration in whole milliseconds, for readable assertions.
pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

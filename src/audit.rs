//! Durable audit trail for requests and admin actions
//!
//! Events land in a SQLite file (WAL mode) through a bounded queue and a
//! single writer task. Submissions never block request handling: a full
//! queue drops the event and bumps a counter instead. The writer commits
//! batches of up to `batch_max` events or whatever arrived within
//! `batch_interval_ms`, whichever comes first, to amortise fsync cost.
//! Readers run filtered snapshot queries on their own connection and never
//! block the writer.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AuditConfig;

/// Status recorded when the client went away before the response completed.
const STATUS_CLIENT_CANCELLED: u16 = 499;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    client_ip TEXT NOT NULL,
    method TEXT,
    path TEXT,
    status_code INTEGER,
    duration_ms REAL,
    action TEXT,
    details TEXT,
    user_agent TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_event_type ON audit_log(event_type);
CREATE INDEX IF NOT EXISTS idx_audit_client_ip ON audit_log(client_ip);
";

/// Audit event kinds on the query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Request,
    AdminAction,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::AdminAction => "admin_action",
        }
    }

    /// Parse the query-surface spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Self::Request),
            "admin-action" | "admin_action" => Some(Self::AdminAction),
            _ => None,
        }
    }
}

/// One event on its way to the store.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    Request {
        timestamp: DateTime<Utc>,
        client_ip: String,
        method: String,
        path: String,
        status: u16,
        duration_ms: f64,
        user_agent: Option<String>,
    },
    AdminAction {
        timestamp: DateTime<Utc>,
        client_ip: String,
        action: String,
        details: Option<String>,
        user_agent: Option<String>,
    },
}

enum WriterMessage {
    Event(AuditEvent),
    Shutdown,
}

/// A stored audit row.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: String,
    pub event_type: String,
    pub client_ip: String,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status_code: Option<i64>,
    pub duration_ms: Option<f64>,
    pub action: Option<String>,
    pub details: Option<String>,
    pub user_agent: Option<String>,
}

/// Query filters for the audit surface.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub kind: Option<EventKind>,
    pub client_ip: Option<IpAddr>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

/// Aggregate statistics over a window.
#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub window_hours: u32,
    pub total_events: u64,
    pub counts_by_kind: Vec<KindCount>,
    pub counts_by_status: Vec<StatusCount>,
    pub top_ips: Vec<IpCount>,
    pub dropped_events: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KindCount {
    pub kind: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: i64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpCount {
    pub client_ip: String,
    pub count: u64,
}

struct StoreInner {
    tx: mpsc::Sender<WriterMessage>,
    reader: Mutex<Connection>,
    /// Shared with the writer task: overflow drops and failed batches
    dropped: Arc<AtomicU64>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the audit store. Cheap to clone; all clones feed the same
/// writer queue.
#[derive(Clone)]
pub struct AuditStore {
    inner: Arc<StoreInner>,
}

impl AuditStore {
    /// Open (or create) the store at `path` and start the writer task.
    pub fn open(path: impl AsRef<Path>, config: &AuditConfig) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer_conn = Connection::open(path)?;
        writer_conn.pragma_update(None, "journal_mode", "WAL")?;
        writer_conn.pragma_update(None, "synchronous", "NORMAL")?;
        writer_conn.execute_batch(SCHEMA)?;

        let reader_conn = Connection::open(path)?;
        reader_conn.pragma_update(None, "journal_mode", "WAL")?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(writer_loop(
            writer_conn,
            rx,
            config.batch_max.max(1),
            config.batch_interval_ms,
            dropped.clone(),
        ));

        info!("audit store opened at {:?}", path);

        Ok(Self {
            inner: Arc::new(StoreInner {
                tx,
                reader: Mutex::new(reader_conn),
                dropped,
                writer: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Submit an event. Never blocks; a full queue drops the event and
    /// bumps the dropped counter.
    pub fn append(&self, event: AuditEvent) {
        if self.inner.tx.try_send(WriterMessage::Event(event)).is_err() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a completed data-plane or surface request.
    pub fn record_request(
        &self,
        client_ip: IpAddr,
        method: &str,
        path: &str,
        status: u16,
        duration_ms: f64,
        user_agent: Option<String>,
    ) {
        self.append(AuditEvent::Request {
            timestamp: Utc::now(),
            client_ip: client_ip.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            status,
            duration_ms,
            user_agent,
        });
    }

    /// Record an administrative action.
    pub fn admin_action(
        &self,
        client_ip: IpAddr,
        action: &str,
        details: Option<String>,
        user_agent: Option<String>,
    ) {
        self.append(AuditEvent::AdminAction {
            timestamp: Utc::now(),
            client_ip: client_ip.to_string(),
            action: action.to_string(),
            details,
            user_agent,
        });
    }

    /// Events dropped due to queue overflow or write failures.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Filtered, paginated read, newest first.
    pub fn query(&self, query: &AuditQuery) -> anyhow::Result<Vec<AuditRecord>> {
        let limit = query.limit.clamp(1, 1000);

        let mut sql = String::from(
            "SELECT id, timestamp, event_type, client_ip, method, path, status_code, \
             duration_ms, action, details, user_agent FROM audit_log WHERE 1=1",
        );
        let mut params: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(kind) = query.kind {
            sql.push_str(" AND event_type = ?");
            params.push(kind.as_str().to_string().into());
        }
        if let Some(ip) = query.client_ip {
            sql.push_str(" AND client_ip = ?");
            params.push(ip.to_string().into());
        }
        if let Some(start) = query.start {
            sql.push_str(" AND timestamp >= ?");
            params.push(start.to_rfc3339().into());
        }
        if let Some(end) = query.end {
            sql.push_str(" AND timestamp <= ?");
            params.push(end.to_rfc3339().into());
        }

        sql.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");
        params.push(i64::from(limit).into());
        params.push(i64::from(query.offset).into());

        let conn = self.inner.reader.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| {
            Ok(AuditRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                event_type: row.get(2)?,
                client_ip: row.get(3)?,
                method: row.get(4)?,
                path: row.get(5)?,
                status_code: row.get(6)?,
                duration_ms: row.get(7)?,
                action: row.get(8)?,
                details: row.get(9)?,
                user_agent: row.get(10)?,
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Aggregates over the trailing window.
    pub fn stats(&self, window_hours: u32) -> anyhow::Result<AuditStats> {
        let since = (Utc::now() - ChronoDuration::hours(i64::from(window_hours))).to_rfc3339();
        let conn = self.inner.reader.lock();

        let mut counts_by_kind = Vec::new();
        let mut total_events = 0u64;
        {
            let mut stmt = conn.prepare(
                "SELECT event_type, COUNT(*) FROM audit_log WHERE timestamp >= ? \
                 GROUP BY event_type",
            )?;
            let rows = stmt.query_map([&since], |row| {
                Ok(KindCount {
                    kind: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?;
            for row in rows {
                let row = row?;
                total_events += row.count;
                counts_by_kind.push(row);
            }
        }

        let mut counts_by_status = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT status_code, COUNT(*) FROM audit_log \
                 WHERE timestamp >= ? AND status_code IS NOT NULL \
                 GROUP BY status_code ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map([&since], |row| {
                Ok(StatusCount {
                    status: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?;
            for row in rows {
                counts_by_status.push(row?);
            }
        }

        let mut top_ips = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT client_ip, COUNT(*) FROM audit_log WHERE timestamp >= ? \
                 GROUP BY client_ip ORDER BY COUNT(*) DESC LIMIT 10",
            )?;
            let rows = stmt.query_map([&since], |row| {
                Ok(IpCount {
                    client_ip: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?;
            for row in rows {
                top_ips.push(row?);
            }
        }

        Ok(AuditStats {
            window_hours,
            total_events,
            counts_by_kind,
            counts_by_status,
            top_ips,
            dropped_events: self.dropped_events(),
        })
    }

    /// Drain the queue and stop the writer. Events appended before this
    /// call are on disk when it returns.
    pub async fn shutdown(&self) {
        let _ = self.inner.tx.send(WriterMessage::Shutdown).await;
        let handle = self.inner.writer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("audit writer task error during shutdown: {}", e);
            }
        }
        info!("audit store closed");
    }
}

/// Single-writer batching loop. Owns the write connection for the life of
/// the process.
async fn writer_loop(
    conn: Connection,
    mut rx: mpsc::Receiver<WriterMessage>,
    batch_max: usize,
    batch_interval_ms: u64,
    dropped: Arc<AtomicU64>,
) {
    let interval = std::time::Duration::from_millis(batch_interval_ms.max(1));

    loop {
        let first = match rx.recv().await {
            Some(WriterMessage::Event(e)) => e,
            Some(WriterMessage::Shutdown) | None => break,
        };

        let mut batch = Vec::with_capacity(batch_max);
        batch.push(first);
        let mut shutting_down = false;

        let deadline = tokio::time::sleep(interval);
        tokio::pin!(deadline);

        while batch.len() < batch_max {
            tokio::select! {
                () = &mut deadline => break,
                msg = rx.recv() => match msg {
                    Some(WriterMessage::Event(e)) => batch.push(e),
                    Some(WriterMessage::Shutdown) | None => {
                        shutting_down = true;
                        break;
                    }
                }
            }
        }

        if let Err(e) = commit_batch(&conn, &batch) {
            // Best effort: the batch is lost but the proxy keeps serving
            dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
            error!("audit writer: failed to commit {} events: {}", batch.len(), e);
        }

        if shutting_down {
            break;
        }
    }
}

fn commit_batch(conn: &Connection, batch: &[AuditEvent]) -> anyhow::Result<()> {
    conn.execute_batch("BEGIN")?;
    let result = (|| -> anyhow::Result<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO audit_log \
             (timestamp, event_type, client_ip, method, path, status_code, duration_ms, \
              action, details, user_agent) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for event in batch {
            match event {
                AuditEvent::Request {
                    timestamp,
                    client_ip,
                    method,
                    path,
                    status,
                    duration_ms,
                    user_agent,
                } => {
                    stmt.execute(rusqlite::params![
                        timestamp.to_rfc3339(),
                        EventKind::Request.as_str(),
                        client_ip,
                        method,
                        path,
                        *status as i64,
                        duration_ms,
                        Option::<String>::None,
                        Option::<String>::None,
                        user_agent,
                    ])?;
                }
                AuditEvent::AdminAction {
                    timestamp,
                    client_ip,
                    action,
                    details,
                    user_agent,
                } => {
                    stmt.execute(rusqlite::params![
                        timestamp.to_rfc3339(),
                        EventKind::AdminAction.as_str(),
                        client_ip,
                        Option::<String>::None,
                        Option::<String>::None,
                        Option::<i64>::None,
                        Option::<f64>::None,
                        action,
                        details,
                        user_agent,
                    ])?;
                }
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Records an event for a request even when the handling task is cancelled
/// (client disconnect). Disarmed on normal completion.
struct RequestGuard {
    store: AuditStore,
    client_ip: IpAddr,
    method: String,
    path: String,
    user_agent: Option<String>,
    start: Instant,
    armed: bool,
}

impl RequestGuard {
    fn complete(mut self, status: u16) -> f64 {
        self.armed = false;
        let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.store.record_request(
            self.client_ip,
            &self.method,
            &self.path,
            status,
            duration_ms,
            self.user_agent.take(),
        );
        duration_ms
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.armed {
            let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
            self.store.record_request(
                self.client_ip,
                &self.method,
                &self.path,
                STATUS_CLIENT_CANCELLED,
                duration_ms,
                self.user_agent.take(),
            );
        }
    }
}

/// Middleware that audits every request and stamps the measured duration
/// onto the response. Health probes are skipped.
pub async fn record_requests(
    State(store): State<AuditStore>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let guard = RequestGuard {
        store,
        client_ip: client_addr.ip(),
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        user_agent: request
            .headers()
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
        start: Instant::now(),
        armed: true,
    };

    let mut response = next.run(request).await;

    let duration_ms = guard.complete(response.status().as_u16());
    if let Ok(v) = HeaderValue::from_str(&format!("{duration_ms:.2}")) {
        response.headers_mut().insert("x-process-time-ms", v);
    }

    response
}

//! In-process HTTP fixtures for engine tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};

use crate::store::{open_store, write_db_version};

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Default)]
pub struct FixtureServerBuilder {
    files: HashMap<String, Vec<u8>>,
    failures: HashMap<String, usize>,
    stalls: HashMap<String, Duration>,
}

impl FixtureServerBuilder {
    pub fn with_file(mut self, path: &str, body: Vec<u8>) -> Self {
        self.files.insert(path.to_string(), body);
        self
    }

    /// The first `count` requests for `path` answer 503.
    pub fn failing_first(mut self, path: &str, count: usize) -> Self {
        self.failures.insert(path.to_string(), count);
        self
    }

    /// Every request for `path` waits `delay` before answering.
    pub fn stalling(mut self, path: &str, delay: Duration) -> Self {
        self.stalls.insert(path.to_string(), delay);
        self
    }

    pub async fn serve(self) -> FixtureServer {
        let state = Arc::new(ServerState {
            files: self.files,
            stalls: self.stalls,
            failures: Mutex::new(self.failures),
            hits: Mutex::new(HashMap::new()),
        });
        let app = Router::new()
            .fallback(serve_fixture)
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fixture server");
        let addr = listener.local_addr().expect("fixture address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fixture server");
        });

        FixtureServer { addr, state }
    }
}

struct ServerState {
    files: HashMap<String, Vec<u8>>,
    stalls: HashMap<String, Duration>,
    failures: Mutex<HashMap<String, usize>>,
    hits: Mutex<HashMap<String, usize>>,
}

pub struct FixtureServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl FixtureServer {
    pub fn builder() -> FixtureServerBuilder {
        FixtureServerBuilder::default()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state
            .hits
            .lock()
            .expect("hits lock")
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

async fn serve_fixture(State(state): State<Arc<ServerState>>, uri: Uri) -> Response {
    let key = uri.path().trim_start_matches('/').to_string();
    *state
        .hits
        .lock()
        .expect("hits lock")
        .entry(key.clone())
        .or_default() += 1;

    if let Some(delay) = state.stalls.get(&key) {
        tokio::time::sleep(*delay).await;
    }

    {
        let mut failures = state.failures.lock().expect("failures lock");
        if let Some(left) = failures.get_mut(&key) {
            if *left > 0 {
                *left -= 1;
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        }
    }

    match state.files.get(&key) {
        Some(body) => (StatusCode::OK, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Bytes of a published store at `version` holding one product per code.
pub fn published_store(scratch: &Path, version: i64, codes: &[&str]) -> Vec<u8> {
    let path = scratch.join(format!("published-{version}.db"));
    {
        let conn = open_store(&path).expect("published store");
        for code in codes {
            conn.execute(
                "INSERT INTO products(code, description) VALUES(?1, ?2)",
                params![code, format!("published {code}")],
            )
            .expect("insert product");
        }
        write_db_version(&conn, version).expect("version");
        conn.pragma_update(None, "journal_mode", "DELETE")
            .expect("journal mode");
    }
    std::fs::read(&path).expect("read published store")
}

pub fn product_codes(db_path: &Path) -> Vec<String> {
    let conn = Connection::open(db_path).expect("open store");
    let mut statement = conn
        .prepare("SELECT code FROM products ORDER BY code")
        .expect("prepare");
    statement
        .query_map([], |row| row.get::<_, String>(0))
        .expect("query")
        .collect::<rusqlite::Result<Vec<_>>>()
        .expect("codes")
}

pub fn manifest_json(
    version: i64,
    db_url: &str,
    db_sha: Option<&str>,
    base_url: &str,
    files: &[(&str, Option<&str>)],
) -> Vec<u8> {
    let files: Vec<serde_json::Value> = files
        .iter()
        .map(|(file, sha)| serde_json::json!({ "file": file, "sha256": sha }))
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "appVersion": "1.0.1",
        "db": { "version": version, "url": db_url, "sha256": db_sha },
        "images": { "base_url": base_url, "files": files },
    }))
    .expect("manifest json")
}

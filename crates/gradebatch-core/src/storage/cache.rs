use anyhow::Context;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex};

const DDL: &str = "
CREATE TABLE IF NOT EXISTS response_cache (
    key          TEXT PRIMARY KEY,
    model        TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    content      TEXT NOT NULL
);
";

/// Completed direct-call responses, keyed by model and request body, so a
/// re-run of a partially failed job only pays for what failed.
#[derive(Clone)]
pub struct ResponseCache {
    conn: Arc<Mutex<Connection>>,
}

impl ResponseCache {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).context("failed to open sqlite cache")?;
        // concurrent runs may share one cache file
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let cache = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        let cache = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(DDL)?;
        Ok(())
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("response cache mutex poisoned"))
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT content FROM response_cache WHERE key=?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub fn put(&self, key: &str, model: &str, content: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO response_cache(key, model, created_at, content)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                content=excluded.content,
                created_at=excluded.created_at",
            params![key, model, chrono::Utc::now().to_rfc3339(), content],
        )?;
        Ok(())
    }
}

/// serde_json maps are sorted, so the serialized body is canonical. The
/// custom id keeps repeat rounds of one prompt apart.
pub fn cache_key(custom_id: &str, model: &str, body: &serde_json::Value) -> String {
    let mut h = Sha256::new();
    h.update(custom_id.as_bytes());
    h.update(b"\n");
    h.update(model.as_bytes());
    h.update(b"\n");
    h.update(body.to_string().as_bytes());
    hex::encode(h.finalize())
}

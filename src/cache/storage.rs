//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CachedResponse, EntryInfo, Request, Response};

/// Trait for cache storage backends.
///
/// Mirrors the browser's cache storage: a set of named stores, each mapping
/// request keys to response snapshots. Every method is atomic on its own.
pub trait CacheStorage: Send + Sync {
  /// Create the named store if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Whether the named store exists.
  fn has(&self, name: &str) -> Result<bool>;

  /// Names of all stores, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a store and everything in it. Returns whether it existed.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Store a single entry, replacing any previous entry for the same request.
  /// The store is created if needed.
  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store a single entry only if the store still exists. Returns whether
  /// the entry was written; a deleted store stays deleted.
  fn put_existing(&self, name: &str, request: &Request, response: &Response) -> Result<bool>;

  /// Create the store and write all entries, or write nothing at all.
  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Look up a request in one store.
  fn match_request(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Look up a request across all stores, oldest store first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>>;

  /// List the entries of a store.
  fn entries(&self, name: &str) -> Result<Vec<EntryInfo>>;

  /// Delete every store. Returns how many were removed.
  fn clear_all(&self) -> Result<usize> {
    let mut removed = 0;
    for name in self.keys()? {
      if self.delete(&name)? {
        removed += 1;
      }
    }
    Ok(removed)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the storage database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open_path(&Self::default_path()?)
  }

  /// Open (or create) the storage database at `path`.
  pub fn open_path(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("orbit").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named stores, rowid gives creation order
CREATE TABLE IF NOT EXISTS cache_stores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(request_key);
"#;

fn create_store(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create cache store {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, name: &str, request: &Request, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, request_key, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        request.cache_key(),
        request.url.as_str(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {} in {}: {}", request.url, name, e))?;

  Ok(())
}

/// Row shape shared by both lookup queries.
type EntryRow = (String, u16, String, Vec<u8>, String);

fn into_cached(row: EntryRow) -> Result<CachedResponse> {
  let (cache_name, status, headers, body, cached_at) = row;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

  Ok(CachedResponse {
    response: Response {
      status,
      headers,
      body,
    },
    cache_name,
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    create_store(&conn, name)
  }

  fn has(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    create_store(&tx, name)?;
    insert_entry(&tx, name, request, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_existing(&self, name: &str, request: &Request, response: &Response) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let exists: Option<i64> = tx
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))?;
    if exists.is_none() {
      return Ok(false);
    }

    insert_entry(&tx, name, request, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(true)
  }

  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    // Dropping the transaction on error rolls everything back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    create_store(&tx, name)?;
    for (request, response) in entries {
      insert_entry(&tx, name, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_request(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT cache_name, status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![name, request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", request.url, name, e))?;

    row.map(into_cached).transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT e.cache_name, e.status, e.headers, e.body, e.cached_at FROM cache_entries e
         INNER JOIN cache_stores s ON s.name = e.cache_name
         WHERE e.request_key = ?
         ORDER BY s.id
         LIMIT 1",
        params![request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", request.url, e))?;

    row.map(into_cached).transpose()
  }

  fn entries(&self, name: &str) -> Result<Vec<EntryInfo>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT url, status, length(body), cached_at FROM cache_entries
         WHERE cache_name = ?
         ORDER BY url",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![name], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, u16>(1)?,
          row.get::<_, i64>(2)?,
          row.get::<_, String>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(url, status, size, cached_at)| {
        Ok(EntryInfo {
          url,
          status,
          size: usize::try_from(size).unwrap_or_default(),
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn request(path: &str) -> Request {
    let origin = Url::parse("https://space-tourism.test").unwrap();
    Request::get(Request::resolve(&origin, path).unwrap())
  }

  #[test]
  fn test_open_and_keys_in_creation_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("space-tourism-v1").unwrap();
    storage.open("space-tourism-runtime-v1").unwrap();
    // Opening twice keeps a single store
    storage.open("space-tourism-v1").unwrap();

    assert_eq!(
      storage.keys().unwrap(),
      vec!["space-tourism-v1", "space-tourism-runtime-v1"]
    );
    assert!(storage.has("space-tourism-v1").unwrap());
    assert!(!storage.has("space-tourism-v0").unwrap());
  }

  #[test]
  fn test_put_creates_store_and_overwrites() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let req = request("/page.html");

    storage.put("runtime", &req, &Response::ok("OLD")).unwrap();
    storage.put("runtime", &req, &Response::ok("NEW")).unwrap();

    let cached = storage.match_request("runtime", &req).unwrap().unwrap();
    assert_eq!(cached.response.text(), "NEW");
    assert_eq!(cached.cache_name, "runtime");
    assert_eq!(storage.entries("runtime").unwrap().len(), 1);
  }

  #[test]
  fn test_headers_survive_storage() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let req = request("/index.css");
    let response = Response::ok("body { margin: 0 }").with_header("Content-Type", "text/css");

    storage.put("static", &req, &response).unwrap();

    let cached = storage.match_request("static", &req).unwrap().unwrap();
    assert_eq!(cached.response, response);
  }

  #[test]
  fn test_match_any_prefers_oldest_store() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let req = request("/index.html");

    storage.open("static").unwrap();
    storage.open("runtime").unwrap();
    storage.put("runtime", &req, &Response::ok("runtime copy")).unwrap();
    assert_eq!(
      storage.match_any(&req).unwrap().unwrap().response.text(),
      "runtime copy"
    );

    storage.put("static", &req, &Response::ok("static copy")).unwrap();
    let cached = storage.match_any(&req).unwrap().unwrap();
    assert_eq!(cached.response.text(), "static copy");
    assert_eq!(cached.cache_name, "static");

    assert!(storage.match_any(&request("/missing.html")).unwrap().is_none());
  }

  #[test]
  fn test_delete_removes_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let req = request("/crew.html");
    storage.put("old", &req, &Response::ok("crew")).unwrap();

    assert!(storage.delete("old").unwrap());
    assert!(!storage.delete("old").unwrap());
    assert!(storage.keys().unwrap().is_empty());
    assert!(storage.match_any(&req).unwrap().is_none());

    // Recreating the store does not resurrect old entries
    storage.open("old").unwrap();
    assert!(storage.match_request("old", &req).unwrap().is_none());
  }

  #[test]
  fn test_put_existing_never_recreates_store() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let req = request("/crew.html");

    assert!(!storage.put_existing("runtime", &req, &Response::ok("crew")).unwrap());
    assert!(!storage.has("runtime").unwrap());

    storage.open("runtime").unwrap();
    assert!(storage.put_existing("runtime", &req, &Response::ok("crew")).unwrap());
    assert_eq!(
      storage.match_any(&req).unwrap().unwrap().response.text(),
      "crew"
    );

    storage.delete("runtime").unwrap();
    assert!(!storage.put_existing("runtime", &req, &Response::ok("late")).unwrap());
    assert!(storage.keys().unwrap().is_empty());
    assert!(storage.match_any(&req).unwrap().is_none());
  }

  #[test]
  fn test_clear_all_deletes_every_store() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("space-tourism-v1").unwrap();
    storage
      .put("space-tourism-runtime-v1", &request("/"), &Response::ok("home"))
      .unwrap();

    assert_eq!(storage.clear_all().unwrap(), 2);
    assert!(storage.keys().unwrap().is_empty());
    assert!(storage.match_any(&request("/")).unwrap().is_none());
    assert_eq!(storage.clear_all().unwrap(), 0);
  }

  #[test]
  fn test_put_all_writes_everything() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let entries = vec![
      (request("/a.html"), Response::ok("a")),
      (request("/b.css"), Response::ok("b")),
    ];

    storage.put_all("static", &entries).unwrap();

    let infos = storage.entries("static").unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].url, "https://space-tourism.test/a.html");
    assert_eq!(infos[0].size, 1);
    assert_eq!(infos[1].status, 200);
  }

  #[test]
  fn test_open_path_creates_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open_path(&path).unwrap();
      storage.put("static", &request("/"), &Response::ok("home")).unwrap();
    }

    let reopened = SqliteStorage::open_path(&path).unwrap();
    assert_eq!(reopened.keys().unwrap(), vec!["static"]);
    assert!(reopened.match_any(&request("/")).unwrap().is_some());
  }
}

//! Local storage
//!
//! A small key/value table on SQLite that holds the session token and the
//! cached user. Every change is published as a [`StorageEvent`] so the
//! session layer can react to logouts, including ones made by another
//! process sharing the same file (see [`LocalStore::poll_external`]).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{AppError, AppResult};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// Change was made by another process on the same file
    pub external: bool,
}

pub struct LocalStore {
    conn: Mutex<Connection>,
    /// Last value this instance wrote or observed, per key
    known: Mutex<HashMap<String, Option<String>>>,
    events: broadcast::Sender<StorageEvent>,
}

impl LocalStore {
    /// Opens (creating if needed) the storage file.
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        log::info!("[storage] opening {:?}", path);
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // WAL lets a second instance read while we write; not fatal if unsupported
        if let Err(e) = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0)) {
            log::warn!("[storage] WAL unavailable: {}", e);
        }
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AppResult<Self> {
        create_tables(&conn)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            known: Mutex::new(HashMap::new()),
            events,
        })
    }

    fn get_conn(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Custom("Storage lock error".to_string()))
    }

    fn remember(&self, key: &str, value: Option<String>) -> Option<String> {
        match self.known.lock() {
            Ok(mut known) => known.insert(key.to_string(), value).flatten(),
            Err(_) => None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StorageEvent) {
        log::debug!(
            "[storage] '{}' changed (external: {}, present: {})",
            event.key,
            event.external,
            event.new_value.is_some()
        );
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn read(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row("SELECT value FROM storage WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.read(key)
    }

    pub fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let old_value = self.read(key)?;
        {
            let conn = self.get_conn()?;
            conn.execute(
                r#"INSERT INTO storage (key, value, updated_at) VALUES (?1, ?2, ?3)
                   ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
                params![key, value, Utc::now().to_rfc3339()],
            )?;
        }
        self.remember(key, Some(value.to_string()));
        if old_value.as_deref() != Some(value) {
            self.publish(StorageEvent {
                key: key.to_string(),
                old_value,
                new_value: Some(value.to_string()),
                external: false,
            });
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> AppResult<()> {
        let old_value = self.read(key)?;
        {
            let conn = self.get_conn()?;
            conn.execute("DELETE FROM storage WHERE key = ?1", [key])?;
        }
        self.remember(key, None);
        if old_value.is_some() {
            self.publish(StorageEvent {
                key: key.to_string(),
                old_value,
                new_value: None,
                external: false,
            });
        }
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> AppResult<()> {
        self.set(key, &serde_json::to_string(value)?)
    }

    /// Re-reads `keys` and publishes an external event for each one that
    /// differs from what this instance last wrote or saw.
    pub fn poll_external(&self, keys: &[&str]) -> AppResult<Vec<StorageEvent>> {
        let mut changed = Vec::new();
        for key in keys {
            let current = self.read(key)?;
            let previous = {
                let known = self
                    .known
                    .lock()
                    .map_err(|_| AppError::Custom("Storage lock error".to_string()))?;
                match known.get(*key) {
                    Some(v) => v.clone(),
                    // first look at this key, nothing to compare against
                    None => current.clone(),
                }
            };
            self.remember(key, current.clone());
            if previous != current {
                let event = StorageEvent {
                    key: key.to_string(),
                    old_value: previous,
                    new_value: current,
                    external: true,
                };
                self.publish(event.clone());
                changed.push(event);
            }
        }
        Ok(changed)
    }
}

/// Creates the storage table.
fn create_tables(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS storage (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let store = LocalStore::open_in_memory().unwrap();
        assert_eq!(store.get("access_token").unwrap(), None);

        store.set("access_token", "abc").unwrap();
        assert_eq!(store.get("access_token").unwrap().as_deref(), Some("abc"));

        store.set("access_token", "def").unwrap();
        assert_eq!(store.get("access_token").unwrap().as_deref(), Some("def"));

        store.remove("access_token").unwrap();
        assert_eq!(store.get("access_token").unwrap(), None);
    }

    #[test]
    fn test_events_only_on_change() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut rx = store.subscribe();

        store.set("k", "v").unwrap();
        store.set("k", "v").unwrap();
        store.remove("k").unwrap();
        store.remove("k").unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.new_value.as_deref(), Some("v"));
        assert!(!first.external);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.old_value.as_deref(), Some("v"));
        assert_eq!(second.new_value, None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let store = LocalStore::open_in_memory().unwrap();
        store.set_json("ids", &vec![1, 2, 3]).unwrap();
        let ids: Vec<i32> = store.get_json("ids").unwrap().unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_poll_detects_other_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.db");
        let first = LocalStore::open(&path).unwrap();
        let second = LocalStore::open(&path).unwrap();

        first.set("access_token", "abc").unwrap();
        // second has never looked at the key yet
        assert!(second.poll_external(&["access_token"]).unwrap().is_empty());

        first.remove("access_token").unwrap();
        let mut rx = second.subscribe();
        let changed = second.poll_external(&["access_token"]).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].old_value.as_deref(), Some("abc"));
        assert_eq!(changed[0].new_value, None);
        assert!(rx.try_recv().unwrap().external);

        // own writes are not reported as external
        second.set("access_token", "xyz").unwrap();
        assert!(second.poll_external(&["access_token"]).unwrap().is_empty());
    }
}

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::backends::LocalCache;
use crate::error::SyncError;
use crate::messages::OfflineQueueEntry;
use crate::state::ChatMessage;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS chat_messages (
        chat_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (chat_id, position)
    );
    CREATE TABLE IF NOT EXISTS offline_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        body TEXT NOT NULL
    );";

/// `LocalCache` backed by `messages.sqlite3` in the app data dir.
pub struct SqliteLocalCache {
    conn: Mutex<Connection>,
}

impl SqliteLocalCache {
    pub fn open(data_dir: &str) -> Result<Self, SyncError> {
        let path = Path::new(data_dir).join("messages.sqlite3");
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SyncError> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Persistence("message cache lock poisoned".into()))
    }
}

impl LocalCache for SqliteLocalCache {
    fn cached_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, SyncError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT body FROM chat_messages WHERE chat_id = ?1 ORDER BY position")?;
        let rows = stmt.query_map([chat_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }

    fn cache_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<(), SyncError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chat_messages WHERE chat_id = ?1", [chat_id])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO chat_messages (chat_id, position, body) VALUES (?1, ?2, ?3)",
            )?;
            for (position, message) in messages.iter().enumerate() {
                let body = serde_json::to_string(message)?;
                insert.execute(params![chat_id, position as i64, body])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn offline_queue(&self) -> Result<Vec<OfflineQueueEntry>, SyncError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT body FROM offline_queue ORDER BY seq")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }

    fn push_offline_queue(&self, entry: &OfflineQueueEntry) -> Result<(), SyncError> {
        let body = serde_json::to_string(entry)?;
        self.conn()?
            .execute("INSERT INTO offline_queue (body) VALUES (?1)", [body])?;
        Ok(())
    }

    fn remove_from_offline_queue(&self, index: usize) -> Result<(), SyncError> {
        self.conn()?.execute(
            "DELETE FROM offline_queue WHERE seq =
                (SELECT seq FROM offline_queue ORDER BY seq LIMIT 1 OFFSET ?1)",
            [index as i64],
        )?;
        Ok(())
    }
}

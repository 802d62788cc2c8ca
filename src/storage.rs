use crate::api::models::User;
use directories::ProjectDirs;
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn db_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("com", "example", "Chatline")?;
    Some(proj.data_dir().join("cache.sqlite"))
}

// Caching the roster so the user list shows up before the first fetch returns
pub struct UserCache {
    conn: Connection,
}

impl UserCache {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                full_name TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                raw_json TEXT
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    pub fn upsert_users(&self, users: &[User]) -> rusqlite::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let tx = self.conn.unchecked_transaction()?;
        for u in users {
            let raw = serde_json::to_string(u).ok();
            tx.execute(
                r#"
                INSERT INTO users (id, full_name, updated_at, raw_json)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    full_name=excluded.full_name,
                    updated_at=excluded.updated_at,
                    raw_json=excluded.raw_json
                "#,
                params![u.id, u.full_name, now, raw],
            )?;
        }
        tx.commit()
    }

    pub fn cached_users(&self, limit: usize) -> rusqlite::Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, full_name, raw_json FROM users ORDER BY updated_at DESC, full_name ASC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let id: String = row.get(0)?;
            let full_name: String = row.get(1)?;
            let raw: Option<String> = row.get(2)?;
            Ok(raw
                .and_then(|r| serde_json::from_str::<User>(&r).ok())
                .unwrap_or(User { id, full_name, email: None, profile_pic: None }))
        })?;
        rows.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, name: &str) -> User {
        User { id: id.into(), full_name: name.into(), email: Some(format!("{id}@example.com")), profile_pic: None }
    }

    #[test]
    fn upsert_overwrites_by_id() {
        let cache = UserCache::open_in_memory().unwrap();
        cache.upsert_users(&[user("u1", "Ada"), user("u2", "Grace")]).unwrap();
        cache.upsert_users(&[user("u1", "Ada Lovelace")]).unwrap();

        let users = cache.cached_users(10).unwrap();
        assert_eq!(users.len(), 2);
        let ada = users.iter().find(|u| u.id == "u1").unwrap();
        assert_eq!(ada.full_name, "Ada Lovelace");
        assert_eq!(ada.email.as_deref(), Some("u1@example.com"));
    }

    #[test]
    fn limit_is_applied() {
        let cache = UserCache::open_in_memory().unwrap();
        cache.upsert_users(&[user("a", "A"), user("b", "B"), user("c", "C")]).unwrap();
        assert_eq!(cache.cached_users(2).unwrap().len(), 2);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite");
        UserCache::open(&path).unwrap().upsert_users(&[user("u1", "Ada")]).unwrap();

        let users = UserCache::open(&path).unwrap().cached_users(10).unwrap();
        assert_eq!(users, vec![user("u1", "Ada")]);
    }
}

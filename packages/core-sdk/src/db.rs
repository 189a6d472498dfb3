use std::{path::Path, sync::Mutex, thread, time::Duration};

use anyhow::{anyhow, bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::{
    config::SettingsStore,
    models::{ChatMessage, Role},
};

#[derive(Debug, Clone)]
pub struct ChatSummary {
    pub id: i64,
    pub title: String,
    pub model: String,
}

/**
 * \brief 带主键的消息结构。
 */
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /** \brief 消息行主键。 */
    pub id: i64,
    /** \brief 消息角色。 */
    pub role: Role,
    /** \brief 消息正文。 */
    pub content: String,
}

/**
 * \brief 打开默认数据库文件（PROMPTDECK_DB 或当前目录下的 promptdeck.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    let path = std::env::var("PROMPTDECK_DB").unwrap_or_else(|_| "promptdeck.db".to_string());
    open_db(Path::new(&path))
}

pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            model TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id INTEGER NOT NULL REFERENCES chats(id),
            role TEXT NOT NULL,
            content TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 读取配置项。
 */
pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val)
}

/**
 * \brief 写入配置项（存在则覆盖）。
 */
pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

pub fn clear_config(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM app_config WHERE key=?1", params![key]))?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_config(conn, key)?.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_config(conn, "telemetry_enabled", if enabled { "1" } else { "0" })
}

/**
 * \brief 创建会话。
 */
pub fn create_chat(conn: &Connection, title: &str, model: &str) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO chats (title, model) VALUES (?1, ?2)",
            params![title, model],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn get_chat(conn: &Connection, chat_id: i64) -> Result<Option<ChatSummary>> {
    let chat = conn
        .query_row(
            "SELECT id, title, model FROM chats WHERE id=?1",
            params![chat_id],
            |row| {
                Ok(ChatSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    model: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(chat)
}

/**
 * \brief 插入一条消息。
 */
pub fn insert_message(conn: &Connection, chat_id: i64, role: Role, content: &str) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO messages (chat_id, role, content) VALUES (?1, ?2, ?3)",
            params![chat_id, role.as_str(), content],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 读取指定会话的全部消息，按写入顺序。
 */
pub fn load_messages(conn: &Connection, chat_id: i64) -> Result<Vec<ChatMessage>> {
    Ok(load_messages_with_meta(conn, chat_id)?
        .into_iter()
        .map(|m| ChatMessage::new(m.role, m.content))
        .collect())
}

/**
 * \brief 读取带主键的消息数组，用于界面展示。
 */
pub fn load_messages_with_meta(conn: &Connection, chat_id: i64) -> Result<Vec<StoredMessage>> {
    let mut stmt =
        conn.prepare("SELECT id, role, content FROM messages WHERE chat_id=?1 ORDER BY id ASC")?;
    let rows = stmt
        .query_map(params![chat_id], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                role: Role::parse(&row.get::<_, String>(1)?),
                content: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 列出会话，最新的在前。
 */
pub fn list_chats(conn: &Connection) -> Result<Vec<ChatSummary>> {
    let mut stmt = conn.prepare("SELECT id, title, model FROM chats ORDER BY id DESC")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ChatSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                model: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 删除会话及其消息。
 */
pub fn delete_chat(conn: &Connection, chat_id: i64) -> Result<()> {
    retry_on_locked(|| {
        conn.execute("DELETE FROM messages WHERE chat_id=?1", params![chat_id])?;
        conn.execute("DELETE FROM chats WHERE id=?1", params![chat_id])
    })?;
    Ok(())
}

/**
 * \brief 重命名会话。
 */
pub fn update_chat_title(conn: &Connection, chat_id: i64, title: &str) -> Result<()> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        bail!("chat title must not be empty");
    }
    let affected = retry_on_locked(|| {
        conn.execute(
            "UPDATE chats SET title=?1 WHERE id=?2",
            params![trimmed, chat_id],
        )
    })?;
    if affected == 0 {
        return Err(anyhow!("chat {} not found", chat_id));
    }
    Ok(())
}

/**
 * \brief 基于 SQLite `app_config` 表的设置存储。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /** \brief 接管连接并确保表结构存在。 */
    pub fn new(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_default() -> Result<Self> {
        Self::new(open_default_db()?)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("settings connection poisoned"))?;
        f(&guard)
    }
}

impl SettingsStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|c| get_config(c, key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|c| set_config(c, key, value))
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.with_conn(|c| clear_config(c, key))
    }
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并线性退避，最多重试 5 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: u64 = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Err(rusqlite::Error::SqliteFailure(err, _))
                if attempt < MAX_RETRIES
                    && matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt));
            }
            other => return Ok(other?),
        }
    }
}

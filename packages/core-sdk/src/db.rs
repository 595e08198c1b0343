use anyhow::{bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, thread, time::Duration};

use crate::models::{User, UserRole};

/**
 * \brief 打开指定路径的数据库文件。
 */
pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
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
        CREATE TABLE IF NOT EXISTS users (
            username TEXT PRIMARY KEY,
            password TEXT NOT NULL,
            role     TEXT NOT NULL DEFAULT 'user'
        );
        "#,
        )
    })?;

    ensure_users_role_column(conn)?;
    Ok(())
}

/** \brief 早期库表没有 role 列，补齐后默认为 user。 */
fn ensure_users_role_column(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(users)")?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == "role" {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| {
            conn.execute(
                "ALTER TABLE users ADD COLUMN role TEXT NOT NULL DEFAULT 'user'",
                [],
            )
        })?;
    }
    Ok(())
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role: String = row.get(2)?;
    Ok(User {
        username: row.get(0)?,
        password: row.get(1)?,
        role: UserRole::parse(&role),
    })
}

/**
 * \brief 新增用户；用户名已存在时失败。
 */
pub fn insert_user(conn: &Connection, username: &str, password: &str, role: UserRole) -> Result<()> {
    if get_user(conn, username)?.is_some() {
        bail!("user {} already exists", username);
    }
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO users (username, password, role) VALUES (?1, ?2, ?3)",
            params![username, password, role.as_str()],
        )
    })?;
    Ok(())
}

/**
 * \brief 按用户名读取用户。
 */
pub fn get_user(conn: &Connection, username: &str) -> Result<Option<User>> {
    conn.query_row(
        "SELECT username, password, role FROM users WHERE username=?1",
        params![username],
        map_user,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出所有用户。
 */
pub fn list_users(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn.prepare("SELECT username, password, role FROM users ORDER BY username ASC")?;
    let rows = stmt
        .query_map([], map_user)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 删除用户。
 */
pub fn delete_user(conn: &Connection, username: &str) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute("DELETE FROM users WHERE username=?1", params![username])
    })?;
    if rows == 0 {
        bail!("user {} not found", username);
    }
    Ok(())
}

/**
 * \brief 替换用户的口令摘要。
 */
pub fn set_password(conn: &Connection, username: &str, password: &str) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE users SET password=?1 WHERE username=?2",
            params![password, username],
        )
    })?;
    if rows == 0 {
        bail!("user {} not found", username);
    }
    Ok(())
}

pub fn count_admins(conn: &Connection) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role='admin'",
        [],
        |row| row.get(0),
    )?;
    Ok(n)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

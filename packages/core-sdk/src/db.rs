use anyhow::{Context, Result};
pub use rusqlite::Connection;
use rusqlite::{params, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use std::{path::Path, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::StoreError;
use crate::keys::DEFAULT_ENTRY_ID;
use crate::models::{Character, CredentialEntry, Segment, Story};

/** \brief 凭据池在 app_config 中的键名。 */
pub const KEY_POOL_CONFIG_KEY: &str = "storyloom.api_keys";
const USE_DEFAULT_KEY: &str = "use_default_key";
const TELEMETRY_KEY: &str = "telemetry_enabled";

/**
 * \brief 打开数据库文件。
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
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

        CREATE TABLE IF NOT EXISTS stories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS segments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            story_id INTEGER NOT NULL REFERENCES stories(id),
            position INTEGER NOT NULL,
            content TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS characters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            story_id INTEGER NOT NULL REFERENCES stories(id),
            name TEXT NOT NULL
        );
        "#,
        )
    })?;

    ensure_column(
        conn,
        "characters",
        "description",
        "ALTER TABLE characters ADD COLUMN description TEXT NOT NULL DEFAULT ''",
    )?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, ddl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| conn.execute(ddl, []))?;
    }
    Ok(())
}

fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key=?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    set_config(conn, key, if value { "1" } else { "0" })
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_config(conn, key)?.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取凭据池（JSON 数组）；未保存过时返回空列表。
 */
pub fn load_key_pool(conn: &Connection) -> Result<Vec<CredentialEntry>> {
    match get_config(conn, KEY_POOL_CONFIG_KEY)? {
        Some(raw) => parse_key_pool(&raw),
        None => Ok(Vec::new()),
    }
}

/**
 * \brief 保存凭据池；默认凭据不落盘。
 */
pub fn save_key_pool(conn: &Connection, pool: &[CredentialEntry]) -> Result<()> {
    let stored: Vec<&CredentialEntry> = pool.iter().filter(|e| !e.is_default).collect();
    let raw = serde_json::to_string(&stored)?;
    set_config(conn, KEY_POOL_CONFIG_KEY, &raw)
}

/**
 * \brief 解析凭据池 JSON，并校验 ID 唯一。
 */
pub fn parse_key_pool(raw: &str) -> Result<Vec<CredentialEntry>> {
    let mut pool: Vec<CredentialEntry> =
        serde_json::from_str(raw).context("invalid key pool JSON")?;
    pool.retain(|e| !e.is_default);
    let mut ids = std::collections::HashSet::new();
    for entry in pool.iter_mut() {
        if !ids.insert(entry.id.clone()) {
            return Err(StoreError::invalid(format!("duplicate key id {}", entry.id)).into());
        }
        entry.normalize();
    }
    Ok(pool)
}

/**
 * \brief 导出凭据池为格式化 JSON。
 */
pub fn export_key_pool(conn: &Connection) -> Result<String> {
    let pool = load_key_pool(conn)?;
    Ok(serde_json::to_string_pretty(&pool)?)
}

/**
 * \brief 用 JSON 整体替换凭据池，返回条目数。
 */
pub fn import_key_pool(conn: &Connection, raw: &str) -> Result<usize> {
    let pool = parse_key_pool(raw)?;
    with_immediate_tx(conn, |tx| save_key_pool(tx, &pool))?;
    Ok(pool.len())
}

/**
 * \brief 在写事务内对凭据池做读-改-写。
 * \details BEGIN IMMEDIATE 先占写锁，并发请求依次执行，不会互相覆盖。
 */
fn modify_key_pool<T, F>(conn: &Connection, change: F) -> Result<T>
where
    F: FnOnce(&mut Vec<CredentialEntry>) -> Result<T>,
{
    with_immediate_tx(conn, |tx| {
        let mut pool = load_key_pool(tx)?;
        let value = change(&mut pool)?;
        save_key_pool(tx, &pool)?;
        Ok(value)
    })
}

fn key_not_found(id: &str) -> anyhow::Error {
    StoreError::not_found(format!("key id {}", id)).into()
}

/**
 * \brief 新增凭据（追加到末尾，即最低优先级）。
 */
pub fn insert_key_entry(conn: &Connection, entry: CredentialEntry) -> Result<()> {
    if entry.id == DEFAULT_ENTRY_ID {
        return Err(StoreError::invalid(format!("key id {} is reserved", DEFAULT_ENTRY_ID)).into());
    }
    let mut entry = entry;
    entry.is_default = false;
    entry.normalize();
    modify_key_pool(conn, |pool| {
        if pool.iter().any(|e| e.id == entry.id) {
            return Err(StoreError::invalid(format!("key id {} already exists", entry.id)).into());
        }
        pool.push(entry);
        Ok(())
    })
}

/**
 * \brief 更新凭据（保持原有位置）。
 */
pub fn update_key_entry(conn: &Connection, entry: CredentialEntry) -> Result<()> {
    modify_key_pool(conn, |pool| {
        let slot = pool
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or_else(|| key_not_found(&entry.id))?;
        *slot = entry;
        slot.is_default = false;
        slot.normalize();
        Ok(())
    })
}

/**
 * \brief 删除凭据。
 */
pub fn delete_key_entry(conn: &Connection, id: &str) -> Result<()> {
    modify_key_pool(conn, |pool| {
        let before = pool.len();
        pool.retain(|e| e.id != id);
        if pool.len() == before {
            return Err(key_not_found(id));
        }
        Ok(())
    })
}

/**
 * \brief 切换某条凭据中单把密钥的启用状态。
 */
pub fn toggle_key(conn: &Connection, id: &str, index: usize) -> Result<bool> {
    modify_key_pool(conn, |pool| {
        let entry = pool
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| key_not_found(id))?;
        entry.toggle_key(index).ok_or_else(|| {
            anyhow::Error::from(StoreError::invalid(format!(
                "key id {} has no key #{}",
                id, index
            )))
        })
    })
}

/**
 * \brief 调整凭据优先级：移动到 new_position（越界则放到末尾）。
 */
pub fn move_key_entry(conn: &Connection, id: &str, new_position: usize) -> Result<()> {
    modify_key_pool(conn, |pool| {
        let from = pool
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| key_not_found(id))?;
        let entry = pool.remove(from);
        let to = new_position.min(pool.len());
        pool.insert(to, entry);
        Ok(())
    })
}

/**
 * \brief 是否启用内置默认凭据（默认开启）。
 */
pub fn get_use_default_key(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, USE_DEFAULT_KEY, true)
}

pub fn set_use_default_key(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, USE_DEFAULT_KEY, enabled)
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, TELEMETRY_KEY, false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, TELEMETRY_KEY, enabled)
}

/**
 * \brief 创建故事。
 */
pub fn create_story(conn: &Connection, title: &str) -> Result<i64> {
    let created_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO stories (title, created_at) VALUES (?1, ?2)",
            params![title, created_at],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

fn map_story(row: &rusqlite::Row<'_>) -> rusqlite::Result<Story> {
    Ok(Story {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
    })
}

/**
 * \brief 列出全部故事（新建在前）。
 */
pub fn list_stories(conn: &Connection) -> Result<Vec<Story>> {
    let mut stmt = conn.prepare("SELECT id, title, created_at FROM stories ORDER BY id DESC")?;
    let rows = stmt
        .query_map([], map_story)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_story(conn: &Connection, id: i64) -> Result<Option<Story>> {
    conn.query_row(
        "SELECT id, title, created_at FROM stories WHERE id=?1",
        params![id],
        map_story,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 更新故事标题。
 */
pub fn rename_story(conn: &Connection, id: i64, title: &str) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE stories SET title=?1 WHERE id=?2",
            params![title, id],
        )
    })?;
    if rows == 0 {
        return Err(StoreError::not_found(format!("story id {}", id)).into());
    }
    Ok(())
}

/**
 * \brief 删除故事及其片段、角色。
 */
pub fn delete_story(conn: &Connection, id: i64) -> Result<()> {
    with_immediate_tx(conn, |tx| {
        tx.execute("DELETE FROM segments WHERE story_id=?1", params![id])?;
        tx.execute("DELETE FROM characters WHERE story_id=?1", params![id])?;
        tx.execute("DELETE FROM stories WHERE id=?1", params![id])?;
        Ok(())
    })
}

/**
 * \brief 在故事末尾追加片段。
 */
pub fn append_segment(conn: &Connection, story_id: i64, content: &str) -> Result<i64> {
    if get_story(conn, story_id)?.is_none() {
        return Err(StoreError::not_found(format!("story id {}", story_id)).into());
    }
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM segments WHERE story_id=?1",
        params![story_id],
        |row| row.get(0),
    )?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO segments (story_id, position, content) VALUES (?1, ?2, ?3)",
            params![story_id, next, content],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

fn map_segment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Segment> {
    Ok(Segment {
        id: row.get(0)?,
        story_id: row.get(1)?,
        position: row.get(2)?,
        content: row.get(3)?,
    })
}

/**
 * \brief 按顺序读取故事片段。
 */
pub fn load_segments(conn: &Connection, story_id: i64) -> Result<Vec<Segment>> {
    let mut stmt = conn.prepare(
        "SELECT id, story_id, position, content FROM segments WHERE story_id=?1 ORDER BY position ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![story_id], map_segment)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_segment(conn: &Connection, id: i64) -> Result<Option<Segment>> {
    conn.query_row(
        "SELECT id, story_id, position, content FROM segments WHERE id=?1",
        params![id],
        map_segment,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 用空行拼接全部片段，得到故事全文。
 */
pub fn story_text(conn: &Connection, story_id: i64) -> Result<String> {
    Ok(load_segments(conn, story_id)?
        .into_iter()
        .map(|s| s.content)
        .collect::<Vec<_>>()
        .join("\n\n"))
}

/**
 * \brief 用单个片段替换故事全部正文（整篇改写后使用）。
 */
pub fn replace_story_text(conn: &Connection, story_id: i64, content: &str) -> Result<i64> {
    with_immediate_tx(conn, |tx| {
        tx.execute("DELETE FROM segments WHERE story_id=?1", params![story_id])?;
        append_segment(tx, story_id, content)
    })
}

/**
 * \brief 更新片段正文。
 */
pub fn update_segment(conn: &Connection, id: i64, content: &str) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE segments SET content=?1 WHERE id=?2",
            params![content, id],
        )
    })?;
    if rows == 0 {
        return Err(segment_not_found(id));
    }
    Ok(())
}

/**
 * \brief 删除片段并压紧后续位置。
 */
pub fn delete_segment(conn: &Connection, id: i64) -> Result<()> {
    with_immediate_tx(conn, |tx| {
        let segment = get_segment(tx, id)?.ok_or_else(|| segment_not_found(id))?;
        tx.execute("DELETE FROM segments WHERE id=?1", params![id])?;
        renumber_segments(tx, segment.story_id)
    })
}

/**
 * \brief 将片段移动到 new_position（0 起，越界则放到末尾）。
 */
pub fn move_segment(conn: &Connection, id: i64, new_position: usize) -> Result<()> {
    with_immediate_tx(conn, |tx| {
        let segment = get_segment(tx, id)?.ok_or_else(|| segment_not_found(id))?;
        let mut order: Vec<i64> = load_segments(tx, segment.story_id)?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let from = order
            .iter()
            .position(|&sid| sid == id)
            .ok_or_else(|| segment_not_found(id))?;
        let moved = order.remove(from);
        let to = new_position.min(order.len());
        order.insert(to, moved);
        write_positions(tx, &order)
    })
}

fn segment_not_found(id: i64) -> anyhow::Error {
    StoreError::not_found(format!("segment id {}", id)).into()
}

fn renumber_segments(conn: &Connection, story_id: i64) -> Result<()> {
    let order: Vec<i64> = load_segments(conn, story_id)?
        .into_iter()
        .map(|s| s.id)
        .collect();
    write_positions(conn, &order)
}

fn write_positions(conn: &Connection, order: &[i64]) -> Result<()> {
    let mut stmt = conn.prepare("UPDATE segments SET position=?1 WHERE id=?2")?;
    for (position, sid) in order.iter().enumerate() {
        stmt.execute(params![position as i64, sid])?;
    }
    Ok(())
}

/**
 * \brief 为故事添加角色。
 */
pub fn insert_character(
    conn: &Connection,
    story_id: i64,
    name: &str,
    description: &str,
) -> Result<i64> {
    if get_story(conn, story_id)?.is_none() {
        return Err(StoreError::not_found(format!("story id {}", story_id)).into());
    }
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO characters (story_id, name, description) VALUES (?1, ?2, ?3)",
            params![story_id, name, description],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn list_characters(conn: &Connection, story_id: i64) -> Result<Vec<Character>> {
    let mut stmt = conn.prepare(
        "SELECT id, story_id, name, description FROM characters WHERE story_id=?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![story_id], |row| {
            Ok(Character {
                id: row.get(0)?,
                story_id: row.get(1)?,
                name: row.get(2)?,
                description: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_character(conn: &Connection, id: i64) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM characters WHERE id=?1", params![id]))?;
    Ok(())
}

/**
 * \brief 以 BEGIN IMMEDIATE 开启写事务执行 body；出错时回滚。
 */
fn with_immediate_tx<T, F>(conn: &Connection, body: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    let tx = retry_on_locked(|| Transaction::new_unchecked(conn, TransactionBehavior::Immediate))?;
    let value = body(&tx)?;
    tx.commit()?;
    Ok(value)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最多尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    fn entry(id: &str) -> CredentialEntry {
        CredentialEntry::new(id, format!("key {}", id), vec![format!("sk-{}", id)])
    }

    #[test]
    fn test_key_pool_crud_keeps_order() {
        let conn = mem_conn();
        assert!(load_key_pool(&conn).expect("load empty").is_empty());

        insert_key_entry(&conn, entry("a")).expect("insert a");
        insert_key_entry(&conn, entry("b").with_endpoint("https://api.example.com/v1", "m"))
            .expect("insert b");
        insert_key_entry(&conn, entry("c")).expect("insert c");
        assert!(insert_key_entry(&conn, entry("a")).is_err());
        assert!(insert_key_entry(&conn, entry(DEFAULT_ENTRY_ID)).is_err());

        let pool = load_key_pool(&conn).expect("load");
        let ids: Vec<_> = pool.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(pool[1].model_id.as_deref(), Some("m"));

        move_key_entry(&conn, "c", 0).expect("move c");
        delete_key_entry(&conn, "a").expect("delete a");
        let ids: Vec<_> = load_key_pool(&conn)
            .expect("load")
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert!(delete_key_entry(&conn, "zzz").is_err());
    }

    #[test]
    fn test_update_and_toggle_key() {
        let conn = mem_conn();
        insert_key_entry(
            &conn,
            CredentialEntry::new("multi", "multi", vec!["k0".into(), "k1".into()]),
        )
        .expect("insert");
        assert!(!toggle_key(&conn, "multi", 0).expect("toggle off"));
        assert!(toggle_key(&conn, "multi", 7).is_err());

        let mut updated = load_key_pool(&conn).expect("load").remove(0);
        assert_eq!(updated.active_indexes, BTreeSet::from([1]));
        updated.keys = vec!["only".into()];
        update_key_entry(&conn, updated).expect("update");
        let stored = load_key_pool(&conn).expect("load").remove(0);
        assert!(stored.active_indexes.is_empty());
    }

    #[test]
    fn test_key_pool_json_shape_and_import() {
        let conn = mem_conn();
        let raw = r#"[
            {"id":"a","name":"Gemini","keys":["k1","k2"],"activeIndexes":[1]},
            {"id":"b","name":"Router","keys":["k3"],"activeIndexes":[0],"endpoint":"https://openrouter.ai/api/v1","modelId":"x/y"},
            {"id":"default","name":"Default","keys":[""],"activeIndexes":[0],"isDefault":true}
        ]"#;
        assert_eq!(import_key_pool(&conn, raw).expect("import"), 2);
        let pool = load_key_pool(&conn).expect("load");
        assert_eq!(pool[0].first_active_secret(), Some((1, "k2")));
        assert_eq!(pool[1].model_id.as_deref(), Some("x/y"));

        let exported = export_key_pool(&conn).expect("export");
        assert!(exported.contains("\"activeIndexes\""));
        assert!(exported.contains("\"modelId\": \"x/y\""));
        assert!(!exported.contains("isDefault"));

        assert!(import_key_pool(&conn, "not json").is_err());
        assert!(import_key_pool(&conn, r#"[{"id":"a","name":"x"},{"id":"a","name":"y"}]"#).is_err());
    }

    #[test]
    fn test_concurrent_key_writes_are_all_kept() {
        let path = std::env::temp_dir().join(format!(
            "storyloom_db_pool_{}_{}.db",
            std::process::id(),
            crate::keys::new_entry_id()
        ));
        migrate(&open_db(&path).expect("open")).expect("migrate");

        thread::scope(|scope| {
            for worker in 0..8 {
                let path = &path;
                scope.spawn(move || {
                    let conn = open_db(path).expect("open worker conn");
                    for i in 0..5 {
                        insert_key_entry(&conn, entry(&format!("w{}-{}", worker, i)))
                            .expect("insert");
                    }
                    toggle_key(&conn, &format!("w{}-0", worker), 0).expect("toggle");
                });
            }
        });

        let conn = open_db(&path).expect("open");
        let pool = load_key_pool(&conn).expect("load");
        assert_eq!(pool.len(), 40);
        let inactive = pool.iter().filter(|e| e.active_indexes.is_empty()).count();
        assert_eq!(inactive, 8);
        drop(conn);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_rows_report_not_found() {
        let conn = mem_conn();
        insert_key_entry(&conn, entry("a")).expect("insert");
        let err = delete_key_entry(&conn, "zzz").unwrap_err();
        assert_eq!(StoreError::find(&err), Some(&StoreError::not_found("key id zzz")));
        let err = insert_key_entry(&conn, entry("a")).unwrap_err();
        assert!(matches!(StoreError::find(&err), Some(StoreError::Invalid(_))));
        let err = toggle_key(&conn, "a", 3).unwrap_err();
        assert!(matches!(StoreError::find(&err), Some(StoreError::Invalid(_))));
        let err = rename_story(&conn, 42, "x").unwrap_err();
        assert!(matches!(StoreError::find(&err), Some(StoreError::NotFound(_))));
        let err = move_segment(&conn, 42, 0).unwrap_err();
        assert!(matches!(StoreError::find(&err), Some(StoreError::NotFound(_))));
    }

    #[test]
    fn test_failed_multi_statement_writes_roll_back() {
        let conn = mem_conn();
        let story = create_story(&conn, "Kept").expect("create");
        append_segment(&conn, story, "One.").expect("append");
        append_segment(&conn, story, "Two.").expect("append");
        insert_character(&conn, story, "Mira", "").expect("char");

        conn.execute_batch(
            "CREATE TRIGGER block_insert BEFORE INSERT ON segments
             BEGIN SELECT RAISE(ABORT, 'blocked'); END;
             CREATE TRIGGER block_delete BEFORE DELETE ON stories
             BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
        )
        .expect("triggers");

        assert!(replace_story_text(&conn, story, "Gone?").is_err());
        assert_eq!(story_text(&conn, story).expect("text"), "One.\n\nTwo.");

        assert!(delete_story(&conn, story).is_err());
        assert_eq!(load_segments(&conn, story).expect("segments").len(), 2);
        assert_eq!(list_characters(&conn, story).expect("chars").len(), 1);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_settings_defaults() {
        let conn = mem_conn();
        assert!(get_use_default_key(&conn).expect("get"));
        set_use_default_key(&conn, false).expect("set");
        assert!(!get_use_default_key(&conn).expect("get"));
        assert!(!get_telemetry_enabled(&conn).expect("get"));
        set_telemetry_enabled(&conn, true).expect("set");
        assert!(get_telemetry_enabled(&conn).expect("get"));
    }

    #[test]
    fn test_story_segments_and_text() {
        let conn = mem_conn();
        let story = create_story(&conn, "Rain").expect("create story");
        let first = append_segment(&conn, story, "It rained.").expect("append 1");
        let second = append_segment(&conn, story, "Then it stopped.").expect("append 2");
        assert_eq!(story_text(&conn, story).expect("text"), "It rained.\n\nThen it stopped.");

        update_segment(&conn, first, "It poured.").expect("update");
        move_segment(&conn, second, 0).expect("move");
        let segments = load_segments(&conn, story).expect("load");
        assert_eq!(segments[0].id, second);
        assert_eq!(segments[0].position, 0);
        assert_eq!(segments[1].content, "It poured.");

        delete_segment(&conn, second).expect("delete");
        let only = load_segments(&conn, story).expect("load");
        assert_eq!(only.len(), 1);

        replace_story_text(&conn, story, "Rewritten.").expect("replace");
        assert_eq!(story_text(&conn, story).expect("text"), "Rewritten.");
        let fresh = append_segment(&conn, story, "Coda.").expect("append");
        delete_segment(&conn, fresh).expect("delete");
        let segments = load_segments(&conn, story).expect("load");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].position, 0);

        assert!(append_segment(&conn, story + 100, "orphan").is_err());
        assert!(update_segment(&conn, 9999, "x").is_err());
    }

    #[test]
    fn test_story_rename_delete_and_characters() {
        let conn = mem_conn();
        let story = create_story(&conn, "Draft").expect("create");
        rename_story(&conn, story, "Final").expect("rename");
        assert_eq!(get_story(&conn, story).expect("get").unwrap().title, "Final");
        assert!(rename_story(&conn, story + 1, "x").is_err());

        let mira = insert_character(&conn, story, "Mira", "cartographer").expect("char");
        insert_character(&conn, story, "Oren", "").expect("char 2");
        let chars = list_characters(&conn, story).expect("list");
        assert_eq!(chars.len(), 2);
        assert_eq!(chars[0].description, "cartographer");
        delete_character(&conn, mira).expect("delete char");
        assert_eq!(list_characters(&conn, story).expect("list").len(), 1);

        append_segment(&conn, story, "text").expect("append");
        delete_story(&conn, story).expect("delete story");
        assert!(list_stories(&conn).expect("list").is_empty());
        assert!(load_segments(&conn, story).expect("segments").is_empty());
    }
}

use std::{fs::OpenOptions, io::Write, path::PathBuf, sync::RwLock};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

const LOG_FILE: &str = "storyloom.log";

struct TelemetryState {
    enabled: bool,
    log_dir: PathBuf,
}

static TELEMETRY: Lazy<RwLock<TelemetryState>> = Lazy::new(|| {
    RwLock::new(TelemetryState {
        enabled: false,
        log_dir: PathBuf::from("logs"),
    })
});

/**
 * \brief 初始化遥测：开关与日志目录。
 */
pub fn init(enabled: bool, log_dir: impl Into<PathBuf>) {
    if let Ok(mut guard) = TELEMETRY.write() {
        guard.enabled = enabled;
        guard.log_dir = log_dir.into();
    }
}

/**
 * \brief 更新遥测开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY.write() {
        guard.enabled = enabled;
    }
}

/**
 * \brief 查询当前遥测开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY.read().map(|g| g.enabled).unwrap_or(false)
}

/**
 * \brief 当前日志文件路径。
 */
pub fn log_path() -> PathBuf {
    TELEMETRY
        .read()
        .map(|g| g.log_dir.join(LOG_FILE))
        .unwrap_or_else(|_| PathBuf::from("logs").join(LOG_FILE))
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    emit("INFO", category, message);
}

/**
 * \brief 记录可恢复的异常（如单把凭据失败）。
 */
pub fn log_warn(category: &str, message: &str) {
    emit("WARN", category, message);
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    emit("ERROR", category, message);
}

fn emit(level: &str, category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line(level, category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let path = log_path();
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}

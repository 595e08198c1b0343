use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing_subscriber::EnvFilter;

static AUDIT_ENABLED: Lazy<std::sync::RwLock<bool>> =
    Lazy::new(|| std::sync::RwLock::new(false));

/**
 * \brief 安装控制台日志（RUST_LOG 控制级别，缺省 info）。重复调用无副作用。
 */
pub fn init(audit_log: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    set_enabled(audit_log);
}

/**
 * \brief 更新审计日志开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = AUDIT_ENABLED.write() {
        *guard = enabled;
    }
}

pub fn is_enabled() -> bool {
    AUDIT_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    tracing::info!(category, "{}", message);
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, message) {
        tracing::warn!("audit log write failed: {}", err);
    }
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    tracing::error!(category, "{}", message);
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("ERROR", category, message) {
        tracing::warn!("audit log write failed: {}", err);
    }
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let log_dir = PathBuf::from("logs");
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("relaychat.log"))?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}

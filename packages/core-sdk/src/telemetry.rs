//! 本地事件日志（`logs/promptdeck.log`）与进程级计数器。

use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/** \brief 事件日志开关，默认关闭，由 `app_config.telemetry_enabled` 初始化。 */
static ENABLED: AtomicBool = AtomicBool::new(false);

/** \brief 进程内累计的无法解析的流式事件数。 */
static MALFORMED_EVENTS: AtomicU64 = AtomicU64::new(0);

static LOG_FILE: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PROMPTDECK_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("logs"))
        .join("promptdeck.log")
});

/** \brief 串行化写入，避免并发任务的行交错。 */
static WRITE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/** \brief 记录常规事件。 */
pub fn log_event(category: &str, message: &str) {
    emit(Level::Info, category, message);
}

/** \brief 可恢复的异常情况，如被跳过的流式数据。 */
pub fn log_warn(category: &str, message: &str) {
    emit(Level::Warn, category, message);
}

pub fn log_error(category: &str, message: &str) {
    emit(Level::Error, category, message);
}

/**
 * \brief 记录一条被跳过的流式事件。
 * \details 计数总是累加（与开关无关），日志只截取前 120 个字符。
 */
pub fn record_malformed_event(category: &str, line: &str) {
    MALFORMED_EVENTS.fetch_add(1, Ordering::Relaxed);
    let preview: String = line.chars().take(120).collect();
    log_warn(category, &format!("skipped malformed event: {}", preview));
}

/**
 * \brief 进程启动以来跳过的流式事件总数。
 */
pub fn malformed_events() -> u64 {
    MALFORMED_EVENTS.load(Ordering::Relaxed)
}

/**
 * \brief 开关打开时追加一行日志；写入失败只打印到 stderr，不影响调用方。
 */
fn emit(level: Level, category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = append(&format_line(level, category, message)) {
        eprintln!("telemetry write failed: {:#}", err);
    }
}

fn format_line(level: Level, category: &str, message: &str) -> String {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string());
    format!("{} [{}] {} - {}", timestamp, level.as_str(), category, message)
}

fn append(line: &str) -> Result<()> {
    let _guard = WRITE_LOCK.lock().map_err(|_| anyhow!("log lock poisoned"))?;
    if let Some(dir) = LOG_FILE.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE.as_path())
        .with_context(|| format!("open {}", LOG_FILE.display()))?;
    writeln!(file, "{}", line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format() {
        let line = format_line(Level::Warn, "sse", "skipped");
        assert!(line.ends_with(" [WARN] sse - skipped"));
    }

    #[test]
    fn test_malformed_counter_is_monotonic() {
        let before = malformed_events();
        record_malformed_event("test", "{not json");
        record_malformed_event("test", "also bad");
        assert!(malformed_events() >= before + 2);
    }
}

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

const LOG_FILE: &str = "localsite.log";

static EVENT_LOG_ENABLED: Lazy<std::sync::RwLock<bool>> =
    Lazy::new(|| std::sync::RwLock::new(false));

static LOG_DIR: Lazy<std::sync::RwLock<PathBuf>> =
    Lazy::new(|| std::sync::RwLock::new(PathBuf::from("logs")));

/**
 * \brief 安装 tracing 订阅者（RUST_LOG，默认 info），并按配置开启事件日志文件。
 * 重复调用时保留已安装的订阅者。
 */
pub fn init(settings: &Settings) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
    set_log_dir(settings.log_dir.clone());
    set_enabled(settings.telemetry_log);
}

/**
 * \brief 更新事件日志开关。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = EVENT_LOG_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 查询事件日志开关。
 */
pub fn is_enabled() -> bool {
    EVENT_LOG_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 修改事件日志目录，默认 `logs/`。
 */
pub fn set_log_dir(dir: impl Into<PathBuf>) {
    if let Ok(mut guard) = LOG_DIR.write() {
        *guard = dir.into();
    }
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, message) {
        tracing::warn!(error = %err, "event log write failed");
    }
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("ERROR", category, message) {
        tracing::warn!(error = %err, "event log write failed");
    }
}

/**
 * \brief 当前 UTC 时间的 RFC 3339 文本。
 */
pub fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let log_dir = LOG_DIR
        .read()
        .map(|g| g.clone())
        .unwrap_or_else(|_| PathBuf::from("logs"));
    append(&log_dir, level, category, message)
}

fn append(log_dir: &Path, level: &str, category: &str, message: &str) -> Result<()> {
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))?;
    writeln!(file, "{} [{}] {} - {}", timestamp(), level, category, message)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_line_format() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("logs");
        append(&nested, "INFO", "dispatch", "vendor=openai").expect("append");
        append(&nested, "ERROR", "dispatch", "vendor=openai status=401").expect("append");
        let text = std::fs::read_to_string(nested.join(LOG_FILE)).expect("read");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] dispatch - vendor=openai"));
        assert!(lines[1].contains("[ERROR]"));
    }

    #[test]
    fn test_event_log_follows_configured_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env: crate::config::EnvVars = [
            ("TELEMETRY_LOG", "true".to_string()),
            ("LOCALSITE_LOG_DIR", dir.path().display().to_string()),
        ]
        .into_iter()
        .collect();
        init(&Settings::from_env(&env));
        assert!(is_enabled());

        log_event("refresh", "providers=2");
        log_error("dispatch", "vendor=groq status=500");
        set_enabled(false);
        log_event("refresh", "after disable");

        let text = std::fs::read_to_string(dir.path().join(LOG_FILE)).expect("read");
        assert!(text.contains("[INFO] refresh - providers=2"));
        assert!(text.contains("[ERROR] dispatch - vendor=groq status=500"));
        assert!(!text.contains("after disable"));
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let ts = timestamp();
        assert!(ts.contains('T'));
        assert!(ts.ends_with('Z'));
    }
}

//! 日志初始化.
//!
//! 控制台层输出到 stderr (stdout 留给探测结果), 可选的文件层按天滚动.
//! 语法库使用 `log` 门面, 其记录经 tracing-log 桥接进入同一个 subscriber.

use anyhow::{Context, Result, anyhow};
use chrono::{Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, FormatEvent, FormatFields, format::Writer},
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// EnvFilter 语法, 如 `info` 或 `avcsyn_syntax=trace`
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志目录, 为空时只输出到控制台
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_true")]
    pub ansi: bool,
}

fn default_level() -> String {
    "warn".to_string()
}

fn default_file_prefix() -> String {
    "avcsyn".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            directory: None,
            file_prefix: default_file_prefix(),
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// 按命令行 `-v` 次数选择级别: 0=warn, 1=info, 2=debug, 3 及以上=trace
    pub fn from_verbosity(verbose: u8) -> Self {
        let level = match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        Self {
            level: level.to_string(),
            ..Self::default()
        }
    }

    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }
}

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// 安装全局 subscriber, 重复调用返回错误
pub fn init(config: &LoggingConfig) -> Result<()> {
    let console_filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("日志级别非法, level={}", config.level))?;
    let console_layer = fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .event_format(ConsoleFormatter { ansi: config.ansi })
        .with_filter(console_filter);

    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)
                .with_context(|| format!("创建日志目录失败, path={}", directory))?;
            let appender = tracing_appender::rolling::daily(Path::new(directory), &config.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            LOG_GUARD.set(guard).ok();
            let file_filter = EnvFilter::try_new(&config.level)
                .with_context(|| format!("日志级别非法, level={}", config.level))?;
            Some(
                fmt::Layer::default()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(FileFormatter)
                    .with_filter(file_filter),
            )
        }
        None => None,
    };

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!("安装日志 subscriber 失败: {}", err))
}

fn write_timestamp(writer: &mut Writer<'_>) -> std::fmt::Result {
    let now = Local::now();
    write!(
        writer,
        "[{:02}-{:02} {:02}:{:02}:{:02}.{:03}] ",
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.timestamp_subsec_millis()
    )
}

struct ConsoleFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        write_timestamp(&mut writer)?;
        if self.ansi {
            let color = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                _ => "\x1b[34m",
            };
            write!(writer, "{}{:5}\x1b[0m ", color, meta.level().to_string())?;
        } else {
            write!(writer, "{:5} ", meta.level().to_string())?;
        }
        write!(writer, "{} > ", meta.target())?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        write_timestamp(&mut writer)?;
        write!(writer, "{:5} {} > ", meta.level().to_string(), meta.target())?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(LoggingConfig::from_verbosity(0).level, "warn");
        assert_eq!(LoggingConfig::from_verbosity(1).level, "info");
        assert_eq!(LoggingConfig::from_verbosity(2).level, "debug");
        assert_eq!(LoggingConfig::from_verbosity(9).level, "trace");
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"directory": "logs"}"#).expect("配置解析失败");
        assert_eq!(config.level, "warn");
        assert_eq!(config.directory.as_deref(), Some("logs"));
        assert_eq!(config.file_prefix, "avcsyn");
        assert!(config.ansi);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let config = LoggingConfig {
            level: "avcsyn_syntax=verbose".to_string(),
            ..LoggingConfig::default()
        };
        let err = init(&config).expect_err("非法级别应失败");
        let msg = format!("{:#}", err);
        assert!(msg.contains("日志级别非法"), "错误信息不符, actual={}", msg);
    }
}

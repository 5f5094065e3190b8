use std::sync::OnceLock;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{env_is_true, env_or_default};

// 全局变量用于保持日志文件句柄
static INFO_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static ERROR_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

// 日志配置结构体
#[derive(Debug, Clone)]
struct LogConfig {
    app_env: String,
    log_level: String,
    log_dir: String,
    log_rotation: String,
    info_file_name: String,
    error_file_name: String,
    enable_console_logging: bool,
    json_console: bool,
}

impl LogConfig {
    fn from_env() -> Self {
        Self {
            app_env: env_or_default("APP_ENV", "local"),
            log_level: env_or_default("LOG_LEVEL", "info"),
            log_dir: env_or_default("LOG_DIR", "log_files"),
            log_rotation: env_or_default("LOG_ROTATION", "daily"),
            info_file_name: env_or_default("LOG_INFO_FILE", "info.log"),
            error_file_name: env_or_default("LOG_ERROR_FILE", "error.log"),
            enable_console_logging: env_is_true("ENABLE_CONSOLE_LOGGING", true),
            json_console: env_is_true("LOG_JSON", false),
        }
    }
}

// 解析时间轮转策略
fn parse_rotation(s: &str) -> Rotation {
    match s.to_lowercase().as_str() {
        "minutely" | "minute" | "min" => Rotation::MINUTELY,
        "hourly" | "hour" | "hr" => Rotation::HOURLY,
        "daily" | "day" => Rotation::DAILY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

// 设置日志
pub async fn setup_logging() -> anyhow::Result<()> {
    let config = LogConfig::from_env();

    // 本地环境：仅控制台输出
    if config.app_env.eq_ignore_ascii_case("local") {
        let console = (!config.json_console).then(|| {
            fmt::layer()
                .with_ansi(true)
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_writer(std::io::stdout)
                .with_filter(EnvFilter::new(&config.log_level))
        });
        let json = config.json_console.then(|| {
            fmt::layer()
                .json()
                .with_writer(std::io::stdout)
                .with_filter(EnvFilter::new(&config.log_level))
        });
        tracing::subscriber::set_global_default(Registry::default().with(console).with(json))?;

        info!("Log configuration setup successfully!");
        info!(
            "Environment: {}, Log Level: {}, File Logging: {}, Console Logging: {}",
            config.app_env, config.log_level, false, true
        );
        return Ok(());
    }

    // 非本地环境：文件输出（可选控制台）
    std::fs::create_dir_all(&config.log_dir).map_err(|e| {
        anyhow::anyhow!("Failed to create log directory '{}': {}", config.log_dir, e)
    })?;

    let info_file = RollingFileAppender::new(
        parse_rotation(&config.log_rotation),
        &config.log_dir,
        &config.info_file_name,
    );
    let error_file = RollingFileAppender::new(
        parse_rotation(&config.log_rotation),
        &config.log_dir,
        &config.error_file_name,
    );

    let (info_non_blocking, info_guard) = tracing_appender::non_blocking(info_file);
    let (error_non_blocking, error_guard) = tracing_appender::non_blocking(error_file);

    // 保存guard到全局，防止被丢弃
    INFO_GUARD
        .set(info_guard)
        .map_err(|_| anyhow::anyhow!("Failed to set INFO_GUARD"))?;
    ERROR_GUARD
        .set(error_guard)
        .map_err(|_| anyhow::anyhow!("Failed to set ERROR_GUARD"))?;

    let info_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_writer(info_non_blocking)
        .with_filter(EnvFilter::new(&config.log_level));
    let error_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_writer(error_non_blocking)
        .with_filter(EnvFilter::new("error"));
    let console_layer = (config.enable_console_logging && !config.json_console).then(|| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_level(true)
            .with_writer(std::io::stdout)
            .with_filter(EnvFilter::new(&config.log_level))
    });
    let json_layer = (config.enable_console_logging && config.json_console).then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .with_filter(EnvFilter::new(&config.log_level))
    });

    let subscriber = Registry::default()
        .with(info_layer)
        .with(error_layer)
        .with(console_layer)
        .with(json_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Log configuration setup successfully!");
    info!(
        "Environment: {}, Log Level: {}, File Logging: {}, Console Logging: {}",
        config.app_env, config.log_level, true, config.enable_console_logging
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rotation() {
        assert_eq!(parse_rotation("HOURLY"), Rotation::HOURLY);
        assert_eq!(parse_rotation("min"), Rotation::MINUTELY);
        assert_eq!(parse_rotation("whatever"), Rotation::DAILY);
    }
}

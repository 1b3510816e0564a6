use proxy_core::ProxyError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How the agent writes its logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default directive (`info`, `debug`, ... or a full `EnvFilter` string)
    pub level: String,
    pub json_format: bool,
    pub include_thread_names: bool,
    /// File and line of each event
    pub include_file_info: bool,
    /// ANSI colors on the text layer
    pub enable_colors: bool,
    /// Extra daily-rolling file sink
    pub log_file: Option<String>,
    /// Per-target overrides, e.g. `proxy_core::engine = "trace"`
    pub module_levels: std::collections::HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = std::collections::HashMap::new();
        module_levels.insert("tokio".to_string(), "warn".to_string());
        module_levels.insert("axum".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            json_format: false,
            include_thread_names: true,
            include_file_info: false,
            enable_colors: true,
            log_file: None,
            module_levels,
        }
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ProxyError> {
    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| ProxyError::configuration(format!("Invalid log level: {}", e)))?;

    for (module, level) in &config.module_levels {
        let directive = format!("{}={}", module, level);
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| ProxyError::configuration(format!("Invalid log directive: {}", e)))?,
        );
    }
    Ok(filter)
}

/// Initialize logging based on the provided configuration.
///
/// The returned guard flushes the log file when dropped; keep it alive for
/// the life of the process.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ProxyError> {
    let filter = build_filter(config)?;

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(create_file_appender(path)?);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(config.include_thread_names)
            .with_file(config.include_file_info)
            .with_line_number(config.include_file_info)
    });
    let text_layer = (!config.json_format).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_names(config.include_thread_names)
            .with_file(config.include_file_info)
            .with_line_number(config.include_file_info)
            .with_ansi(config.enable_colors)
    });

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init();

    if result.is_ok() {
        tracing::info!("Logging initialized at {}", config.level);
    } else {
        tracing::debug!("Global subscriber already set, keeping it");
    }

    Ok(guard)
}

/// Daily-rolling file appender for `log_file`
fn create_file_appender(
    log_file: &str,
) -> Result<tracing_appender::rolling::RollingFileAppender, ProxyError> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let log_path = Path::new(log_file);
    let directory = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let filename = log_path
        .file_name()
        .ok_or_else(|| ProxyError::configuration("Invalid log file name"))?
        .to_string_lossy();

    std::fs::create_dir_all(directory).map_err(|e| {
        ProxyError::configuration(format!("Failed to create log directory: {}", e))
    })?;

    Ok(RollingFileAppender::new(
        Rotation::DAILY,
        directory,
        filename.as_ref(),
    ))
}

/// Log level utilities
pub mod levels {
    /// Check if a log level string is valid
    pub fn is_valid_level(level: &str) -> bool {
        matches!(
            level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_module_levels() {
        let mut config = LoggingConfig::default();
        config.level = "debug".to_string();
        config
            .module_levels
            .insert("proxy_core::engine".to_string(), "trace".to_string());
        assert!(build_filter(&config).is_ok());
    }

    #[test]
    fn test_filter_rejects_bad_directive() {
        let mut config = LoggingConfig::default();
        config
            .module_levels
            .insert("proxy_core".to_string(), "not-a-level".to_string());
        assert!(build_filter(&config).is_err());
    }

    #[test]
    fn test_level_names() {
        assert!(levels::is_valid_level("INFO"));
        assert!(levels::is_valid_level("trace"));
        assert!(!levels::is_valid_level("verbose"));
    }

    #[test]
    fn test_file_appender_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("agent.log");
        create_file_appender(path.to_str().unwrap()).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }
}

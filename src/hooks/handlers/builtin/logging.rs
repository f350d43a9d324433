//! Logging hook handler

use crate::hooks::context::HookContext;
use crate::hooks::errors::HookError;
use crate::hooks::handler::HookHandler;
use crate::hooks::result::HookResult;
use serde_json::Value;
use std::str::FromStr;
use tracing::{debug, error, info, trace, warn, Level};

/// Output style of [`LoggingHandler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(HookError::invalid_config(format!("unknown log format '{}'", other))),
        }
    }
}

/// Built-in handler that logs every dispatch it sees
pub struct LoggingHandler {
    name: String,
    level: Level,
    format: LogFormat,
}

impl LoggingHandler {
    pub fn new(name: impl Into<String>, level: Level) -> Self {
        Self {
            name: name.into(),
            level,
            format: LogFormat::Compact,
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Parse a level name such as `warn` or `debug`
    pub fn parse_level(level: &str) -> Result<Level, HookError> {
        match level.to_lowercase().as_str() {
            "error" => Ok(Level::ERROR),
            "warn" | "warning" => Ok(Level::WARN),
            "info" => Ok(Level::INFO),
            "debug" => Ok(Level::DEBUG),
            "trace" => Ok(Level::TRACE),
            other => Err(HookError::invalid_config(format!("unknown log level '{}'", other))),
        }
    }

    fn format_message(&self, context: &HookContext) -> String {
        let data = Value::Object(context.merged_data());
        match self.format {
            LogFormat::Json => serde_json::json!({
                "hook_type": context.hook_type().as_str(),
                "handler": self.name,
                "plugin_id": context.plugin_id(),
                "data": data,
                "metadata": context.metadata(),
            })
            .to_string(),
            LogFormat::Pretty => format!(
                "Hook: {} | Handler: {} | Data: {}",
                context.hook_type(),
                self.name,
                serde_json::to_string_pretty(&data).unwrap_or_default()
            ),
            LogFormat::Compact => format!("[{}] {}: {}", context.hook_type(), self.name, data),
        }
    }
}

impl HookHandler for LoggingHandler {
    fn call(&self, context: &mut HookContext) -> Result<Option<HookResult>, HookError> {
        let message = self.format_message(context);
        match self.level {
            Level::ERROR => error!("{}", message),
            Level::WARN => warn!("{}", message),
            Level::INFO => info!("{}", message),
            Level::DEBUG => debug!("{}", message),
            Level::TRACE => trace!("{}", message),
        }
        Ok(None)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::types::HookType;
    use serde_json::json;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_logs_dispatch() {
        let handler = LoggingHandler::new("audit-log", Level::INFO);
        let mut context = HookContext::builder(HookType::OnDriftDetected)
            .with_data("column", json!("price"))
            .build();

        assert!(handler.call(&mut context).unwrap().is_none());
        assert!(logs_contain("[on_drift_detected] audit-log"));
        assert!(logs_contain("price"));
    }

    #[traced_test]
    #[test]
    fn test_json_format() {
        let handler = LoggingHandler::new("audit-log", Level::WARN).with_format(LogFormat::Json);
        let mut context = HookContext::builder(HookType::OnError).with_plugin_id("p1").build();
        handler.call(&mut context).unwrap();
        assert!(logs_contain(r#""hook_type":"on_error""#));
    }

    #[test]
    fn test_parse_level_and_format() {
        assert_eq!(LoggingHandler::parse_level("Warning").unwrap(), Level::WARN);
        assert!(LoggingHandler::parse_level("loud").is_err());
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}

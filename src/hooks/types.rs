//! Core types for the hooks system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Extension points raised by the host pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    // Validation
    BeforeValidation,
    AfterValidation,
    OnIssueFound,

    // Profiling and reporting
    BeforeProfile,
    AfterProfile,
    OnReportGenerate,

    OnError,

    // Plugin lifecycle
    OnPluginLoad,
    OnPluginUnload,
    OnPluginEnable,
    OnPluginDisable,

    // Data sources
    OnSourceConnect,
    OnSourceDisconnect,
    OnSchemaChange,
    OnDriftDetected,
}

impl HookType {
    /// Every hook type, in declaration order
    pub const ALL: [HookType; 15] = [
        Self::BeforeValidation,
        Self::AfterValidation,
        Self::OnIssueFound,
        Self::BeforeProfile,
        Self::AfterProfile,
        Self::OnReportGenerate,
        Self::OnError,
        Self::OnPluginLoad,
        Self::OnPluginUnload,
        Self::OnPluginEnable,
        Self::OnPluginDisable,
        Self::OnSourceConnect,
        Self::OnSourceDisconnect,
        Self::OnSchemaChange,
        Self::OnDriftDetected,
    ];

    /// Snake-case name, as used in manifests and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeValidation => "before_validation",
            Self::AfterValidation => "after_validation",
            Self::OnIssueFound => "on_issue_found",
            Self::BeforeProfile => "before_profile",
            Self::AfterProfile => "after_profile",
            Self::OnReportGenerate => "on_report_generate",
            Self::OnError => "on_error",
            Self::OnPluginLoad => "on_plugin_load",
            Self::OnPluginUnload => "on_plugin_unload",
            Self::OnPluginEnable => "on_plugin_enable",
            Self::OnPluginDisable => "on_plugin_disable",
            Self::OnSourceConnect => "on_source_connect",
            Self::OnSourceDisconnect => "on_source_disconnect",
            Self::OnSchemaChange => "on_schema_change",
            Self::OnDriftDetected => "on_drift_detected",
        }
    }

    /// Human-readable description of the extension point
    pub fn description(&self) -> &'static str {
        match self {
            Self::BeforeValidation => "Before a validation run starts",
            Self::AfterValidation => "After a validation run finished",
            Self::OnIssueFound => "A validation issue was found",
            Self::BeforeProfile => "Before a data profile is computed",
            Self::AfterProfile => "After a data profile was computed",
            Self::OnReportGenerate => "A report is being generated",
            Self::OnError => "The pipeline hit an error",
            Self::OnPluginLoad => "A plugin was loaded",
            Self::OnPluginUnload => "A plugin is being unloaded",
            Self::OnPluginEnable => "A plugin was enabled",
            Self::OnPluginDisable => "A plugin was disabled",
            Self::OnSourceConnect => "A data source connected",
            Self::OnSourceDisconnect => "A data source disconnected",
            Self::OnSchemaChange => "A source schema changed",
            Self::OnDriftDetected => "Data drift was detected",
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown hook type '{}'", s))
    }
}

/// Common priority values; lower runs earlier
pub struct HookPriority;

impl HookPriority {
    pub const HIGHEST: i32 = 0;
    pub const HIGH: i32 = 50;
    pub const NORMAL: i32 = 100;
    pub const LOW: i32 = 500;
    pub const LOWEST: i32 = 1000;
}

/// Per-registration execution statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub last_execution: Option<DateTime<Utc>>,
}

impl HookStats {
    pub fn record_success(&mut self, duration: Duration) {
        self.successful_executions += 1;
        self.record(duration);
    }

    pub fn record_failure(&mut self, duration: Duration) {
        self.failed_executions += 1;
        self.record(duration);
    }

    fn record(&mut self, duration: Duration) {
        self.total_executions += 1;
        self.last_execution = Some(Utc::now());

        let previous = self.average_duration.unwrap_or_default().as_nanos() * (self.total_executions - 1) as u128;
        let average = (previous + duration.as_nanos()) / self.total_executions as u128;
        self.average_duration = Some(Duration::from_nanos(average as u64));

        if self.max_duration.map_or(true, |max| duration > max) {
            self.max_duration = Some(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_type_names() {
        assert_eq!(HookType::OnIssueFound.to_string(), "on_issue_found");
        assert_eq!("on_drift_detected".parse::<HookType>().unwrap(), HookType::OnDriftDetected);
        assert!("server_startup".parse::<HookType>().is_err());

        for hook_type in HookType::ALL {
            let json = serde_json::to_value(hook_type).unwrap();
            assert_eq!(json, serde_json::json!(hook_type.as_str()));
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(HookPriority::HIGHEST < HookPriority::HIGH);
        assert!(HookPriority::NORMAL < HookPriority::LOW);
    }

    #[test]
    fn test_hook_stats() {
        let mut stats = HookStats::default();

        stats.record_success(Duration::from_millis(100));
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.average_duration, Some(Duration::from_millis(100)));

        stats.record_failure(Duration::from_millis(200));
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.average_duration, Some(Duration::from_millis(150)));
        assert_eq!(stats.max_duration, Some(Duration::from_millis(200)));
    }
}

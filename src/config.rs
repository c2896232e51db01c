use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::workflow::types::Stage;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub collaborators: CollaboratorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Timeouts, retry policy, and escalation threshold for the pipeline.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    #[serde(default = "default_analysis_timeout_ms")]
    pub analysis_timeout_ms: u64,
    #[serde(default = "default_resolution_timeout_ms")]
    pub resolution_timeout_ms: u64,
    #[serde(default = "default_review_timeout_ms")]
    pub review_timeout_ms: u64,
    #[serde(default = "default_pr_generation_timeout_ms")]
    pub pr_generation_timeout_ms: u64,
    /// Upper bound on a whole workflow, checked between stages and
    /// enforced on the stage in flight.
    #[serde(default = "default_max_workflow_time_ms")]
    pub max_workflow_time_ms: u64,
    /// Retries after the first attempt, so each stage gets `retry_attempts + 1` tries.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_human_intervention_threshold")]
    pub human_intervention_threshold: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// How long an issue's failure streak is remembered after its last run.
    #[serde(default = "default_failure_streak_window_secs")]
    pub failure_streak_window_secs: u64,
    /// Most issues whose failure streak is remembered at once.
    #[serde(default = "default_max_tracked_streaks")]
    pub max_tracked_streaks: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            analysis_timeout_ms: default_analysis_timeout_ms(),
            resolution_timeout_ms: default_resolution_timeout_ms(),
            review_timeout_ms: default_review_timeout_ms(),
            pr_generation_timeout_ms: default_pr_generation_timeout_ms(),
            max_workflow_time_ms: default_max_workflow_time_ms(),
            retry_attempts: default_retry_attempts(),
            human_intervention_threshold: default_human_intervention_threshold(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            monitor_interval_secs: default_monitor_interval_secs(),
            failure_streak_window_secs: default_failure_streak_window_secs(),
            max_tracked_streaks: default_max_tracked_streaks(),
        }
    }
}

impl OrchestratorConfig {
    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        let ms = match stage {
            Stage::Analysis => self.analysis_timeout_ms,
            Stage::Resolution => self.resolution_timeout_ms,
            Stage::Review => self.review_timeout_ms,
            Stage::PrGeneration => self.pr_generation_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn max_workflow_time(&self) -> Duration {
        Duration::from_millis(self.max_workflow_time_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn failure_streak_window(&self) -> Duration {
        Duration::from_secs(self.failure_streak_window_secs)
    }

    pub fn validate(&self) -> Result<()> {
        for stage in Stage::ALL {
            if self.stage_timeout(stage).is_zero() {
                return Err(AppError::Config(format!(
                    "{} timeout must be greater than zero",
                    stage.as_str()
                )));
            }
        }
        if self.max_workflow_time_ms == 0 {
            return Err(AppError::Config(
                "max_workflow_time_ms must be greater than zero".to_string(),
            ));
        }
        if self.human_intervention_threshold == 0 {
            return Err(AppError::Config(
                "human_intervention_threshold must be at least 1".to_string(),
            ));
        }
        if self.retry_backoff_max_ms < self.retry_backoff_ms {
            return Err(AppError::Config(
                "retry_backoff_max_ms must not be smaller than retry_backoff_ms".to_string(),
            ));
        }
        if self.monitor_interval_secs == 0 {
            return Err(AppError::Config(
                "monitor_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.failure_streak_window_secs == 0 || self.max_tracked_streaks == 0 {
            return Err(AppError::Config(
                "failure streak window and capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Deserialize, Clone)]
pub struct CollaboratorConfig {
    #[serde(default = "default_analyzer_url")]
    pub analyzer_url: String,
    #[serde(default = "default_resolver_url")]
    pub resolver_url: String,
    #[serde(default = "default_reviewer_url")]
    pub reviewer_url: String,
    #[serde(default = "default_pr_generator_url")]
    pub pr_generator_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            analyzer_url: default_analyzer_url(),
            resolver_url: default_resolver_url(),
            reviewer_url: default_reviewer_url(),
            pr_generator_url: default_pr_generator_url(),
            api_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// Manual Debug impl to avoid leaking the API token
impl std::fmt::Debug for CollaboratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaboratorConfig")
            .field("analyzer_url", &self.analyzer_url)
            .field("resolver_url", &self.resolver_url)
            .field("reviewer_url", &self.reviewer_url)
            .field("pr_generator_url", &self.pr_generator_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_analysis_timeout_ms() -> u64 {
    30_000
}

fn default_resolution_timeout_ms() -> u64 {
    300_000
}

fn default_review_timeout_ms() -> u64 {
    60_000
}

fn default_pr_generation_timeout_ms() -> u64 {
    30_000
}

fn default_max_workflow_time_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_human_intervention_threshold() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_retry_backoff_max_ms() -> u64 {
    30_000
}

fn default_monitor_interval_secs() -> u64 {
    60
}

fn default_failure_streak_window_secs() -> u64 {
    86_400
}

fn default_max_tracked_streaks() -> usize {
    10_000
}

fn default_analyzer_url() -> String {
    "http://127.0.0.1:8081/analyze".to_string()
}

fn default_resolver_url() -> String {
    "http://127.0.0.1:8082/resolve".to_string()
}

fn default_reviewer_url() -> String {
    "http://127.0.0.1:8083/review".to_string()
}

fn default_pr_generator_url() -> String {
    "http://127.0.0.1:8084/pull-request".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(config::File::with_name("hypha").required(false));
        }

        // Environment variable overrides with HYPHA_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("HYPHA")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config.orchestrator.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.stage_timeout(Stage::Resolution), Duration::from_secs(300));
    }

    #[test]
    fn test_load_from_file_with_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[server]\nport = 8080\n\n[orchestrator]\nretry_attempts = 5\nreview_timeout_ms = 1500\n\n[collaborators]\napi_token = \"secret-token\""
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.orchestrator.retry_attempts, 5);
        assert_eq!(config.orchestrator.stage_timeout(Stage::Review), Duration::from_millis(1500));
        assert_eq!(config.orchestrator.human_intervention_threshold, 3);
        assert_eq!(config.collaborators.api_token.as_deref(), Some("secret-token"));
    }

    #[test]
    fn test_load_rejects_invalid_orchestrator_settings() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[orchestrator]\nanalysis_timeout_ms = 0").unwrap();

        let err = AppConfig::load(file.path().to_str()).unwrap_err();
        assert!(err.to_string().contains("analysis timeout"));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let config = OrchestratorConfig {
            human_intervention_threshold: 0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_streak_capacity() {
        let config = OrchestratorConfig {
            max_tracked_streaks: 0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = CollaboratorConfig {
            api_token: Some("super-secret".to_string()),
            ..CollaboratorConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}

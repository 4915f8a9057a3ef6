//! Operator Configuration
//!
//! Operator-wide settings loaded from a mounted YAML file. Everything that
//! varies per cluster lives on the `HonseFarmCluster` resource instead.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Main operator configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OperatorConfig {
    /// Build job configuration
    #[serde(default)]
    pub build: BuildJobConfig,

    /// Re-check intervals
    #[serde(default)]
    pub requeue: RequeueConfig,

    /// Tunnel defaults
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Health server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Build job configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildJobConfig {
    /// Image used for the `buildah` strategy
    #[serde(rename = "builderImage", default = "default_builder_image")]
    pub builder_image: String,

    /// Image used for the `kaniko` strategy
    #[serde(rename = "kanikoImage", default = "default_kaniko_image")]
    pub kaniko_image: String,

    /// Optional ServiceAccount for build pods
    #[serde(default, rename = "serviceAccountName")]
    pub service_account_name: Option<String>,

    /// Pod retries before the job is marked failed
    #[serde(rename = "backoffLimit", default)]
    pub backoff_limit: i32,

    /// Job timeout in seconds
    #[serde(
        rename = "activeDeadlineSeconds",
        default = "default_active_deadline_seconds"
    )]
    pub active_deadline_seconds: i64,

    /// Delete a finished build job whose build identifier is no longer the desired one
    #[serde(rename = "recreateOnVersionChange", default)]
    pub recreate_on_version_change: bool,
}

/// Re-check intervals in seconds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequeueConfig {
    #[serde(rename = "buildingSeconds", default = "default_building_seconds")]
    pub building_seconds: u64,

    #[serde(rename = "buildFailedSeconds", default = "default_build_failed_seconds")]
    pub build_failed_seconds: u64,

    #[serde(rename = "readySeconds", default = "default_ready_seconds")]
    pub ready_seconds: u64,

    #[serde(rename = "errorSeconds", default = "default_error_seconds")]
    pub error_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    #[serde(rename = "defaultImage", default = "default_tunnel_image")]
    pub default_image: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(rename = "bindAddress", default = "default_bind_address")]
    pub bind_address: String,
}

fn default_builder_image() -> String {
    std::env::var("BUILDER_IMAGE").unwrap_or_else(|_| "quay.io/buildah/stable:latest".to_string())
}

fn default_kaniko_image() -> String {
    "gcr.io/kaniko-project/executor:debug".to_string()
}

fn default_active_deadline_seconds() -> i64 {
    3600 // 1 hour
}

fn default_building_seconds() -> u64 {
    30
}

fn default_build_failed_seconds() -> u64 {
    60
}

fn default_ready_seconds() -> u64 {
    300
}

fn default_error_seconds() -> u64 {
    15
}

fn default_tunnel_image() -> String {
    "ghcr.io/cloudflare/cloudflared:latest".to_string()
}

fn default_bind_address() -> String {
    std::env::var("HEALTH_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
}

impl Default for BuildJobConfig {
    fn default() -> Self {
        Self {
            builder_image: default_builder_image(),
            kaniko_image: default_kaniko_image(),
            service_account_name: None,
            backoff_limit: 0,
            active_deadline_seconds: default_active_deadline_seconds(),
            recreate_on_version_change: false,
        }
    }
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            building_seconds: default_building_seconds(),
            build_failed_seconds: default_build_failed_seconds(),
            ready_seconds: default_ready_seconds(),
            error_seconds: default_error_seconds(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            default_image: default_tunnel_image(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl RequeueConfig {
    pub fn building(&self) -> Duration {
        Duration::from_secs(self.building_seconds)
    }

    pub fn build_failed(&self) -> Duration {
        Duration::from_secs(self.build_failed_seconds)
    }

    pub fn ready(&self) -> Duration {
        Duration::from_secs(self.ready_seconds)
    }

    pub fn error(&self) -> Duration {
        Duration::from_secs(self.error_seconds)
    }
}

impl OperatorConfig {
    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.build.builder_image.trim().is_empty() {
            return Err(anyhow::anyhow!("build.builderImage must not be empty"));
        }
        if self.build.kaniko_image.trim().is_empty() {
            return Err(anyhow::anyhow!("build.kanikoImage must not be empty"));
        }
        if self.build.backoff_limit < 0 {
            return Err(anyhow::anyhow!(
                "build.backoffLimit must not be negative (got {})",
                self.build.backoff_limit
            ));
        }
        if self.build.active_deadline_seconds <= 0 {
            return Err(anyhow::anyhow!(
                "build.activeDeadlineSeconds must be positive"
            ));
        }

        let requeue = &self.requeue;
        if requeue.building_seconds == 0
            || requeue.build_failed_seconds == 0
            || requeue.ready_seconds == 0
            || requeue.error_seconds == 0
        {
            return Err(anyhow::anyhow!("requeue intervals must be non-zero"));
        }
        // A hard failure must back off further than an in-progress build
        if requeue.build_failed_seconds <= requeue.building_seconds {
            return Err(anyhow::anyhow!(
                "requeue.buildFailedSeconds ({}) must be greater than requeue.buildingSeconds ({})",
                requeue.build_failed_seconds,
                requeue.building_seconds
            ));
        }

        if self.tunnel.default_image.trim().is_empty() {
            return Err(anyhow::anyhow!("tunnel.defaultImage must not be empty"));
        }

        self.server
            .bind_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                anyhow::anyhow!(
                    "server.bindAddress '{}' is not a socket address: {e}",
                    self.server.bind_address
                )
            })?;

        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: OperatorConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
build:
  builderImage: "registry.local/buildah:1.37"
  serviceAccountName: "builder"
  backoffLimit: 2
  recreateOnVersionChange: true

requeue:
  buildingSeconds: 10
  buildFailedSeconds: 45

server:
  bindAddress: "127.0.0.1:9090"
"#;

        let config: OperatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.build.builder_image, "registry.local/buildah:1.37");
        assert_eq!(
            config.build.service_account_name.as_deref(),
            Some("builder")
        );
        assert_eq!(config.build.backoff_limit, 2);
        assert!(config.build.recreate_on_version_change);
        assert_eq!(config.build.active_deadline_seconds, 3600);
        assert_eq!(config.requeue.building(), Duration::from_secs(10));
        assert_eq!(config.requeue.build_failed(), Duration::from_secs(45));
        assert_eq!(config.requeue.ready_seconds, 300);
        assert_eq!(
            config.tunnel.default_image,
            "ghcr.io/cloudflare/cloudflared:latest"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_default_config() {
        std::env::remove_var("BUILDER_IMAGE");
        std::env::remove_var("HEALTH_BIND_ADDRESS");

        let config = OperatorConfig::default();
        assert_eq!(config.build.builder_image, "quay.io/buildah/stable:latest");
        assert_eq!(config.build.backoff_limit, 0);
        assert!(!config.build.recreate_on_version_change);
        assert_eq!(config.requeue.building_seconds, 30);
        assert_eq!(config.requeue.build_failed_seconds, 60);
        assert_eq!(config.requeue.error_seconds, 15);
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn env_overrides_apply_to_defaults() {
        std::env::set_var("BUILDER_IMAGE", "registry.local/buildah:pinned");
        let config = OperatorConfig::default();
        std::env::remove_var("BUILDER_IMAGE");

        assert_eq!(config.build.builder_image, "registry.local/buildah:pinned");
    }

    #[test]
    fn validate_rejects_failed_interval_not_longer_than_building() {
        let mut config = OperatorConfig::default();
        config.requeue.building_seconds = 60;
        config.requeue.build_failed_seconds = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_bind_address() {
        let mut config = OperatorConfig::default();
        config.server.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_mounted_file_reads_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "requeue:\n  readySeconds: 120").unwrap();

        let config = OperatorConfig::from_mounted_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.requeue.ready(), Duration::from_secs(120));
    }

    #[test]
    fn from_mounted_file_reports_missing_file() {
        let err = OperatorConfig::from_mounted_file("/nonexistent/config.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}

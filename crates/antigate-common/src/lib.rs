//! Shared config types and error glossary for the Antigravity gateway engine.
//!
//! Kept dependency-light on purpose: this crate must not pull in `tokio` or
//! `sea-orm` so that it can sit underneath every other crate in the
//! workspace.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

/// Retention window (in days) for one cleanup-eligible table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionDays {
    pub error_log: u32,
    pub retry_attempt: u32,
    pub alert_event: u32,
    pub minute_metric: u32,
    pub hourly_preagg: u32,
    pub daily_preagg: u32,
}

impl Default for RetentionDays {
    fn default() -> Self {
        Self {
            error_log: 14,
            retry_attempt: 7,
            alert_event: 30,
            minute_metric: 3,
            hourly_preagg: 30,
            daily_preagg: 180,
        }
    }
}

/// Gateway knobs: one struct of enumerated fields, merged CLI > ENV > stored
/// default (see `GatewayConfigPatch::overlay`). Mirrors the `GlobalConfig`
/// merge order used by gproxy's bootstrap layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub log_upstream_error_body: bool,
    pub log_upstream_error_body_max_bytes: usize,
    pub max_line_size: usize,
    pub stream_data_interval_timeout_s: u64,
    pub antigravity_fallback_cooldown_minutes: u64,
    pub identity_patch_enabled: bool,
    pub model_fallback_enabled: bool,
    pub smart_retry_threshold_secs: u64,
    pub smart_retry_min_wait_secs: u64,
    pub default_rate_limit_window_secs: u64,
    pub retention_days: RetentionDays,
    pub cleanup_cron: String,
    pub cleanup_timezone: String,
    pub cleanup_dry_run: bool,
    pub leader_lock_ttl_secs: u64,
    pub cleanup_batch_size: u64,
    pub max_retries_per_url: u32,
    pub sticky_session_ttl_secs: u64,
    pub upstream_error_journal_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_upstream_error_body: true,
            log_upstream_error_body_max_bytes: 8 * 1024,
            max_line_size: 64 * 1024,
            stream_data_interval_timeout_s: 30,
            antigravity_fallback_cooldown_minutes: 15,
            identity_patch_enabled: true,
            model_fallback_enabled: true,
            smart_retry_threshold_secs: 7,
            smart_retry_min_wait_secs: 1,
            default_rate_limit_window_secs: 30,
            retention_days: RetentionDays::default(),
            cleanup_cron: "0 0 2 * * *".to_string(),
            cleanup_timezone: "UTC".to_string(),
            cleanup_dry_run: false,
            leader_lock_ttl_secs: 30 * 60,
            cleanup_batch_size: 5_000,
            max_retries_per_url: 3,
            sticky_session_ttl_secs: 60 * 60,
            upstream_error_journal_capacity: 32,
        }
    }
}

impl GatewayConfig {
    pub fn smart_retry_threshold(&self) -> Duration {
        Duration::from_secs(self.smart_retry_threshold_secs)
    }

    pub fn smart_retry_min_wait(&self) -> Duration {
        Duration::from_secs(self.smart_retry_min_wait_secs)
    }

    pub fn default_rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.default_rate_limit_window_secs)
    }

    pub fn sticky_session_ttl(&self) -> Duration {
        Duration::from_secs(self.sticky_session_ttl_secs)
    }

    pub fn leader_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_lock_ttl_secs)
    }
}

/// Optional overlay used when merging CLI args / env vars over a stored
/// default, same shape as gproxy's `GlobalConfigPatch`.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfigPatch {
    pub log_upstream_error_body: Option<bool>,
    pub max_line_size: Option<usize>,
    pub stream_data_interval_timeout_s: Option<u64>,
    pub cleanup_cron: Option<String>,
    pub cleanup_timezone: Option<String>,
    pub cleanup_dry_run: Option<bool>,
}

impl GatewayConfigPatch {
    pub fn apply_over(self, mut base: GatewayConfig) -> GatewayConfig {
        if let Some(value) = self.log_upstream_error_body {
            base.log_upstream_error_body = value;
        }
        if let Some(value) = self.max_line_size {
            base.max_line_size = value;
        }
        if let Some(value) = self.stream_data_interval_timeout_s {
            base.stream_data_interval_timeout_s = value;
        }
        if let Some(value) = self.cleanup_cron {
            base.cleanup_cron = value;
        }
        if let Some(value) = self.cleanup_timezone {
            base.cleanup_timezone = value;
        }
        if let Some(value) = self.cleanup_dry_run {
            base.cleanup_dry_run = value;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overlays_only_set_fields() {
        let base = GatewayConfig::default();
        let patch = GatewayConfigPatch {
            max_line_size: Some(128 * 1024),
            ..Default::default()
        };
        let merged = patch.apply_over(base.clone());
        assert_eq!(merged.max_line_size, 128 * 1024);
        assert_eq!(merged.cleanup_cron, base.cleanup_cron);
    }
}

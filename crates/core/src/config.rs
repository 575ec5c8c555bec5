use std::env;

use serde::{Deserialize, Serialize};

/// Load `.env` (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub ml_service_url: String,
    pub upload_dir: String,
    pub frontend_url: String,
    pub smtp: SmtpConfig,
    pub db_pool_size: u32,
    pub db_max_pool_size: u32,
    pub database_connection_limit: u32,
    pub uploads: UploadLimits,
    pub queue: QueueConfig,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadLimits {
    pub max_total_files: u32,
    pub max_files_per_chunk: u32,
    pub chunk_concurrency: u32,
}

/// Knobs for §5 "Concurrency & Resource Model".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Global inference concurrency budget (`C`).
    pub global_concurrency: u32,
    /// Per-user fairness cap (`U`).
    pub per_user_cap: u32,
    /// Terminal-failure retry budget (`R`).
    pub retry_budget: u32,
    pub inference_timeout_secs: u64,
    pub retention_days: u32,
}

/// Knobs for the ExportEngine worker pool and per-job fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Export worker pool size (`E`).
    pub worker_pool_size: u32,
    /// Bounded per-job fan-out for visualization/metrics phases.
    pub fan_out: u32,
    pub job_wall_clock_secs: u64,
    pub render_timeout_secs: u64,
    pub download_read_timeout_secs: u64,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("DATABASE_URL", "postgres://localhost/segmentation"),
            redis_url: env_opt("REDIS_URL"),
            ml_service_url: env_or("ML_SERVICE_URL", "http://localhost:8000"),
            upload_dir: env_or("UPLOAD_DIR", "uploads"),
            frontend_url: env_or("FRONTEND_URL", "http://localhost:3000"),
            smtp: SmtpConfig {
                host: env_opt("SMTP_HOST"),
                port: env_u32("SMTP_PORT", 587),
                username: env_opt("SMTP_USERNAME"),
                password: env_opt("SMTP_PASSWORD"),
                from_address: env_opt("SMTP_FROM"),
            },
            db_pool_size: env_u32("DB_POOL_SIZE", 10),
            db_max_pool_size: env_u32("DB_MAX_POOL_SIZE", 20),
            database_connection_limit: env_u32("DATABASE_CONNECTION_LIMIT", 20),
            uploads: UploadLimits {
                max_total_files: env_u32("MAX_TOTAL_FILES", 10_000).min(10_000),
                max_files_per_chunk: env_u32("MAX_FILES_PER_CHUNK", 50),
                chunk_concurrency: env_u32("CHUNK_CONCURRENCY", 4),
            },
            queue: QueueConfig {
                global_concurrency: env_u32("QUEUE_GLOBAL_CONCURRENCY", 5),
                per_user_cap: env_u32("QUEUE_PER_USER_CAP", 2),
                retry_budget: env_u32("QUEUE_RETRY_BUDGET", 2),
                inference_timeout_secs: env_u64("INFERENCE_TIMEOUT_SECS", 600),
                retention_days: env_u32("QUEUE_RETENTION_DAYS", 30),
            },
            export: ExportConfig {
                worker_pool_size: env_u32("EXPORT_WORKER_POOL_SIZE", 2),
                fan_out: env_u32("EXPORT_FAN_OUT", 4),
                job_wall_clock_secs: env_u64("EXPORT_JOB_WALL_CLOCK_SECS", 7200),
                render_timeout_secs: env_u64("EXPORT_RENDER_TIMEOUT_SECS", 120),
                download_read_timeout_secs: env_u64("EXPORT_DOWNLOAD_TIMEOUT_SECS", 300),
            },
        }
    }

    pub fn log_summary(&self) {
        tracing::info!(
            ml_service_url = %self.ml_service_url,
            global_concurrency = self.queue.global_concurrency,
            per_user_cap = self.queue.per_user_cap,
            export_worker_pool_size = self.export.worker_pool_size,
            "config loaded",
        );
    }

    /// Redacted view safe to log or hand to an API response (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "ml_service_url": self.ml_service_url,
            "upload_dir": self.upload_dir,
            "frontend_url": self.frontend_url,
            "redis_configured": self.redis_url.is_some(),
            "smtp_configured": self.smtp.host.is_some(),
            "db_pool_size": self.db_pool_size,
            "db_max_pool_size": self.db_max_pool_size,
            "queue": {
                "global_concurrency": self.queue.global_concurrency,
                "per_user_cap": self.queue.per_user_cap,
                "retry_budget": self.queue.retry_budget,
            },
            "export": {
                "worker_pool_size": self.export.worker_pool_size,
                "fan_out": self.export.fan_out,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_defaults_match_documented_values() {
        // SAFETY: tests run single-threaded within this crate's test binary.
        for k in [
            "QUEUE_GLOBAL_CONCURRENCY",
            "QUEUE_PER_USER_CAP",
            "QUEUE_RETRY_BUDGET",
            "EXPORT_WORKER_POOL_SIZE",
            "EXPORT_FAN_OUT",
        ] {
            env::remove_var(k);
        }
        let cfg = Config::from_env();
        assert_eq!(cfg.queue.global_concurrency, 5);
        assert_eq!(cfg.queue.per_user_cap, 2);
        assert_eq!(cfg.queue.retry_budget, 2);
        assert_eq!(cfg.export.worker_pool_size, 2);
        assert_eq!(cfg.export.fan_out, 4);
    }

    #[test]
    fn max_total_files_is_capped_at_ten_thousand() {
        env::set_var("MAX_TOTAL_FILES", "999999");
        let cfg = Config::from_env();
        assert_eq!(cfg.uploads.max_total_files, 10_000);
        env::remove_var("MAX_TOTAL_FILES");
    }

    #[test]
    fn redacted_summary_never_contains_secrets() {
        env::set_var("SMTP_PASSWORD", "hunter2");
        let cfg = Config::from_env();
        let summary = cfg.redacted_summary().to_string();
        assert!(!summary.contains("hunter2"));
        env::remove_var("SMTP_PASSWORD");
    }
}

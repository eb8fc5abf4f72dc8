//! Health report for monitoring.
//!
//! A failed database check degrades the report instead of failing the
//! check, so the process stays observable while storage is down.

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::DatabaseError;
use crate::jobs::QueueStats;
use crate::store::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: &'static str,
    pub environment: String,
    pub database: DatabaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueStats>,
}

impl HealthReport {
    fn from_counts(config: &PipelineConfig, counts: Result<QueueStats, DatabaseError>) -> Self {
        let (status, database, database_error, queue) = match counts {
            Ok(stats) => (HealthStatus::Healthy, DatabaseStatus::Connected, None, Some(stats)),
            Err(e) => (
                HealthStatus::Degraded,
                DatabaseStatus::Disconnected,
                Some(e.to_string()),
                None,
            ),
        };
        Self {
            status,
            version: env!("CARGO_PKG_VERSION"),
            environment: config.environment.to_string(),
            database,
            database_error,
            queue,
        }
    }
}

/// Ping the database and report queue depth.
pub async fn check(db: &dyn Database, config: &PipelineConfig) -> HealthReport {
    let counts = async {
        db.ping().await?;
        db.job_counts().await
    };
    let report = HealthReport::from_counts(config, counts.await);
    if let Some(err) = &report.database_error {
        tracing::warn!("Health check: database disconnected: {err}");
    }
    report
}

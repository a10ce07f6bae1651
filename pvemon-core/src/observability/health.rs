//! Health reporting for the `/health` endpoint.

use crate::collector::CollectReport;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const MONITOR_SUBSYSTEM: &str = "monitor";
pub const STORAGE_SUBSYSTEM: &str = "storage";

/// Overall exporter health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub version: &'static str,
    pub subsystems: Vec<SubsystemHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Tracks subsystem status across scrapes.
#[derive(Clone)]
pub struct HealthChecker {
    subsystems: Arc<RwLock<Vec<SubsystemHealth>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self { subsystems: Arc::new(RwLock::new(Vec::new())) }
    }

    pub async fn register_subsystem(&self, name: impl Into<String>) {
        let mut subsystems = self.subsystems.write().await;
        subsystems.push(SubsystemHealth { name: name.into(), status: HealthStatus::Healthy, message: None });
    }

    /// Update a registered subsystem. Unknown names are ignored.
    pub async fn update_subsystem(&self, name: &str, status: HealthStatus, message: Option<String>) {
        let mut subsystems = self.subsystems.write().await;
        if let Some(subsystem) = subsystems.iter_mut().find(|s| s.name == name) {
            subsystem.status = status;
            subsystem.message = message;
        }
    }

    /// Reflect the outcome of a collection pass.
    ///
    /// The monitor subsystem is degraded while sessions escalate past the
    /// close grace period; storage is unhealthy when its pass failed.
    pub async fn record_pass(&self, report: &CollectReport) {
        let (status, message) = match &report.escalation {
            Some(e) => (HealthStatus::Degraded, Some(e.to_string())),
            None => (HealthStatus::Healthy, None),
        };
        self.update_subsystem(MONITOR_SUBSYSTEM, status, message).await;

        let (status, message) = match &report.storage_error {
            Some(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
            None => (HealthStatus::Healthy, None),
        };
        self.update_subsystem(STORAGE_SUBSYSTEM, status, message).await;
    }

    /// Overall status is the worst subsystem status.
    pub async fn get_health(&self) -> HealthCheck {
        let subsystems = self.subsystems.read().await.clone();

        let status = if subsystems.iter().any(|s| s.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if subsystems.iter().any(|s| s.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthCheck { status, version: env!("CARGO_PKG_VERSION"), subsystems }
    }

    pub async fn is_ready(&self) -> bool {
        self.get_health().await.status == HealthStatus::Healthy
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PvemonError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_checker() {
        let checker = HealthChecker::new();
        checker.register_subsystem(MONITOR_SUBSYSTEM).await;
        checker.register_subsystem(STORAGE_SUBSYSTEM).await;

        let health = checker.get_health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.subsystems.len(), 2);

        checker.update_subsystem(STORAGE_SUBSYSTEM, HealthStatus::Unhealthy, Some("missing".to_string())).await;
        assert_eq!(checker.get_health().await.status, HealthStatus::Unhealthy);
        assert!(!checker.is_ready().await);
    }

    #[tokio::test]
    async fn test_pass_outcome_drives_subsystems() {
        let checker = HealthChecker::new();
        checker.register_subsystem(MONITOR_SUBSYSTEM).await;
        checker.register_subsystem(STORAGE_SUBSYSTEM).await;

        let mut report = CollectReport {
            families: Vec::new(),
            escalation: Some(PvemonError::UnterminatedSessions {
                count: 1,
                grace: Duration::from_secs(60),
                vmids: vec!["100".to_string()],
            }),
            storage_error: None,
            stats: Default::default(),
        };
        checker.record_pass(&report).await;
        let health = checker.get_health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.subsystems[0].message.as_deref().unwrap().contains("100"));

        report.escalation = None;
        checker.record_pass(&report).await;
        assert!(checker.is_ready().await);

        let json = serde_json::to_value(checker.get_health().await).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["subsystems"][0]["name"], "monitor");
    }
}

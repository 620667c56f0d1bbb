use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Health reporting for the worker's asynchronous loops.
///
/// The process can only be trusted with the stream's entries if its loops are
/// actually running, so each loop registers here and pings its handle every
/// cycle. The process status combines the individual ones:
///   - if any component is unhealthy, the process is unhealthy
///   - if all components recently reported healthy, the process is healthy
///   - a component that misses its deadline is considered stalled, and the
///     check fails.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy.
    pub healthy: bool,
    /// Current status of each registered component, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the status code from the overall health, and prints each
    /// component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered.
    Starting,
    /// Recently reported healthy, will need to report again before the date.
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached.
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy, returns when the message is queued. Must be called
    /// more frequently than the configured deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    /// Report component status, returns when the message is queued.
    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    // Poisoned lock: just warn, the probes will fail and the
                    // process restart.
                    warn!("poisoned HealthRegistry lock")
                }
            }
        });

        registry
    }

    /// Registers a new component. The returned handle should be passed to the
    /// component so it can frequently report its health status.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// The overall process status, computed from all registered components.
    /// Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");

        let mut result = HealthStatus {
            healthy: !components.is_empty(), // unhealthy if no component has registered yet
            components: Default::default(),
        };
        let now = time::OffsetDateTime::now_utc();

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                    _ = result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    _ = result
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    result.healthy = false;
                    _ = result.components.insert(name.clone(), status.clone());
                }
            }
        }

        match result.healthy {
            true => tracing::info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;
    use time::OffsetDateTime;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc().add(Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn tracks_a_component_through_its_lifecycle() {
        let registry = HealthRegistry::new("liveness");

        let handle = registry
            .register("worker".to_string(), Duration::seconds(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn a_stalled_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("worker".to_string(), Duration::seconds(30))
            .await;

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        // A ping with an already-elapsed deadline reads as stalled.
        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(Duration::seconds(1)),
            ))
            .await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("worker"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Liveness reporting for the long-running loops of the ingestion services.
///
/// Both the publisher and the processor are made of several asynchronous loops
/// (the rdkafka statistics callback, the consumer-group loop, one worker per
/// partition). The process can only be trusted to make progress if every
/// registered loop keeps reporting in.
///
/// The process status is derived from the registered components:
///   - no component registered yet: unhealthy
///   - any component reported unhealthy: unhealthy
///   - any component missed its reporting deadline: stalled, so unhealthy
///   - otherwise healthy
///
/// Each probe (liveness, readiness) should own its own registry.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True if all registered components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise. The body lists every component.
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
    /// Set on registration, before the first report
    Starting,
    /// Reported healthy, must report again before the deadline
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy, e.g. a partition worker that stopped on a ledger failure
    Unhealthy,
    /// Set when the HealthyUntil deadline passed without a new report
    Stalled,
}

struct HealthMessage {
    component: String,
    // None removes the component
    status: Option<ComponentStatus>,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Report healthy until now + deadline. Returns once the message is queued.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_unhealthy(&self) {
        self.report_status(ComponentStatus::Unhealthy).await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status: Some(status),
        };
        if let Err(err) = self.sender.send(message).await {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    /// Blocking variant for callers outside the runtime, like the rdkafka statistics callback.
    pub fn report_healthy_blocking(&self) {
        self.report_status_blocking(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status_blocking(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status: Some(status),
        };
        if let Err(err) = self.sender.blocking_send(message) {
            warn!(component = %self.component, "failed to report health status: {}", err)
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
                match components.write() {
                    Ok(mut map) => match message.status {
                        Some(status) => _ = map.insert(message.component, status),
                        None => _ = map.remove(&message.component),
                    },
                    // Probes will fail and the process will be restarted
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        registry
    }

    /// Registers a component and returns the handle it must report through.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Stops tracking a component, e.g. the worker of a revoked partition.
    /// Queued behind the component's earlier reports, so none of them re-adds it.
    pub async fn deregister(&self, component: &str) {
        let message = HealthMessage {
            component: component.to_owned(),
            status: None,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!(component, "failed to deregister health component: {}", err)
        }
    }

    /// Overall process status. Can be used directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: Default::default(),
        };
        let now = time::OffsetDateTime::now_utc();

        for (name, status) in components.iter() {
            let effective = match status {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                _ => status.clone(),
            };
            if !matches!(effective, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            _ = result.components.insert(name.clone(), effective);
        }

        match result.healthy {
            true => debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

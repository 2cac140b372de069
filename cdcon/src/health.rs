use async_trait::async_trait;
use axum::{extract::State, Json};
use bson::doc;
use futures_util::future::join_all;
use mongodb::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PingError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: Status,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: Status,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// A named dependency the probe can reach out to. Components are registered
/// once at startup; ping failures end up in the health response and nowhere
/// else.
#[async_trait]
pub trait MonitoredComponent: Send + Sync {
    fn name(&self) -> &str;
    async fn ping(&self) -> Result<(), PingError>;
}

/// Aggregates component pings into the `/healthz` response.
///
/// By default the aggregate status stays `UP` whatever the components say:
/// the probe exists for diagnostic visibility, not gating. `strict(true)`
/// flips the aggregate to `DOWN` when any component is down. The HTTP status
/// is 200 either way.
pub struct HealthHandler {
    components: Vec<Box<dyn MonitoredComponent>>,
    strict: bool,
}

impl HealthHandler {
    pub fn new(components: Vec<Box<dyn MonitoredComponent>>) -> Self {
        Self {
            components,
            strict: false,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub async fn check(&self) -> HealthResponse {
        let results = join_all(self.components.iter().map(|c| c.ping())).await;

        let mut components = BTreeMap::new();
        for (component, result) in self.components.iter().zip(results) {
            let status = match result {
                Ok(()) => Status::Up,
                Err(e) => {
                    warn!(component = %component.name(), error = %e, "Component ping failed");
                    Status::Down
                }
            };
            components.insert(component.name().to_owned(), ComponentHealth { status });
        }

        let status = if self.strict && components.values().any(|c| c.status == Status::Down) {
            Status::Down
        } else {
            Status::Up
        };

        HealthResponse { status, components }
    }
}

pub async fn healthz(State(handler): State<Arc<HealthHandler>>) -> Json<HealthResponse> {
    Json(handler.check().await)
}

pub struct MongoComponent {
    name: String,
    client: Client,
}

impl MongoComponent {
    pub fn new(client: Client) -> Self {
        Self {
            name: "mongodb".to_owned(),
            client,
        }
    }
}

#[async_trait]
impl MonitoredComponent for MongoComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), PingError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| PingError(e.to_string()))
    }
}

pub struct AmqpComponent {
    name: String,
    connection: Arc<lapin::Connection>,
}

impl AmqpComponent {
    pub fn new(connection: Arc<lapin::Connection>) -> Self {
        Self {
            name: "rabbitmq".to_owned(),
            connection,
        }
    }
}

#[async_trait]
impl MonitoredComponent for AmqpComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), PingError> {
        if self.connection.status().connected() {
            Ok(())
        } else {
            Err(PingError("connection is not open".to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TestComponent {
        name: &'static str,
        err: Option<&'static str>,
    }

    #[async_trait]
    impl MonitoredComponent for TestComponent {
        fn name(&self) -> &str {
            self.name
        }

        async fn ping(&self) -> Result<(), PingError> {
            match self.err {
                None => Ok(()),
                Some(e) => Err(PingError(e.to_owned())),
            }
        }
    }

    #[tokio::test]
    async fn component_is_up_if_it_was_pingable() {
        let handler = HealthHandler::new(vec![Box::new(TestComponent {
            name: "test",
            err: None,
        })]);

        let response = handler.check().await;

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "status": "UP", "components": { "test": { "status": "UP" } } })
        );
    }

    #[tokio::test]
    async fn component_is_down_if_it_was_not_pingable() {
        let handler = HealthHandler::new(vec![Box::new(TestComponent {
            name: "test",
            err: Some("not pingable"),
        })]);

        let response = handler.check().await;

        // The aggregate still reports UP; the probe is diagnostic.
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "status": "UP", "components": { "test": { "status": "DOWN" } } })
        );
    }

    #[tokio::test]
    async fn reports_every_registered_component() {
        let handler = HealthHandler::new(vec![
            Box::new(TestComponent {
                name: "db",
                err: None,
            }),
            Box::new(TestComponent {
                name: "bus",
                err: Some("connection refused"),
            }),
        ]);

        let response = handler.check().await;

        assert_eq!(response.components.len(), 2);
        assert_eq!(response.components["db"].status, Status::Up);
        assert_eq!(response.components["bus"].status, Status::Down);
        assert_eq!(response.status, Status::Up);
    }

    #[tokio::test]
    async fn strict_mode_degrades_the_aggregate() {
        let handler = HealthHandler::new(vec![
            Box::new(TestComponent {
                name: "db",
                err: Some("not pingable"),
            }),
            Box::new(TestComponent {
                name: "bus",
                err: None,
            }),
        ])
        .strict(true);

        let response = handler.check().await;
        assert_eq!(response.status, Status::Down);
        assert_eq!(response.components["bus"].status, Status::Up);
    }

    #[tokio::test]
    async fn strict_mode_with_healthy_components_stays_up() {
        let handler = HealthHandler::new(vec![Box::new(TestComponent {
            name: "db",
            err: None,
        })])
        .strict(true);

        assert_eq!(handler.check().await.status, Status::Up);
    }
}

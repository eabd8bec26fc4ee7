use anyhow::Result;
use omniqueue::{DynConsumer, DynProducer};
use serde::{Deserialize, Serialize};

use crate::{data_model::TaskStatus, http_objects::ArtifactView};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum QueueBackend {
    #[default]
    InMemory,
    AmazonSqs {
        queue_url: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
}

/// Payload of an `artifactCreated` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactCreatedEvent {
    pub status: TaskStatus,
    pub artifact: ArtifactView,
    pub run_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Message envelope: the task's route keys ride alongside the payload so
/// subscribers can filter without decoding it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RoutedMessage<'a> {
    exchange: &'static str,
    routes: &'a [String],
    payload: &'a ArtifactCreatedEvent,
}

/// Emits artifact lifecycle events to the message bus.
///
/// Delivery is at-least-once; a retried create publishes again and
/// subscribers must tolerate duplicates.
pub struct ArtifactPublisher {
    producer: DynProducer,
}

impl ArtifactPublisher {
    /// Builds the publisher. The in-memory backend also returns its
    /// consumer half so callers (the test harness) can observe deliveries.
    pub async fn new(config: &QueueConfig) -> Result<(Self, Option<DynConsumer>)> {
        match &config.backend {
            QueueBackend::InMemory => {
                let (producer, consumer) = omniqueue::backends::InMemoryBackend::builder()
                    .make_dynamic()
                    .build_pair()
                    .await?;
                Ok((ArtifactPublisher { producer }, Some(consumer)))
            }
            QueueBackend::AmazonSqs { queue_url } => {
                let sqs_config = omniqueue::backends::SqsConfig {
                    queue_dsn: queue_url.clone(),
                    override_endpoint: false,
                };
                let producer = omniqueue::backends::SqsBackend::builder(sqs_config)
                    .make_dynamic()
                    .build_producer()
                    .await?;
                Ok((ArtifactPublisher { producer }, None))
            }
        }
    }

    pub async fn artifact_created(
        &self,
        event: &ArtifactCreatedEvent,
        routes: &[String],
    ) -> Result<()> {
        let message = RoutedMessage {
            exchange: "artifact-created",
            routes,
            payload: event,
        };
        self.producer
            .send_serde_json(&message)
            .await
            .map_err(Into::into)
    }
}

//! # Redis Value Source
//!
//! Feeds channel values from Redis into the engine.
//!
//! - **Monitored channels** subscribe to the pub/sub channel of the same name.
//!   Each subscription runs on its own task with its own connection and is
//!   cancelled by [`ValueSource::unsubscribe`].
//! - **Scanned channels** read the key of the same name with `GET`.
//!
//! Payloads are JSON, either `{"value": .., "timestamp": ..}` or a bare value.
//! A payload that is not JSON is archived as text. Missing timestamps are
//! stamped on arrival.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use redis::{AsyncCommands, Client, RedisResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::SourceError;
use crate::core::sample::{Sample, SampleValue};
use crate::core::services::{SampleListener, ValueSource};

#[derive(Deserialize)]
struct Envelope {
    value: SampleValue,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Decodes one payload into a sample.
pub fn decode_payload(payload: &str) -> Sample {
    if let Ok(envelope) = serde_json::from_str::<Envelope>(payload) {
        return Sample::new(envelope.value, envelope.timestamp.unwrap_or_else(Utc::now));
    }
    match serde_json::from_str::<SampleValue>(payload) {
        Ok(value) => Sample::new(value, Utc::now()),
        Err(_) => Sample::new(SampleValue::Text(payload.to_string()), Utc::now()),
    }
}

pub struct RedisValueSource {
    client: Client,
    subscriptions: Mutex<HashMap<String, CancellationToken>>,
}

impl RedisValueSource {
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub fn new(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn disconnected(e: redis::RedisError) -> SourceError {
    SourceError::Disconnected(e.to_string())
}

#[async_trait]
impl ValueSource for RedisValueSource {
    async fn subscribe(&self, channel: &str, listener: Arc<dyn SampleListener>) -> Result<(), SourceError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(disconnected)?;
        pubsub.subscribe(channel).await.map_err(disconnected)?;

        let token = CancellationToken::new();
        let previous = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string(), token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let name = channel.to_string();
        tokio::spawn(async move {
            listener.on_connection(true);
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = messages.next() => match message {
                        Some(message) => match message.get_payload::<String>() {
                            Ok(payload) => {
                                let sample = decode_payload(&payload);
                                listener.on_value(sample.value, sample.timestamp);
                            }
                            Err(e) => warn!(channel = %name, error = %e, "Unreadable payload"),
                        },
                        None => {
                            warn!(channel = %name, "Subscription stream closed");
                            listener.on_connection(false);
                            break;
                        }
                    },
                }
            }
            debug!(channel = %name, "Subscription task finished");
        });
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SourceError> {
        let token = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel);
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }

    async fn read(&self, channel: &str) -> Result<Sample, SourceError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(disconnected)?;
        let payload: Option<String> = conn
            .get(channel)
            .await
            .map_err(|e| SourceError::Protocol(e.to_string()))?;
        payload
            .map(|p| decode_payload(&p))
            .ok_or_else(|| SourceError::NotFound(channel.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_envelope_with_timestamp() {
        let sample = decode_payload(r#"{"value": 3.5, "timestamp": "2024-05-01T12:00:00Z"}"#);
        assert_eq!(sample.value, SampleValue::Double(3.5));
        assert_eq!(sample.timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_decode_bare_values() {
        assert_eq!(decode_payload("42").value, SampleValue::Long(42));
        assert_eq!(decode_payload("\"open\"").value, SampleValue::Text("open".into()));
        assert_eq!(decode_payload("not json").value, SampleValue::Text("not json".into()));
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_channel_is_ok() {
        let source = RedisValueSource::new("redis://127.0.0.1:1/").unwrap();
        assert!(source.unsubscribe("PV:NONE").await.is_ok());
        assert_eq!(source.subscription_count(), 0);
    }
}

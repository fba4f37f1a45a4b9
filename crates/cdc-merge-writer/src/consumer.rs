//! NATS JetStream change feed
//!
//! Implements the `ChangeFeed` strategy with a durable pull consumer. The
//! stream sequence of each message is its source position.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    AckKind, Context,
};
use async_trait::async_trait;
use cdc_merge_core::prelude::*;
use cdc_merge_core::FeedConfig;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Consumer configuration for a feed resuming after `resume`
pub fn consumer_config(config: &FeedConfig, resume: Option<SourcePosition>) -> pull::Config {
    let deliver_policy = match resume {
        Some(position) => DeliverPolicy::ByStartSequence {
            start_sequence: position.offset() + 1,
        },
        None => DeliverPolicy::All,
    };

    let mut consumer = pull::Config {
        durable_name: Some(config.consumer.clone()),
        ack_policy: AckPolicy::Explicit,
        ack_wait: config.ack_wait,
        max_ack_pending: config.max_ack_pending as i64,
        deliver_policy,
        ..Default::default()
    };
    if !config.filter_subjects.is_empty() {
        consumer.filter_subjects = config.filter_subjects.clone();
    }
    consumer
}

/// Whether a delivered message is covered by the committed position
pub fn is_settled(position: SourcePosition, committed: Option<SourcePosition>) -> bool {
    committed.is_some_and(|c| position <= c)
}

/// JetStream-backed change feed
pub struct JetStreamFeed {
    config: FeedConfig,
    resume: RwLock<Option<SourcePosition>>,
    client: RwLock<Option<async_nats::Client>>,
    consumer: RwLock<Option<PullConsumer>>,
    /// Messages of the last fetch awaiting `settle`
    pending: Mutex<Vec<(SourcePosition, jetstream::Message)>>,
    running: AtomicBool,
}

impl JetStreamFeed {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            config,
            resume: RwLock::new(None),
            client: RwLock::new(None),
            consumer: RwLock::new(None),
            pending: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Get or create the durable consumer.
    ///
    /// An existing consumer keeps its own ack floor; the resume position is
    /// only used when the consumer is created.
    async fn ensure_consumer(&self, js: &Context) -> Result<PullConsumer> {
        let stream = js
            .get_stream(&self.config.stream)
            .await
            .map_err(|e| SyncError::transport_with_source("Stream not found", e))?;

        match stream.get_consumer(&self.config.consumer).await {
            Ok(consumer) => {
                debug!(consumer = %self.config.consumer, "Using existing consumer");
                Ok(consumer)
            }
            Err(_) => {
                let resume = *self.resume.read().await;
                let consumer = stream
                    .create_consumer(consumer_config(&self.config, resume))
                    .await
                    .map_err(|e| SyncError::transport_with_source("Failed to create consumer", e))?;

                info!(consumer = %self.config.consumer, resume = ?resume, "Created consumer");
                Ok(consumer)
            }
        }
    }

    async fn nak_all(&self, messages: Vec<(SourcePosition, jetstream::Message)>) {
        for (position, msg) in messages {
            if let Err(e) = msg.ack_with(AckKind::Nak(None)).await {
                warn!(position = %position, error = %e, "Failed to nak message");
            }
        }
    }
}

#[async_trait]
impl Lifecycle for JetStreamFeed {
    async fn start(&self) -> Result<()> {
        info!(url = %self.config.url, stream = %self.config.stream, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .name(&self.config.connection_name)
            .connect(&self.config.url)
            .await
            .map_err(|e| SyncError::transport_with_source("Failed to connect", e))?;

        let js = jetstream::new(client.clone());
        let consumer = self.ensure_consumer(&js).await?;

        *self.client.write().await = Some(client);
        *self.consumer.write().await = Some(consumer);
        self.running.store(true, Ordering::SeqCst);

        info!("JetStream feed started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        let unsettled = std::mem::take(&mut *self.pending.lock().await);
        self.nak_all(unsettled).await;
        *self.consumer.write().await = None;
        *self.client.write().await = None;

        info!("JetStream feed stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for JetStreamFeed {
    async fn health_check(&self) -> Result<()> {
        let client = self.client.read().await;
        match client.as_ref() {
            Some(c) if c.connection_state() == async_nats::connection::State::Connected => Ok(()),
            Some(_) => Err(SyncError::transport("Not connected")),
            None => Err(SyncError::transport("Client not initialized")),
        }
    }

    fn component_name(&self) -> &'static str {
        "jetstream_feed"
    }
}

#[async_trait]
impl ChangeFeed for JetStreamFeed {
    async fn resume_after(&self, position: Option<SourcePosition>) -> Result<()> {
        if self.is_running() {
            return Err(SyncError::Internal(
                "resume position must be set before the feed starts".into(),
            ));
        }
        *self.resume.write().await = position;
        Ok(())
    }

    async fn fetch(&self, max_records: usize) -> Result<Vec<RawChange>> {
        let consumer = self
            .consumer
            .read()
            .await
            .as_ref()
            .ok_or_else(|| SyncError::transport("Consumer not initialized"))?
            .clone();

        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            warn!(count = pending.len(), "Previous fetch was never settled, requesting redelivery");
            let unsettled = std::mem::take(&mut *pending);
            self.nak_all(unsettled).await;
        }

        let mut messages = consumer
            .fetch()
            .max_messages(max_records)
            .expires(self.config.fetch_wait)
            .messages()
            .await
            .map_err(|e| SyncError::transport_with_source("Error fetching batch", e))?;

        while let Some(result) = messages.next().await {
            match result {
                Ok(msg) => {
                    let sequence = match msg.info() {
                        Ok(info) => info.stream_sequence,
                        Err(e) => {
                            error!(error = %e, "Message without JetStream metadata, skipping");
                            continue;
                        }
                    };
                    pending.push((SourcePosition(sequence), msg));
                }
                Err(e) => {
                    warn!(error = %e, "Error receiving message");
                    break;
                }
            }
        }

        // Redeliveries can arrive behind newer messages
        pending.sort_by_key(|(position, _)| *position);

        let changes: Vec<RawChange> = pending
            .iter()
            .map(|(position, msg)| RawChange {
                position: *position,
                payload: msg.payload.clone(),
            })
            .collect();
        debug!(count = changes.len(), "Fetched changes");
        Ok(changes)
    }

    async fn settle(&self, committed: Option<SourcePosition>) -> Result<()> {
        let messages = std::mem::take(&mut *self.pending.lock().await);
        let mut acked = 0usize;
        let mut redeliver = Vec::new();

        for (position, msg) in messages {
            if is_settled(position, committed) {
                if let Err(e) = msg.ack().await {
                    // Redelivered later and skipped by the checkpoint
                    warn!(position = %position, error = %e, "Failed to ack message");
                }
                acked += 1;
            } else {
                redeliver.push((position, msg));
            }
        }

        let redelivered = redeliver.len();
        self.nak_all(redeliver).await;
        debug!(acked, redelivered, committed = ?committed, "Settled fetch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_resume() {
        let config = FeedConfig::default();

        let fresh = consumer_config(&config, None);
        assert!(matches!(fresh.deliver_policy, DeliverPolicy::All));
        assert_eq!(fresh.durable_name.as_deref(), Some(config.consumer.as_str()));
        assert!(matches!(fresh.ack_policy, AckPolicy::Explicit));

        let resumed = consumer_config(&config, Some(SourcePosition(41)));
        assert!(matches!(
            resumed.deliver_policy,
            DeliverPolicy::ByStartSequence { start_sequence: 42 }
        ));
    }

    #[test]
    fn test_filter_subjects() {
        let config = FeedConfig {
            filter_subjects: vec!["cdc.users.>".into()],
            ..Default::default()
        };
        assert_eq!(consumer_config(&config, None).filter_subjects, vec!["cdc.users.>"]);
    }

    #[test]
    fn test_is_settled() {
        assert!(!is_settled(SourcePosition(1), None));
        assert!(is_settled(SourcePosition(3), Some(SourcePosition(3))));
        assert!(!is_settled(SourcePosition(4), Some(SourcePosition(3))));
    }

    #[tokio::test]
    async fn test_fetch_before_start_fails() {
        let feed = JetStreamFeed::new(FeedConfig::default());
        assert!(feed.resume_after(Some(SourcePosition(5))).await.is_ok());
        let err = feed.fetch(10).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }));
        assert!(feed.health_check().await.is_err());
    }
}

/// AMQP connection, topology and consumer.
///
/// Only `amqps://` URLs are accepted. Retry pacing lives in `Backoff`; the
/// dispatcher drives the retries so playback can be kept alive in between.
use std::time::Duration;

use futures_util::StreamExt;
use lapin::{
    Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use reqwest::Url;
use tracing::{info, warn};

use crate::{
    config::Config,
    dispatch::{Envelope, Inbox},
    error::{DaemonError, Result},
    models::{BROADCAST_ROUTING_KEY, EXCHANGE},
};

const CONSUMER_TAG: &str = "rpimusicd";

/// Validate the broker URL and add the heartbeat interval unless the URL
/// already carries one. Plaintext schemes are refused.
pub fn secure_broker_url(raw: &str, heartbeat_secs: u16) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| DaemonError::Config(format!("amqp_url is not a URL: {e}")))?;

    if url.scheme() != "amqps" {
        return Err(DaemonError::InsecureBroker {
            scheme: url.scheme().to_string(),
        });
    }

    if !url.query_pairs().any(|(k, _)| k == "heartbeat") {
        url.query_pairs_mut()
            .append_pair("heartbeat", &heartbeat_secs.to_string());
    }
    Ok(url.to_string())
}

// ── Consumer ──────────────────────────────────────────────────────────────────

pub struct AmqpInbox {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

/// Connect, declare the exchange and this instance's queue, bind it and
/// start consuming.
pub async fn connect(config: &Config) -> Result<AmqpInbox> {
    let uri = secure_broker_url(&config.amqp_url, config.heartbeat_secs)?;
    let queue = config.queue_name();

    // Run lapin's I/O on the tokio runtime instead of its bundled executor.
    let properties = ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio);

    info!("connecting amqp");
    let connection = Connection::connect(&uri, properties).await?;
    let channel = connection.create_channel().await?;

    channel
        .exchange_declare(
            EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    info!("registering queue {queue}");
    channel
        .queue_declare(
            &queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    for routing_key in [queue.as_str(), BROADCAST_ROUTING_KEY] {
        channel
            .queue_bind(
                &queue,
                EXCHANGE,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    // One unacknowledged message at a time keeps playback commands ordered.
    channel.basic_qos(1, BasicQosOptions::default()).await?;

    let consumer = channel
        .basic_consume(
            &queue,
            CONSUMER_TAG,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!("consuming from {queue} on exchange {EXCHANGE}");
    Ok(AmqpInbox {
        connection,
        channel,
        consumer,
    })
}

impl AmqpInbox {
    pub async fn close(self) {
        if let Err(e) = self.connection.close(200, "rpimusicd stopping").await {
            warn!("closing amqp connection: {e}");
        }
    }
}

impl Inbox for AmqpInbox {
    async fn recv(&mut self) -> Option<Result<Envelope>> {
        let delivery = self.consumer.next().await?;
        Some(
            delivery
                .map(|d| Envelope {
                    delivery_tag: d.delivery_tag,
                    body: d.data,
                })
                .map_err(DaemonError::from),
        )
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

// ── Reconnect ─────────────────────────────────────────────────────────────────

/// Exponential backoff: `base * 2^(n-1)` for attempt `n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_retries: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max,
            max_retries,
            attempt: 0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Duration::from_secs(config.reconnect_base_delay_secs),
            Duration::from_secs(config.reconnect_max_delay_secs),
            config.reconnect_max_retries,
        )
    }

    /// Delay before the next attempt, or `None` once retries are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let factor = 2u32.checked_pow(self.attempt).unwrap_or(u32::MAX);
        self.attempt += 1;
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

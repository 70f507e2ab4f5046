//! Event producer.
//!
//! Turns product events into channel records and hands them to a single background
//! sender task. Callers never wait on the broker: `publish` enqueues and returns a
//! [`PublishReceipt`] which resolves once the channel accepted (or refused) the record.
//!
//! ## Ordering
//!
//! One sender task publishes records strictly in enqueue order, so two events for the
//! same product reach their partitions in the order the commands were issued.
//!
//! ## Failures
//!
//! Nothing is retried. A failed send resolves the receipt with the error, is logged,
//! and is forwarded to the optional failure sink.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use catalog_events::{ChannelError, Event, EventChannel, EventEnvelope, RecordPosition};
use catalog_products::ProductEvent;

use crate::config::TopicConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialize(String),

    #[error("event has no product id to key it by")]
    MissingPartitionKey,

    #[error("producer queue is full")]
    QueueFull,

    #[error("producer is shut down")]
    ProducerClosed,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// A publish that did not make it onto the channel.
#[derive(Debug, Clone)]
pub struct PublishFailure {
    pub topic: String,
    pub event: ProductEvent,
    pub error: PublishError,
}

/// Sink for publish failures (e.g. an alerting task or a test collector).
pub type FailureSink = mpsc::UnboundedSender<PublishFailure>;

/// Outcome of one `publish` call.
///
/// Awaiting it is optional; dropping it does not cancel the publish.
#[derive(Debug)]
#[must_use = "a receipt does nothing unless awaited; drop it explicitly to ignore the outcome"]
pub struct PublishReceipt {
    state: ReceiptState,
}

#[derive(Debug)]
enum ReceiptState {
    Pending(oneshot::Receiver<Result<RecordPosition, PublishError>>),
    Ready(Option<Result<RecordPosition, PublishError>>),
}

impl PublishReceipt {
    fn pending(rx: oneshot::Receiver<Result<RecordPosition, PublishError>>) -> Self {
        Self {
            state: ReceiptState::Pending(rx),
        }
    }

    fn failed(error: PublishError) -> Self {
        Self {
            state: ReceiptState::Ready(Some(Err(error))),
        }
    }
}

impl Future for PublishReceipt {
    type Output = Result<RecordPosition, PublishError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReceiptState::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // Sender task dropped the reply without answering.
                Poll::Ready(Err(_)) => Poll::Ready(Err(PublishError::ProducerClosed)),
                Poll::Pending => Poll::Pending,
            },
            ReceiptState::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or(Err(PublishError::ProducerClosed)),
            ),
        }
    }
}

struct Outgoing {
    topic: String,
    envelope: EventEnvelope<ProductEvent>,
    reply: oneshot::Sender<Result<RecordPosition, PublishError>>,
}

/// Publishes product events to the topic of their kind, keyed by product id.
///
/// Cheap to clone; clones share the sender task.
#[derive(Debug, Clone)]
pub struct EventProducer {
    queue: mpsc::Sender<Outgoing>,
    topics: Arc<TopicConfig>,
    failures: Option<FailureSink>,
}

/// Controls the producer's sender task.
#[derive(Debug)]
pub struct ProducerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    /// Stop accepting events, flush what is already queued, then wait for the task.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "producer sender task panicked");
            }
        }
    }
}

impl EventProducer {
    /// Start the sender task on the current tokio runtime.
    ///
    /// `queue_capacity` bounds the records waiting to be sent; beyond it `publish`
    /// fails fast with [`PublishError::QueueFull`].
    pub fn spawn<C>(
        channel: C,
        topics: TopicConfig,
        queue_capacity: usize,
        failures: Option<FailureSink>,
    ) -> (Self, ProducerHandle)
    where
        C: EventChannel + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(sender_loop(channel, queue_rx, shutdown_rx, failures.clone()));

        let producer = Self {
            queue: queue_tx,
            topics: Arc::new(topics),
            failures,
        };
        let handle = ProducerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        };
        (producer, handle)
    }

    /// Enqueue `event` for publication. Never blocks.
    pub fn publish(&self, event: impl Into<ProductEvent>) -> PublishReceipt {
        let event = event.into();
        let topic = self.topics.topic(event.kind()).to_string();

        if event.partition_key().is_none() {
            return self.reject(topic, event, PublishError::MissingPartitionKey);
        }

        let (reply, rx) = oneshot::channel();
        let outgoing = Outgoing {
            topic,
            envelope: EventEnvelope::new(event),
            reply,
        };

        match self.queue.try_send(outgoing) {
            Ok(()) => PublishReceipt::pending(rx),
            Err(mpsc::error::TrySendError::Full(out)) => {
                self.reject(out.topic, out.envelope.into_payload(), PublishError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(out)) => self.reject(
                out.topic,
                out.envelope.into_payload(),
                PublishError::ProducerClosed,
            ),
        }
    }

    fn reject(&self, topic: String, event: ProductEvent, error: PublishError) -> PublishReceipt {
        warn!(%topic, product_id = ?event.product_id(), error = %error, "event rejected before publish");
        report(&self.failures, &topic, &event, &error);
        PublishReceipt::failed(error)
    }
}

fn report(failures: &Option<FailureSink>, topic: &str, event: &ProductEvent, error: &PublishError) {
    if let Some(sink) = failures {
        let _ = sink.send(PublishFailure {
            topic: topic.to_string(),
            event: event.clone(),
            error: error.clone(),
        });
    }
}

async fn sender_loop<C>(
    channel: C,
    mut queue: mpsc::Receiver<Outgoing>,
    mut shutdown: watch::Receiver<bool>,
    failures: Option<FailureSink>,
) where
    C: EventChannel,
{
    loop {
        let next = tokio::select! {
            biased;
            msg = queue.recv() => msg,
            _ = shutdown.changed() => {
                // Refuse new work but drain what was accepted.
                queue.close();
                queue.recv().await
            }
        };

        let Some(outgoing) = next else {
            break;
        };
        send_one(&channel, outgoing, &failures).await;
    }

    debug!("producer sender task stopped");
}

async fn send_one<C>(channel: &C, outgoing: Outgoing, failures: &Option<FailureSink>)
where
    C: EventChannel,
{
    let Outgoing {
        topic,
        envelope,
        reply,
    } = outgoing;
    let product_id = envelope.payload().product_id();

    let result = match envelope.to_record(topic.clone()) {
        Ok(record) => channel.publish(record).await.map_err(PublishError::from),
        Err(err) => Err(PublishError::Serialize(err.to_string())),
    };

    match &result {
        Ok(position) => debug!(
            topic = %position.topic,
            partition = position.partition,
            offset = position.offset,
            product_id = ?product_id,
            event_id = %envelope.event_id(),
            "event published"
        ),
        Err(err) => {
            error!(%topic, product_id = ?product_id, error = %err, "event publish failed");
            report(failures, &topic, envelope.payload(), err);
        }
    }

    let _ = reply.send(result);
}

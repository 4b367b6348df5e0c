//! The per-queue consume loop.
use crate::configuration::QueueConfig;
use crate::consumers::listener::ListenerInner;
use futures_util::StreamExt;
use lapin::options::BasicConsumeOptions;
use lapin::types::FieldTable;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Consume deliveries from one queue until the generation is cancelled or
/// the delivery stream ends.
///
/// Workers are intentionally single-threaded per queue: each delivery is
/// dispatched synchronously, so deliveries on one queue are processed
/// strictly in arrival order with no overlap. Throughput scales via the
/// number of distinct queues, not per-message concurrency.
pub(crate) async fn run_queue_worker(
    inner: Arc<ListenerInner>,
    channel: lapin::Channel,
    queue: QueueConfig,
    generation: CancellationToken,
) {
    let consumer_tag = format!("{}-{}", queue.name, Uuid::new_v4());
    let mut deliveries = match channel
        .basic_consume(
            &queue.name,
            &consumer_tag,
            BasicConsumeOptions {
                no_ack: queue.auto_ack,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(consumer) => consumer,
        Err(error) => {
            tracing::error!(
                queue_name = %queue.name,
                error = %error,
                "failed to start consuming"
            );
            return;
        }
    };

    loop {
        tokio::select! {
            // Prefer observing cancellation over pulling more work.
            biased;

            _ = generation.cancelled() => {
                tracing::info!(queue_name = %queue.name, "exiting consume loop, generation cancelled");
                return;
            }

            delivery = deliveries.next() => {
                match delivery {
                    None => {
                        tracing::info!(queue_name = %queue.name, "delivery stream closed");
                        return;
                    }
                    Some(Err(error)) => {
                        tracing::error!(
                            queue_name = %queue.name,
                            error = %error,
                            "consumer error, exiting consume loop"
                        );
                        return;
                    }
                    Some(Ok(delivery)) => {
                        inner
                            .process_delivery(&channel, &queue, &generation, delivery)
                            .await;
                    }
                }
            }
        }
    }
}

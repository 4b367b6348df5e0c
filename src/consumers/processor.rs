//! Per-delivery processing: cancellation gates, envelope decode, retry
//! accounting and the terminal ack/requeue decision.
use crate::configuration::QueueConfig;
use crate::consumers::listener::ListenerInner;
use crate::consumers::retry;
use crate::consumers::ConsumeHandler;
use crate::envelope::Envelope;
use crate::error::ConsumeError;
use crate::interceptors::{ConsumeContext, Terminal};
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicPublishOptions, BasicRejectOptions};
use lapin::BasicProperties;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fixed pause before a failed message is republished, to avoid hammering a
/// struggling downstream with an immediate redelivery.
const PRE_REQUEUE_BACKOFF: Duration = Duration::from_millis(100);

impl ListenerInner {
    /// Run one delivery through the interceptor chain and the terminal
    /// processing logic. Every exit path leaves the delivery in a terminal
    /// state: acked, rejected or republished-then-acked.
    pub(crate) async fn process_delivery(
        &self,
        channel: &lapin::Channel,
        queue: &QueueConfig,
        generation: &CancellationToken,
        delivery: Delivery,
    ) {
        // No processing is attempted under a cancelled generation: hand the
        // message straight back to the broker.
        if generation.is_cancelled() {
            if let Err(error) = delivery
                .acker
                .reject(BasicRejectOptions { requeue: true })
                .await
            {
                tracing::warn!(
                    queue_name = %queue.name,
                    error = %error,
                    "failed to requeue delivery received under a cancelled generation"
                );
            }
            return;
        }

        let _guard = self.in_flight.track();

        let terminal = DeliveryTerminal {
            channel,
            queue,
            delivery: &delivery,
            handler: self.handler.as_ref(),
            content_type: &self.config.content_type,
        };
        let cx = ConsumeContext {
            queue_name: &queue.name,
            body: &delivery.data,
            cancellation: generation,
        };
        // The chain has already logged and recorded the outcome; the retry
        // policy inside the terminal has made the ack/requeue decision.
        let _ = self.interceptors.run(cx, &terminal).await;
    }
}

/// The terminal decision for one delivery, computed before any broker call.
pub(crate) enum Verdict {
    /// The generation was cancelled: hand the message back to the broker.
    RejectRequeue,
    /// The body does not decode: acknowledge and drop.
    AckPoison(serde_json::Error),
    /// The retry budget is exhausted: acknowledge and drop.
    AckExhausted(i64),
    /// Dispatch the payload to the application handler.
    Dispatch(Envelope, i64),
}

/// Classify a delivery. Pure: the broker-facing acting on the verdict lives
/// in [`DeliveryTerminal`].
pub(crate) fn classify(
    cancelled: bool,
    body: &[u8],
    headers: Option<&lapin::types::FieldTable>,
    max_retry_count: i64,
) -> Verdict {
    if cancelled {
        return Verdict::RejectRequeue;
    }
    let envelope = match Envelope::decode(body) {
        Ok(envelope) => envelope,
        Err(error) => return Verdict::AckPoison(error),
    };
    let retry_count = retry::read_retry_count(headers);
    if retry_count > max_retry_count {
        return Verdict::AckExhausted(retry_count);
    }
    Verdict::Dispatch(envelope, retry_count)
}

/// The innermost stage of the interceptor chain for a single delivery.
struct DeliveryTerminal<'a> {
    channel: &'a lapin::Channel,
    queue: &'a QueueConfig,
    delivery: &'a Delivery,
    handler: &'a dyn ConsumeHandler,
    content_type: &'a str,
}

#[async_trait::async_trait]
impl Terminal for DeliveryTerminal<'_> {
    async fn call(&self, cx: ConsumeContext<'_>) -> Result<(), ConsumeError> {
        // The cancellation state is re-read here: the generation may have
        // been cancelled between the worker handing us the delivery and the
        // interceptors reaching this point.
        let verdict = classify(
            cx.cancellation.is_cancelled(),
            cx.body,
            self.delivery.properties.headers().as_ref(),
            self.queue.max_retry_count,
        );
        match verdict {
            Verdict::RejectRequeue => {
                self.delivery
                    .acker
                    .reject(BasicRejectOptions { requeue: true })
                    .await
                    .map_err(ConsumeError::Broker)?;
                Ok(())
            }
            Verdict::AckPoison(error) => {
                tracing::error!(
                    queue_name = %cx.queue_name,
                    error = %error,
                    "failed to decode message envelope"
                );
                // A message this consumer cannot parse will not parse for any
                // other consumer of the same queue either: requeuing it would
                // loop forever, so it is acknowledged and dropped.
                if !self.queue.auto_ack {
                    self.ack("poison message").await;
                }
                Err(ConsumeError::Envelope(error))
            }
            Verdict::AckExhausted(retry_count) => {
                tracing::warn!(
                    queue_name = %cx.queue_name,
                    retry_count,
                    max_retry_count = self.queue.max_retry_count,
                    "retry budget exhausted, dropping message"
                );
                if !self.queue.auto_ack {
                    self.ack("exhausted message").await;
                }
                Ok(())
            }
            Verdict::Dispatch(envelope, retry_count) => {
                match self.handler.consume(envelope.payload()).await {
                    Ok(()) => {
                        if !self.queue.auto_ack {
                            self.ack("processed message").await;
                        }
                        Ok(())
                    }
                    Err(error) => {
                        tokio::time::sleep(PRE_REQUEUE_BACKOFF).await;
                        self.requeue(retry_count).await;
                        Err(ConsumeError::Handler(error))
                    }
                }
            }
        }
    }
}

impl DeliveryTerminal<'_> {
    async fn ack(&self, what: &str) {
        if let Err(error) = self.delivery.acker.ack(BasicAckOptions::default()).await {
            tracing::warn!(
                queue_name = %self.queue.name,
                error = %error,
                "failed to ack {what}"
            );
        }
    }

    /// Republish the message onto the same queue with the retry counter
    /// bumped, then acknowledge the original delivery.
    ///
    /// Republishing (rather than a broker-native requeue) is what lets the
    /// retry counter survive. The original is acknowledged even if the
    /// republish fails: an unacknowledged original would be redelivered
    /// forever, and the possible loss on a transient publish failure is an
    /// accepted trade-off.
    async fn requeue(&self, retry_count: i64) {
        let headers =
            retry::incremented_headers(self.delivery.properties.headers().as_ref(), retry_count);
        let properties = BasicProperties::default()
            .with_headers(headers)
            .with_content_type(self.content_type.into());

        match self
            .channel
            .basic_publish(
                "",
                &self.queue.name,
                BasicPublishOptions::default(),
                &self.delivery.data,
                properties,
            )
            .await
        {
            Ok(_confirm) => {
                tracing::info!(
                    queue_name = %self.queue.name,
                    retry_count = retry_count + 1,
                    "requeued message for retry"
                );
            }
            Err(error) => {
                tracing::error!(
                    queue_name = %self.queue.name,
                    error = %error,
                    payload = %String::from_utf8_lossy(&self.delivery.data),
                    "failed to requeue message"
                );
            }
        }

        if !self.queue.auto_ack {
            self.ack("original delivery after requeue").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{AMQPValue, FieldTable};

    fn headers_with_count(count: i64) -> FieldTable {
        let mut table = FieldTable::default();
        table.insert(
            retry::RETRY_COUNT_HEADER.into(),
            AMQPValue::LongLongInt(count),
        );
        table
    }

    #[test]
    fn cancelled_generations_hand_the_message_back() {
        let verdict = classify(true, br#"{"msg":{}}"#, None, 3);
        assert!(matches!(verdict, Verdict::RejectRequeue));
    }

    #[test]
    fn undecodable_bodies_are_dropped_as_poison() {
        let verdict = classify(false, b"not json at all", None, 3);
        assert!(matches!(verdict, Verdict::AckPoison(_)));
    }

    #[test]
    fn the_retry_budget_is_a_hard_cap() {
        let over = headers_with_count(4);
        let verdict = classify(false, br#"{"msg":{}}"#, Some(&over), 3);
        assert!(matches!(verdict, Verdict::AckExhausted(4)));

        // At the cap the message still gets its last attempt.
        let at = headers_with_count(3);
        let verdict = classify(false, br#"{"msg":{}}"#, Some(&at), 3);
        assert!(matches!(verdict, Verdict::Dispatch(_, 3)));
    }

    #[test]
    fn first_deliveries_dispatch_with_zero_retries() {
        let verdict = classify(false, br#"{"msg":"ok"}"#, None, 3);
        match verdict {
            Verdict::Dispatch(envelope, 0) => assert_eq!(envelope.payload(), br#""ok""#),
            _ => panic!("expected a dispatch verdict"),
        }
    }
}

//! Distributed-tracing propagation for the consume pipeline.
use crate::envelope::Envelope;
use crate::error::ConsumeError;
use crate::interceptors::{ConsumeContext, Interceptor, Next};
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Restores the trace context propagated in the envelope's `carrier` map and
/// wraps the rest of the chain in a consumer-kind span.
///
/// If the body does not decode as an [`Envelope`] the call proceeds
/// unchanged; the processor will classify the message later.
pub struct Trace;

#[async_trait::async_trait]
impl Interceptor for Trace {
    async fn intercept<'a>(
        &'a self,
        cx: ConsumeContext<'a>,
        next: Next<'a>,
    ) -> Result<(), ConsumeError> {
        let envelope = match Envelope::decode(cx.body) {
            Ok(envelope) => envelope,
            Err(_) => return next.run(cx).await,
        };

        let parent =
            opentelemetry::global::get_text_map_propagator(|propagator| {
                propagator.extract(&envelope.carrier)
            });
        let span = tracing::info_span!(
            "mq_consume",
            queue_name = %cx.queue_name,
            otel.kind = "consumer",
        );
        span.set_parent(parent);

        next.run(cx).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::tests::{test_context, RecordingTerminal};
    use crate::interceptors::InterceptorChain;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn well_formed_envelopes_reach_the_terminal() {
        let chain = InterceptorChain::new(vec![Arc::new(Trace)]);
        let terminal = RecordingTerminal::succeeding();
        let token = CancellationToken::new();
        let body = br#"{"carrier":{"traceparent":"00-abc-def-01"},"msg":{}}"#;

        chain
            .run(test_context(body, &token), &terminal)
            .await
            .unwrap();

        assert_eq!(terminal.call_count(), 1);
    }

    #[tokio::test]
    async fn undecodable_bodies_fall_through_unchanged() {
        let chain = InterceptorChain::new(vec![Arc::new(Trace)]);
        let terminal = RecordingTerminal::succeeding();
        let token = CancellationToken::new();

        chain
            .run(test_context(b"not json", &token), &terminal)
            .await
            .unwrap();

        assert_eq!(terminal.call_count(), 1);
    }
}

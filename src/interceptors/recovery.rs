//! Panic containment for the consume pipeline.
use crate::error::ConsumeError;
use crate::interceptors::{ConsumeContext, Interceptor, Next};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;

/// Converts a panic anywhere below it in the chain into a returned
/// [`ConsumeError::Panic`], so a malformed payload or a handler bug can
/// never tear the queue worker loop down.
///
/// Intended to be the outermost interceptor.
pub struct Recovery;

#[async_trait::async_trait]
impl Interceptor for Recovery {
    async fn intercept<'a>(
        &'a self,
        cx: ConsumeContext<'a>,
        next: Next<'a>,
    ) -> Result<(), ConsumeError> {
        match AssertUnwindSafe(next.run(cx)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(
                    queue_name = %cx.queue_name,
                    panic = %reason,
                    "panic while processing message"
                );
                Err(ConsumeError::Panic(reason))
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::tests::{test_context, RecordingTerminal};
    use crate::interceptors::{InterceptorChain, Terminal};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct PanickingTerminal;

    #[async_trait::async_trait]
    impl Terminal for PanickingTerminal {
        async fn call(&self, _cx: ConsumeContext<'_>) -> Result<(), ConsumeError> {
            panic!("handler exploded");
        }
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let chain = InterceptorChain::new(vec![Arc::new(Recovery)]);
        let token = CancellationToken::new();

        let outcome = chain
            .run(test_context(b"{}", &token), &PanickingTerminal)
            .await;

        match outcome {
            Err(ConsumeError::Panic(reason)) => assert_eq!(reason, "handler exploded"),
            other => panic!("expected a panic error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_calls_pass_through_untouched() {
        let chain = InterceptorChain::new(vec![Arc::new(Recovery)]);
        let terminal = RecordingTerminal::succeeding();
        let token = CancellationToken::new();

        chain
            .run(test_context(b"{}", &token), &terminal)
            .await
            .unwrap();

        assert_eq!(terminal.call_count(), 1);
    }
}

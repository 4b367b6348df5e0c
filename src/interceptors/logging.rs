//! Failure logging for the consume pipeline.
use crate::error::ConsumeError;
use crate::interceptors::{ConsumeContext, Interceptor, Next};

/// Logs queue name, error and raw payload whenever the rest of the chain
/// returns an error. Successful calls are not logged.
pub struct Logging;

#[async_trait::async_trait]
impl Interceptor for Logging {
    async fn intercept<'a>(
        &'a self,
        cx: ConsumeContext<'a>,
        next: Next<'a>,
    ) -> Result<(), ConsumeError> {
        let outcome = next.run(cx).await;
        if let Err(error) = &outcome {
            tracing::error!(
                queue_name = %cx.queue_name,
                error = %error,
                payload = %String::from_utf8_lossy(cx.body),
                "failed to process message"
            );
        }
        outcome
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
    async fn outcome_is_propagated_unchanged() {
        let chain = InterceptorChain::new(vec![Arc::new(Logging)]);
        let token = CancellationToken::new();

        let ok = chain
            .run(
                test_context(b"{}", &token),
                &RecordingTerminal::succeeding(),
            )
            .await;
        assert!(ok.is_ok());

        let err = chain
            .run(test_context(b"{}", &token), &RecordingTerminal::failing())
            .await;
        assert!(matches!(err, Err(ConsumeError::Handler(_))));
    }
}

//! Consumption metrics for the consume pipeline.
use crate::error::ConsumeError;
use crate::interceptors::{ConsumeContext, Interceptor, Next};
use crate::metrics::MetricsSink;
use std::sync::Arc;
use std::time::Instant;

/// Records a duration histogram and a success/fail counter around the rest
/// of the chain, both labeled by queue name.
pub struct Metrics {
    sink: Arc<dyn MetricsSink>,
}

impl Metrics {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

#[async_trait::async_trait]
impl Interceptor for Metrics {
    async fn intercept<'a>(
        &'a self,
        cx: ConsumeContext<'a>,
        next: Next<'a>,
    ) -> Result<(), ConsumeError> {
        let started = Instant::now();
        let outcome = next.run(cx).await;
        self.sink
            .record_consume(cx.queue_name, outcome.is_ok(), started.elapsed());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::tests::{test_context, RecordingTerminal};
    use crate::interceptors::InterceptorChain;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<(String, bool, Duration)>>,
    }

    impl MetricsSink for RecordingSink {
        fn record_consume(&self, queue_name: &str, success: bool, duration: Duration) {
            self.records
                .lock()
                .unwrap()
                .push((queue_name.to_owned(), success, duration));
        }
    }

    #[tokio::test]
    async fn records_success_and_failure_by_queue() {
        let sink = Arc::new(RecordingSink::default());
        let chain = InterceptorChain::new(vec![Arc::new(Metrics::new(sink.clone()))]);
        let token = CancellationToken::new();

        chain
            .run(
                test_context(b"{}", &token),
                &RecordingTerminal::succeeding(),
            )
            .await
            .unwrap();
        let _ = chain
            .run(test_context(b"{}", &token), &RecordingTerminal::failing())
            .await;

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!((records[0].0.as_str(), records[0].1), ("orders", true));
        assert_eq!((records[1].0.as_str(), records[1].1), ("orders", false));
    }
}

//! Interceptor types are heavily inspired by `tide`'s approach to middleware.
//!
//! An interceptor wraps the terminal consume call with cross-cutting
//! behavior: it can observe before/after, transform the tracing context,
//! or short-circuit by not invoking [`Next::run`]. The first interceptor
//! in the chain is the outermost wrapper: it sees the call first and last.
use crate::error::ConsumeError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use logging::Logging;
pub use metrics::Metrics;
pub use recovery::Recovery;
pub use trace::Trace;

mod logging;
mod metrics;
mod recovery;
mod trace;

/// Everything an interceptor is allowed to see about the call in flight.
///
/// The raw body is exposed on purpose: interceptors run before the envelope
/// is decoded, so observability layers keep working even for messages the
/// processor will classify as poison.
#[derive(Clone, Copy)]
pub struct ConsumeContext<'a> {
    /// The queue this delivery came from.
    pub queue_name: &'a str,
    /// The raw delivery body, undecoded.
    pub body: &'a [u8],
    /// The cancellation scope of the generation this delivery was received
    /// under.
    pub cancellation: &'a CancellationToken,
}

/// Wrap the terminal consume call with logic executed before and after it.
#[async_trait::async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Handle the call, invoking `next` to proceed down the chain.
    ///
    /// Not invoking `next` short-circuits the remaining interceptors and
    /// the terminal itself.
    async fn intercept<'a>(
        &'a self,
        cx: ConsumeContext<'a>,
        next: Next<'a>,
    ) -> Result<(), ConsumeError>;
}

/// The innermost stage of the chain: the per-delivery processing logic.
#[async_trait::async_trait]
pub trait Terminal: Send + Sync {
    async fn call(&self, cx: ConsumeContext<'_>) -> Result<(), ConsumeError>;
}

/// The remainder of the interceptor chain, including the terminal call.
#[allow(missing_debug_implementations)]
pub struct Next<'a> {
    terminal: &'a dyn Terminal,
    interceptors: &'a [Arc<dyn Interceptor>],
}

impl<'a> Next<'a> {
    /// Asynchronously execute the remaining chain.
    pub async fn run(mut self, cx: ConsumeContext<'_>) -> Result<(), ConsumeError> {
        // If there is at least one interceptor left, pop it off the slice and
        // let it drive the rest of the chain, recursively. Once the slice is
        // empty it is the terminal's turn.
        if let Some((current, rest)) = self.interceptors.split_first() {
            self.interceptors = rest;
            current.intercept(cx, self).await
        } else {
            self.terminal.call(cx).await
        }
    }
}

/// An ordered, composable list of interceptors with no hidden state.
///
/// The chain is built once at listener construction and shared by every
/// queue worker; running it allocates nothing.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    /// The default stack, outermost first: panic containment, trace
    /// propagation, metrics, error logging.
    pub fn standard(sink: Arc<dyn crate::metrics::MetricsSink>) -> Self {
        Self::new(vec![
            Arc::new(Recovery),
            Arc::new(Trace),
            Arc::new(Metrics::new(sink)),
            Arc::new(Logging),
        ])
    }

    /// Append an interceptor as the new innermost wrapper.
    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run the whole chain around `terminal` for one delivery.
    pub async fn run(
        &self,
        cx: ConsumeContext<'_>,
        terminal: &dyn Terminal,
    ) -> Result<(), ConsumeError> {
        Next {
            terminal,
            interceptors: &self.interceptors,
        }
        .run(cx)
        .await
    }
}

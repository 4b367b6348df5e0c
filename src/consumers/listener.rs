//! The listener: connection state, lifecycle and the builder used to
//! assemble one.
use crate::configuration::ConsumerSetConfig;
use crate::consumers::handler::ConsumeHandler;
use crate::consumers::in_flight::InFlight;
use crate::error::ConnectError;
use crate::interceptors::{Interceptor, InterceptorChain};
use crate::metrics::{MetricsSink, RecorderSink};
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const CLOSE_OK: u16 = 200;

/// Everything tied to one broker connection.
///
/// The whole struct is swapped out on reconnect: a new generation gets a
/// fresh cancellation token, a fresh worker tracker and a bumped id so that
/// close notifications from the old connection can be recognized as stale.
pub(crate) struct ConnectionState {
    pub(crate) connection: Option<lapin::Connection>,
    pub(crate) channel: Option<lapin::Channel>,
    pub(crate) generation: CancellationToken,
    pub(crate) generation_id: u64,
    pub(crate) workers: TaskTracker,
}

pub(crate) struct ListenerInner {
    pub(crate) config: ConsumerSetConfig,
    pub(crate) handler: Arc<dyn ConsumeHandler>,
    pub(crate) interceptors: InterceptorChain,
    pub(crate) in_flight: InFlight,
    /// Cancelled exactly once, by [`RabbitListener::stop`]. Generation tokens
    /// are children of this one, so a shutdown cancels them all.
    pub(crate) root: CancellationToken,
    /// Cancelled once shutdown has fully completed, including the drain.
    pub(crate) terminated: CancellationToken,
    pub(crate) state: Mutex<ConnectionState>,
    pub(crate) close_tx: mpsc::UnboundedSender<u64>,
}

/// A supervised RabbitMQ consumer over a set of queues.
///
/// Building a listener dials the broker (a hard failure if the bounded retry
/// budget runs out) and starts the supervision task; [`start`](Self::start)
/// then launches the queue workers and blocks until
/// [`stop`](Self::stop) completes from another task.
///
/// ```rust,no_run
/// use warren::{ClosureHandler, RabbitListener};
/// use warren::configuration::ConsumerSetConfig;
///
/// async fn handle(payload: &[u8]) -> Result<(), anyhow::Error> {
///     println!("{}", String::from_utf8_lossy(payload));
///     Ok(())
/// }
///
/// async fn run(config: ConsumerSetConfig) -> Result<(), anyhow::Error> {
///     let listener = RabbitListener::builder(config, ClosureHandler(handle))
///         .build()
///         .await?;
///     listener.run_until_sigterm().await
/// }
/// ```
#[derive(Clone)]
pub struct RabbitListener {
    inner: Arc<ListenerInner>,
}

impl RabbitListener {
    pub fn builder<Handler: ConsumeHandler>(
        config: ConsumerSetConfig,
        handler: Handler,
    ) -> RabbitListenerBuilder {
        RabbitListenerBuilder {
            config,
            handler: Arc::new(handler),
            interceptors: None,
            extra_interceptors: Vec::new(),
            metrics_sink: Arc::new(RecorderSink),
        }
    }

    /// Launch the queue workers and wait until the listener has fully
    /// stopped.
    pub async fn start(&self) {
        {
            let state = self.inner.state.lock().await;
            self.inner.spawn_workers(&state);
        }
        self.inner.terminated.cancelled().await;
    }

    /// Shut the listener down: stop the workers, drain in-flight deliveries
    /// within the drain timeout, then close the channel and connection.
    ///
    /// Idempotent. A second caller waits for the first shutdown to finish.
    pub async fn stop(&self) {
        if self.inner.root.is_cancelled() {
            self.inner.terminated.cancelled().await;
            return;
        }

        tracing::info!("shutting down RabbitMQ listener");
        // Cancelling the root token also cancels the current generation's
        // token (a child) and stops the supervision task, so no reconnect
        // can race with this teardown.
        self.inner.root.cancel();

        let mut state = self.inner.state.lock().await;
        self.inner.drain(&state).await;
        if let Some(channel) = state.channel.take() {
            let _ = channel.close(CLOSE_OK, "shutting down").await;
        }
        if let Some(connection) = state.connection.take() {
            let _ = connection.close(CLOSE_OK, "shutting down").await;
        }
        tracing::info!("RabbitMQ listener stopped");

        self.inner.terminated.cancel();
    }

    /// Run the listener until the process receives a SIGTERM, then shut down
    /// gracefully.
    pub async fn run_until_sigterm(self) -> Result<(), anyhow::Error> {
        self.run_until_shutdown(ShutdownHandler::sigterm()?).await
    }

    /// Run the listener until `shutdown` fires, then shut down gracefully.
    pub async fn run_until_shutdown(
        self,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<(), anyhow::Error> {
        tokio::select! {
            _ = self.start() => {}
            _ = shutdown.wait_for_signal() => {
                self.stop().await;
            }
        }
        Ok(())
    }
}

/// Assembles a [`RabbitListener`].
///
/// The default interceptor stack (panic recovery, trace propagation, metrics,
/// error logging) is always installed; extra interceptors are appended after
/// it, so they run closest to the message handler.
pub struct RabbitListenerBuilder {
    config: ConsumerSetConfig,
    handler: Arc<dyn ConsumeHandler>,
    interceptors: Option<InterceptorChain>,
    extra_interceptors: Vec<Arc<dyn Interceptor>>,
    metrics_sink: Arc<dyn MetricsSink>,
}

impl RabbitListenerBuilder {
    /// Replace the default metrics sink (the global `metrics` recorder).
    pub fn with_metrics_sink<Sink: MetricsSink>(mut self, sink: Sink) -> Self {
        self.metrics_sink = Arc::new(sink);
        self
    }

    /// Append an interceptor after the default stack.
    pub fn with_interceptor<I: Interceptor>(self, interceptor: I) -> Self {
        self.with_dyn_interceptor(Arc::new(interceptor))
    }

    pub fn with_dyn_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.extra_interceptors.push(interceptor);
        self
    }

    /// Replace the default interceptor stack entirely. The chain runs in
    /// order, outermost first; extra interceptors are still appended.
    pub fn with_interceptor_chain(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = Some(interceptors);
        self
    }

    /// Connect to the broker and start the supervision task.
    ///
    /// Startup connectivity is a hard failure: if the broker cannot be
    /// reached within the bounded retry budget no listener is returned.
    pub async fn build(self) -> Result<RabbitListener, ConnectError> {
        let Self {
            config,
            handler,
            interceptors,
            extra_interceptors,
            metrics_sink,
        } = self;

        let mut interceptors =
            interceptors.unwrap_or_else(|| InterceptorChain::standard(metrics_sink));
        for interceptor in extra_interceptors {
            interceptors.push(interceptor);
        }

        let root = CancellationToken::new();
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ListenerInner {
            handler,
            interceptors,
            in_flight: InFlight::default(),
            terminated: CancellationToken::new(),
            state: Mutex::new(ConnectionState {
                connection: None,
                channel: None,
                generation: root.child_token(),
                generation_id: 0,
                workers: TaskTracker::new(),
            }),
            close_tx,
            root,
            config,
        });

        {
            let mut state = inner.state.lock().await;
            inner.connect_locked(&mut state).await?;
        }
        tokio::spawn(ListenerInner::supervise(Arc::clone(&inner), close_rx));

        Ok(RabbitListener { inner })
    }
}

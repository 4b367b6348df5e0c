//! Connection supervision: bounded-retry connect, close-notification
//! watching and generation-swapping reconnect.
use crate::consumers::listener::{ConnectionState, ListenerInner};
use crate::consumers::worker::run_queue_worker;
use crate::error::ConnectError;
use anyhow::Context;
use lapin::options::BasicQosOptions;
use lapin::uri::AMQPUri;
use lapin::ConnectionProperties;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

/// How long workers and in-flight deliveries are given to finish before a
/// reconnect or shutdown proceeds without them.
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Flat delay between reconnect attempts after a mid-life connection loss.
/// Deliberately unbounded in count: this is a background service.
const RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Fallback dial timeout when the settings leave it unspecified.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_OK: u16 = 200;

impl ListenerInner {
    /// Establish a connection and an open, QoS-configured channel, retrying
    /// each step up to the configured bounded budget.
    ///
    /// On exhaustion everything is closed again and `state` is left without
    /// a connection/channel pair, signaling that no generation may start.
    #[tracing::instrument(name = "rabbitmq_connect", skip_all)]
    pub(crate) async fn connect_locked(
        &self,
        state: &mut ConnectionState,
    ) -> Result<(), ConnectError> {
        let uri = self.config.rabbit.amqp_uri();
        let connection_timeout = self
            .config
            .rabbit
            .connection_timeout()
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT);
        let max_attempts = self.config.connect_max_retries.max(1);
        let retry_delay = self.config.connect_retry_delay();

        let mut attempts = 0;
        let connection = loop {
            // Every suspension point observes the root token so a shutdown
            // issued mid-outage never waits out the full retry budget.
            let dialed = tokio::select! {
                biased;
                _ = self.root.cancelled() => return Err(ConnectError::Aborted),
                dialed = dial(&uri, connection_timeout) => dialed,
            };
            match dialed {
                Ok(connection) => {
                    tracing::info!("connected to RabbitMQ");
                    break connection;
                }
                Err(error) => {
                    attempts += 1;
                    tracing::error!(
                        error = %error,
                        attempt = attempts,
                        max_attempts,
                        "failed to connect to RabbitMQ"
                    );
                    if attempts >= max_attempts {
                        return Err(ConnectError::Connection {
                            attempts,
                            source: error,
                        });
                    }
                    tokio::select! {
                        _ = self.root.cancelled() => return Err(ConnectError::Aborted),
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        };

        // The close notification is the sole trigger for reconnection;
        // application-level errors never close the connection. Tag the
        // notification with the generation so stale ones can be dropped.
        let generation_id = state.generation_id;
        let close_tx = self.close_tx.clone();
        connection.on_error(move |error| {
            tracing::error!(error = %error, "RabbitMQ connection closed");
            let _ = close_tx.send(generation_id);
        });

        let qos = &self.config.qos;
        let mut attempts = 0;
        let channel = loop {
            // A QoS failure counts as a channel failure: both are retried
            // together so a worker can never start on a channel without
            // prefetch applied.
            let opened = match connection.create_channel().await {
                Ok(channel) => channel
                    .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
                    .await
                    .map(|()| channel),
                Err(error) => Err(error),
            };
            match opened {
                Ok(channel) => {
                    tracing::info!(
                        prefetch_count = qos.prefetch_count,
                        global = qos.global,
                        "channel open, QoS applied"
                    );
                    break channel;
                }
                Err(error) => {
                    attempts += 1;
                    tracing::error!(
                        error = %error,
                        attempt = attempts,
                        max_attempts,
                        "failed to open a channel"
                    );
                    if attempts >= max_attempts {
                        let _ = connection.close(CLOSE_OK, "channel setup failed").await;
                        return Err(ConnectError::Channel {
                            attempts,
                            source: error,
                        });
                    }
                    tokio::select! {
                        _ = self.root.cancelled() => {
                            let _ = connection.close(CLOSE_OK, "shutting down").await;
                            return Err(ConnectError::Aborted);
                        }
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        };

        state.connection = Some(connection);
        state.channel = Some(channel);
        Ok(())
    }

    /// Tear down the current generation and bring up a new one.
    ///
    /// Serialized by the state lock so concurrent close notifications cannot
    /// launch overlapping reconnect sequences.
    pub(crate) async fn reconnect(self: &Arc<Self>) -> Result<(), ConnectError> {
        let mut state = self.state.lock().await;

        // stop() may have won the race for this lock. Everything is already
        // torn down in that case; dialing again would resurrect a connection
        // nothing will ever close.
        if self.root.is_cancelled() {
            tracing::debug!("shutdown in progress, abandoning reconnect");
            return Ok(());
        }

        state.generation.cancel();
        self.drain(&state).await;

        // Channel and connection are nulled together so workers can never be
        // attached to a channel whose connection is gone.
        if let Some(channel) = state.channel.take() {
            let _ = channel.close(CLOSE_OK, "reconnecting").await;
        }
        if let Some(connection) = state.connection.take() {
            let _ = connection.close(CLOSE_OK, "reconnecting").await;
        }

        state.generation = self.root.child_token();
        state.generation_id += 1;
        state.workers = TaskTracker::new();

        self.connect_locked(&mut state).await?;
        self.spawn_workers(&state);
        tracing::info!("reconnected to RabbitMQ");
        Ok(())
    }

    /// Wait for the current generation's workers and in-flight deliveries to
    /// finish, bounded by [`DRAIN_TIMEOUT`]. Best effort: on timeout the
    /// caller proceeds anyway.
    pub(crate) async fn drain(&self, state: &ConnectionState) {
        state.workers.close();
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            state.workers.wait().await;
            self.in_flight.wait_idle().await;
        })
        .await;
        match drained {
            Ok(()) => tracing::info!("all workers and in-flight deliveries finished"),
            Err(_) => tracing::warn!(
                in_flight = self.in_flight.active(),
                "drain timed out, proceeding anyway"
            ),
        }
    }

    /// Start one queue worker per configured queue under the current
    /// generation. Workers read the channel they were started with and never
    /// swap it; on reconnect they are replaced wholesale.
    pub(crate) fn spawn_workers(self: &Arc<Self>, state: &ConnectionState) {
        let Some(channel) = state.channel.as_ref() else {
            return;
        };
        for queue in &self.config.queues {
            state.workers.spawn(run_queue_worker(
                Arc::clone(self),
                channel.clone(),
                queue.clone(),
                state.generation.clone(),
            ));
        }
    }

    /// Background task observing close notifications and driving reconnects
    /// until the listener shuts down.
    ///
    /// Mid-life connection loss is retried forever with a flat delay; only a
    /// shutdown stops the loop.
    pub(crate) async fn supervise(self: Arc<Self>, mut close_rx: mpsc::UnboundedReceiver<u64>) {
        loop {
            let generation_id = tokio::select! {
                _ = self.root.cancelled() => return,
                event = close_rx.recv() => match event {
                    Some(generation_id) => generation_id,
                    None => return,
                },
            };

            {
                let state = self.state.lock().await;
                if generation_id != state.generation_id {
                    tracing::debug!(
                        stale = generation_id,
                        current = state.generation_id,
                        "ignoring stale close notification"
                    );
                    continue;
                }
            }

            tracing::info!("attempting to reconnect");
            loop {
                match self.reconnect().await {
                    Ok(()) => break,
                    Err(ConnectError::Aborted) => return,
                    Err(error) => {
                        tracing::error!(error = %error, "reconnect failed, retrying");
                        tokio::select! {
                            _ = self.root.cancelled() => return,
                            _ = tokio::time::sleep(RECONNECT_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }
    }
}

async fn dial(uri: &AMQPUri, timeout: Duration) -> Result<lapin::Connection, anyhow::Error> {
    let properties =
        ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
    match tokio::time::timeout(
        timeout,
        lapin::Connection::connect_uri(uri.clone(), properties),
    )
    .await
    {
        Ok(outcome) => outcome.context("Failed to connect to RabbitMQ."),
        Err(_) => Err(anyhow::anyhow!(
            "Timed out while trying to connect to RabbitMQ."
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::ConsumerSetConfig;
    use crate::consumers::handler::ConsumeHandler;
    use crate::consumers::in_flight::InFlight;
    use crate::interceptors::InterceptorChain;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl ConsumeHandler for NoopHandler {
        async fn consume(&self, _payload: &[u8]) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    /// An inner pointed at a closed port, so any dial attempt fails fast.
    fn unreachable_inner() -> (Arc<ListenerInner>, mpsc::UnboundedReceiver<u64>) {
        let config: ConsumerSetConfig = serde_json::from_value(serde_json::json!({
            "rabbit": {
                "uri": "127.0.0.1",
                "vhost": "/",
                "username": "guest",
                "password": "guest",
                "port": 1,
                "connection_timeout_seconds": 1
            },
            "queues": [{ "name": "orders" }],
            "connect_max_retries": 1
        }))
        .unwrap();

        let root = CancellationToken::new();
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ListenerInner {
            handler: Arc::new(NoopHandler),
            interceptors: InterceptorChain::default(),
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
        (inner, close_rx)
    }

    // A close notification can lose the state-lock race to stop(). Once
    // shutdown has torn everything down, the late reconnect must not dial
    // again or start a new generation.
    #[tokio::test]
    async fn reconnect_is_abandoned_once_shutdown_has_started() {
        let (inner, _close_rx) = unreachable_inner();
        inner.root.cancel();

        inner.reconnect().await.unwrap();

        let state = inner.state.lock().await;
        assert!(state.connection.is_none());
        assert_eq!(state.generation_id, 0);
    }

    #[tokio::test]
    async fn connect_attempts_abort_on_shutdown() {
        let (inner, _close_rx) = unreachable_inner();
        inner.root.cancel();

        let mut state = inner.state.lock().await;
        let outcome = inner.connect_locked(&mut state).await;

        assert!(matches!(outcome, Err(ConnectError::Aborted)));
        assert!(state.connection.is_none());
    }
}

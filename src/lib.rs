//! `warren` is a resilient RabbitMQ consumer framework, built on top of
//! [`lapin`](https://crates.io/crates/lapin).
//!
//! It keeps a broker connection alive across failures, dispatches deliveries
//! through a configurable interceptor pipeline and implements a
//! header-encoded retry/requeue policy with an orderly, timeout-bounded
//! shutdown.
//!
//! [`RabbitListener`](crate::consumers::RabbitListener) is the best starting
//! point to learn what `warren` provides and how to leverage it.

pub mod configuration;
pub mod consumers;
pub mod envelope;
pub mod error;
pub mod interceptors;
pub mod metrics;

pub use consumers::{ClosureHandler, ConsumeHandler, RabbitListener, RabbitListenerBuilder};
pub use envelope::Envelope;
pub use error::{ConnectError, ConsumeError};

//! Facilities to consume messages from RabbitMq queues. Check out
//! [`RabbitListener`] as a starting point.
pub use handler::{AsyncConsumeClosure, ClosureHandler, ConsumeHandler};
pub use listener::{RabbitListener, RabbitListenerBuilder};
pub use retry::RETRY_COUNT_HEADER;

mod handler;
mod in_flight;
mod listener;
mod processor;
mod retry;
mod supervisor;
mod worker;

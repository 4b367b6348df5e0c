//! The `ConsumeHandler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use std::future::Future;

/// Implementers of `ConsumeHandler` process the application payload of
/// messages retrieved from a queue.
///
/// # Scope
///
/// `consume` does not get access to the underlying RabbitMq channel or the
/// delivery itself. The framework takes care of acking, dropping or
/// republishing the message with the broker according to the outcome of
/// processing. This decouples the low-level interactions with the broker and
/// the retry logic from the actual business logic of a message.
///
/// # Implementors
///
/// While you can implement `ConsumeHandler` for a struct or enum, most of
/// the time you will rely on the blanket support for async functions with a
/// matching signature via [`ClosureHandler`].
#[async_trait::async_trait]
pub trait ConsumeHandler: Send + Sync + 'static {
    async fn consume(&self, payload: &[u8]) -> Result<(), anyhow::Error>;
}

/// Implement the [`ConsumeHandler`] trait for all boxed handlers.
///
/// E.g. `Box<dyn ConsumeHandler>`.
#[async_trait::async_trait]
impl<H> ConsumeHandler for Box<H>
where
    H: ConsumeHandler + ?Sized,
{
    async fn consume(&self, payload: &[u8]) -> Result<(), anyhow::Error> {
        H::consume(self, payload).await
    }
}

/// `AsyncConsumeClosure` is implemented for all functions of the form:
/// ```ignore
/// async fn(payload: &[u8]) -> Result<(), impl Into<anyhow::Error>>;
/// ```
///
/// When combined with the [`ClosureHandler`] type, you get a
/// [`ConsumeHandler`] that can be passed to the listener builder.
pub trait AsyncConsumeClosure<'a>: Send + Sync + 'static {
    type Output: Future<Output = Result<(), Self::Err>> + Send + 'a;
    type Err: Into<anyhow::Error> + 'static;
    fn call(&'a self, payload: &'a [u8]) -> Self::Output;
}

/// Implement `AsyncConsumeClosure` for all functions that match the required signature.
impl<'a, F, Fut, Err> AsyncConsumeClosure<'a> for F
where
    F: Send + Sync + 'static,
    F: Fn(&'a [u8]) -> Fut,
    Fut: Future<Output = Result<(), Err>> + Send + 'a,
    Err: Into<anyhow::Error> + 'static,
{
    type Output = Fut;
    type Err = Err;

    fn call(&'a self, payload: &'a [u8]) -> Self::Output {
        // `self`, in this case, is a function, which we are calling on its
        // argument using parenthesis notation - self(_)
        (self)(payload)
    }
}

/// Wrapper type to turn an [`AsyncConsumeClosure`] into a [`ConsumeHandler`].
pub struct ClosureHandler<H>(pub H);

/// Handlers are not required to return `anyhow::Error` directly - it is
/// enough for them to return an error type that can be converted into it.
#[async_trait::async_trait]
impl<F> ConsumeHandler for ClosureHandler<F>
where
    F: for<'a> AsyncConsumeClosure<'a>,
{
    async fn consume(&self, payload: &[u8]) -> Result<(), anyhow::Error> {
        self.0.call(payload).await.map_err(Into::into)
    }
}

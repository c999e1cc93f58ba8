//! Handler abstraction for subscribed queues.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use relq_core::{HandlerError, HandlerResult};

/// Processes the `data` of one delivered package.
///
/// Returning an error hands the package to the retry state machine; see
/// [`HandlerError::unretryable`] to skip retries.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, data: JsonValue) -> HandlerResult;
}

/// Adapts an async closure taking the raw JSON payload.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, data: JsonValue) -> HandlerResult {
        (self.0)(data).await
    }
}

/// Adapts an async closure taking a typed payload.
///
/// A payload that does not deserialize into `T` will never succeed, so it
/// fails as unretryable.
pub struct TypedHandler<T, F> {
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> TypedHandler<T, F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Handler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, data: JsonValue) -> HandlerResult {
        let payload: T = serde_json::from_value(data).map_err(|e| {
            HandlerError::unretryable(format!("payload does not match handler type: {e}"))
        })?;
        (self.handler)(payload).await
    }
}

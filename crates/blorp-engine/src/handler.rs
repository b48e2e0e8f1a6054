use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ConnectionContext;
use crate::reply::Reply;

pub type HandlerResult = anyhow::Result<Reply>;

/// Application code invoked for a routed event.
///
/// Any async closure `Fn(ConnectionContext, Value) -> impl Future<Output = HandlerResult>`
/// is a handler.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: ConnectionContext, data: Value) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(ConnectionContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: ConnectionContext, data: Value) -> HandlerResult {
        (self)(ctx, data).await
    }
}

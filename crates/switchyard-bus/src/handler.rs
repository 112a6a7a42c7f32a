use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use switchyard_core::{Message, SwitchyardResult};

/// A subscriber callback invoked once per delivered message.
///
/// Errors are logged and counted by the bus; they never affect delivery to
/// other handlers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Arc<Message>) -> SwitchyardResult<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SwitchyardResult<()>> + Send + 'static,
{
    async fn handle(&self, message: Arc<Message>) -> SwitchyardResult<()> {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SwitchyardResult<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

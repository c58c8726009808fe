//! Run and stop callback traits

use std::future::Future;

use async_trait::async_trait;
use eyre::Result;

/// One iteration of work driven by a `TaskRunner`
#[async_trait]
pub trait RunCallback: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// Cleanup invoked once when a `TaskRunner` loop ends
#[async_trait]
pub trait StopCallback: Send + Sync {
    async fn stop(&self) -> Result<()>;
}

/// Adapts an async closure into a run or stop callback
pub struct FnTask<F> {
    f: F,
}

/// Wrap an async closure as a callback
pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    FnTask { f }
}

#[async_trait]
impl<F, Fut> RunCallback for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self) -> Result<()> {
        (self.f)().await
    }
}

#[async_trait]
impl<F, Fut> StopCallback for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn stop(&self) -> Result<()> {
        (self.f)().await
    }
}

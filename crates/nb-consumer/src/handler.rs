//! Message handler seam
//!
//! User code implements [`EventHandler`] (or wraps an async function in
//! [`FnHandler`]). Handler errors never escape the dispatcher; they
//! drive the retry/DLQ branch.

use async_trait::async_trait;
use nb_common::Envelope;
use std::future::Future;

/// User message handler, invoked inline on the dispatch task. Must not
/// block the loop beyond the broker's heartbeat window.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

/// Adapter turning an async function into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self.f)(envelope).await
    }
}

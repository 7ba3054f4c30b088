use crate::{error::SourceError, tick::{SourceId, Tick}};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Lazy sequence of [`Tick`]s from one upstream connection. Ends (or yields a terminal
/// [`SourceError`]) when the connection is lost.
pub type TickStream = BoxStream<'static, Result<Tick, SourceError>>;

/// Upstream market data provider as seen by the engine.
///
/// Implementations only need to produce [`Tick`]s. Reconnection, backoff and health tracking
/// are handled by [`run_source`](crate::supervisor::run_source).
#[async_trait]
pub trait TickSource: Send {
    fn source_id(&self) -> &SourceId;

    /// Establish a new connection and return its [`TickStream`].
    async fn connect(&mut self) -> Result<TickStream, SourceError>;

    /// Release any resources held by the current connection. Must be safe to call when not
    /// connected.
    async fn disconnect(&mut self);
}

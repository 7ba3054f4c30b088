use super::{ConnectionSupervisor, ReconnectAction, TimeoutStream};
use crate::{
    pipeline::PipelineEvent,
    source::{TickSource, TickStream},
    tick::SourceId,
};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

enum Session {
    /// The connection ended. `established` if it delivered at least one tick.
    Ended { established: bool },
    Shutdown,
    PipelineClosed,
}

/// Drive one [`TickSource`] for the lifetime of the process.
///
/// Ticks and [`SourceHealth`](super::SourceHealth) changes are forwarded to the aggregation
/// pipeline in order. Connection failures never escape: they are absorbed by the
/// [`ConnectionSupervisor`]. Returns once `shutdown` changes (or its sender is dropped), or
/// once the pipeline stops receiving.
pub async fn run_source<Source>(
    mut source: Source,
    mut supervisor: ConnectionSupervisor,
    events: mpsc::Sender<PipelineEvent>,
    mut shutdown: watch::Receiver<bool>,
) where
    Source: TickSource,
{
    let source_id = source.source_id().clone();
    info!(source = %source_id, "starting tick source");

    if !send_health(&events, &supervisor).await {
        return;
    }

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let connection = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            connection = source.connect() => connection,
        };

        let action = match connection {
            Err(error) => {
                warn!(source = %source_id, %error, "failed to connect");
                supervisor.on_attempt_failed()
            }
            Ok(stream) => {
                let session =
                    forward_ticks(&source_id, stream, &mut supervisor, &events, &mut shutdown)
                        .await;
                source.disconnect().await;

                match session {
                    Session::Shutdown => break,
                    Session::PipelineClosed => return,
                    Session::Ended { established: true } => supervisor.on_disconnect(),
                    Session::Ended { established: false } => {
                        warn!(source = %source_id, "connection ended before the first tick");
                        supervisor.on_attempt_failed()
                    }
                }
            }
        };

        if !send_health(&events, &supervisor).await {
            return;
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(action.delay()) => {}
        }

        if let ReconnectAction::CoolDown(_) = action {
            supervisor.on_cool_down_elapsed();
            if !send_health(&events, &supervisor).await {
                return;
            }
        }
    }

    info!(source = %source_id, "tick source stopped");
}

async fn forward_ticks(
    source_id: &SourceId,
    stream: TickStream,
    supervisor: &mut ConnectionSupervisor,
    events: &mpsc::Sender<PipelineEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Session {
    let mut stream = TimeoutStream::new(stream, supervisor.heartbeat_timeout());
    let mut established = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => return Session::Shutdown,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(tick)) => {
                if !established {
                    established = true;
                    supervisor.on_established(Utc::now());
                    if !send_health(events, supervisor).await {
                        return Session::PipelineClosed;
                    }
                }
                if events.send(PipelineEvent::Tick(tick)).await.is_err() {
                    return Session::PipelineClosed;
                }
            }
            Some(Err(error)) if error.is_terminal() => {
                warn!(source = %source_id, %error, "dropping connection");
                return Session::Ended { established };
            }
            Some(Err(error)) => {
                debug!(source = %source_id, %error, "skipping unusable payload");
            }
            None => {
                info!(source = %source_id, "tick stream ended");
                return Session::Ended { established };
            }
        }
    }
}

async fn send_health(
    events: &mpsc::Sender<PipelineEvent>,
    supervisor: &ConnectionSupervisor,
) -> bool {
    events
        .send(PipelineEvent::Health(supervisor.health().clone()))
        .await
        .is_ok()
}

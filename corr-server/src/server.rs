use chrono::Utc;
use corr_engine::{BroadcastHub, Subscription};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Accept viewer WebSocket connections until `shutdown` changes.
pub async fn serve(
    listener: TcpListener,
    hub: BroadcastHub,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                info!(%peer_addr, "new viewer connection");
                tokio::spawn(handle_viewer(stream, peer_addr, hub.clone()));
            }
            Err(error) => {
                warn!(%error, "failed to accept viewer connection");
            }
        }
    }

    info!("viewer server stopped accepting connections");
}

/// Stream [`ViewerUpdate`](corr_engine::ViewerUpdate)s from the viewer's own [`Subscription`].
///
/// The subscription is dropped as soon as either direction of the connection ends.
async fn handle_viewer(stream: TcpStream, peer_addr: SocketAddr, hub: BroadcastHub) {
    let websocket = match accept_async(stream).await {
        Ok(websocket) => websocket,
        Err(error) => {
            error!(%peer_addr, %error, "viewer handshake failed");
            return;
        }
    };

    let (mut sink, mut stream) = websocket.split();

    let welcome = serde_json::json!({
        "type": "welcome",
        "message": "Connected to corr-server correlation feed",
        "timestamp": Utc::now(),
    });
    if sink.send(Message::Text(welcome.to_string().into())).await.is_err() {
        return;
    }

    let mut subscription = hub.subscribe();
    debug!(%peer_addr, viewers = hub.subscriber_count(), "viewer subscribed");

    let mut send_task = tokio::spawn(async move {
        forward_updates(&mut subscription, &mut sink, peer_addr).await;
        let _ = sink.close().await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    debug!(%peer_addr, text = text.as_str(), "ignoring viewer message");
                }
                Err(error) => {
                    debug!(%peer_addr, %error, "viewer connection error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(%peer_addr, "viewer disconnected");
}

async fn forward_updates<Sink>(
    subscription: &mut Subscription,
    sink: &mut Sink,
    peer_addr: SocketAddr,
) where
    Sink: futures::Sink<Message> + Unpin,
{
    while let Some(update) = subscription.recv().await {
        let json = match serde_json::to_string(&update) {
            Ok(json) => json,
            Err(error) => {
                error!(%peer_addr, %error, "failed to serialise viewer update");
                continue;
            }
        };

        if sink.send(Message::Text(json.into())).await.is_err() {
            debug!(%peer_addr, "viewer send failed");
            return;
        }
    }

    info!(%peer_addr, "broadcast hub closed");
}

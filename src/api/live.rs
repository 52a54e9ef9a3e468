//! Live rule tests over WebSocket.
//!
//! The client sends the test request as its first text frame and then only
//! listens. Envelopes are forwarded as they are produced; closing the socket
//! closes the live channel, which kills the engine. The server closes the
//! socket once the run has settled.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use super::routes::TestRequest;
use super::state::AppState;
use crate::ruletest::{LiveChannel, StreamEvent};

pub async fn test_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let (sender, receiver) = socket.split();
    live_session(sender, receiver, state).await;
}

/// Serve one live test over a split socket.
async fn live_session<S, R, E>(mut sender: S, mut receiver: R, state: AppState)
where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Send + 'static,
{
    let request = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break TestRequest::parse(text.as_str().as_bytes()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                debug!("live test socket closed before a request arrived");
                return;
            }
            Some(Ok(_)) => continue,
        }
    };

    let (rule, options) = match request {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "invalid live test request");
            let _ = sender.send(Message::Text(e.to_string().into())).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let (channel, mut outbound) = LiveChannel::new();
    let close = channel.close_token();

    // Forward envelopes until every channel handle is gone, then close.
    let writer_close = close.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                writer_close.cancel();
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    // Anything but a close frame is ignored.
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
        close.cancel();
    });

    let notify = channel.clone();
    if let Err(e) = state.tester.test_rule(&rule, &options, Some(channel)).await {
        notify.send(&StreamEvent::Progress(e.to_string()));
    }
    drop(notify);
    info!("live test settled, closing socket");

    if let Err(e) = writer.await {
        warn!(error = %e, "live test writer task failed");
    }
    reader.abort();
}

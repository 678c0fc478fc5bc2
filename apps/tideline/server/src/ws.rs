use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tideline_core::{is_identity_key, ConnectionRequest, SignalMessage, WindowContext};
use tracing::{debug, info, warn};

use crate::state::AppState;

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let request = connection_request(query, &headers);
    match state.pipeline.build(&request) {
        Ok(context) => ws
            .on_upgrade(move |socket| handle_connection(socket, state, context))
            .into_response(),
        Err(err) => {
            counter!("tideline_connections_rejected_total", 1, "step" => err.step);
            warn!(error = %err, "websocket connection rejected");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

fn connection_request(query: Vec<(String, String)>, headers: &HeaderMap) -> ConnectionRequest {
    let request = query
        .into_iter()
        .fold(ConnectionRequest::new(), |request, (key, value)| {
            request.with_query(key, value)
        });
    headers.iter().fold(request, |request, (name, value)| match value.to_str() {
        Ok(value) => request.with_header(name.as_str(), value),
        Err(_) => request,
    })
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, context: WindowContext) {
    if let Err(err) = serve_connection(socket, state, context).await {
        warn!("connection ended with error: {err:?}");
    }
}

async fn serve_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    context: WindowContext,
) -> Result<()> {
    let Some(connection_id) = context.connection_id().cloned() else {
        anyhow::bail!("context pipeline produced no connection id");
    };

    // Application topics written for this window before the socket opened
    // are kept. Identity keys always come from this socket's own context.
    let topics = state.dispatcher.topics();
    let subscribed: Vec<String> = topics
        .topics_for(&connection_id)
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|key| !is_identity_key(key))
        .collect();
    topics
        .set_topics(&connection_id, context.user_id(), &subscribed, state.topic_ttl)
        .await;
    let context = context.with_topics(subscribed);

    let registration = state.multiplexer.open(&connection_id, context.user_id());
    let generation = registration.generation;
    let mut rx = registration.receiver;
    info!(
        connection_id = %connection_id,
        user_id = ?context.user_id(),
        active_connections = registration.active_connections,
        "connection open"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer_connection = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %writer_connection, "writer task finished");
    });

    while let Some(frame) = ws_rx.next().await {
        state.multiplexer.record_activity(&connection_id);
        match frame {
            Ok(Message::Close(frame)) => {
                info!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(Message::Text(text)) => {
                topics.touch(&connection_id).await;
                handle_inbound(&state, &context, text.as_bytes()).await;
            }
            Ok(Message::Binary(bytes)) => {
                topics.touch(&connection_id).await;
                handle_inbound(&state, &context, &bytes).await;
            }
            Ok(_) => topics.touch(&connection_id).await,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving message");
                break;
            }
        }
    }

    state.multiplexer.close(&connection_id, generation).await;
    counter!("tideline_connections_closed_total", 1);
    writer.abort();
    info!(connection_id = %connection_id, "connection closed");
    Ok(())
}

async fn handle_inbound(state: &AppState, context: &WindowContext, payload: &[u8]) {
    let message = match SignalMessage::decode_slice(payload) {
        Ok(message) => message,
        Err(err) => {
            debug!(error = %err, "ignoring frame without a signal");
            return;
        }
    };
    counter!("tideline_client_signals_total", 1);
    let signal = message.signal;
    match state
        .dispatcher
        .trigger_from_client(context, &signal, message.opts)
        .await
    {
        Ok(report) => debug!(
            signal = %signal,
            signal_id = %report.signal_id,
            enqueued = report.enqueued,
            denied = report.denied,
            "client signal dispatched"
        ),
        Err(err) => warn!(signal = %signal, error = %err, "client signal rejected"),
    }
}

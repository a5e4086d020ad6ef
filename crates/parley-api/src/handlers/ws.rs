//! WebSocket transport
//!
//! One socket per connected entity. Outbound engine events are forwarded as
//! `{"event": ..., "data": ...}` frames; client frames drive the session
//! lifecycle. Closing the socket hands the connection back to the engine,
//! which decides after a grace period whether the entity's sessions end.

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::{Message, MessageStream, Session as WsSession};
use futures::StreamExt;
use parley_core::models::{InteractionKind, OutboundEvent, Participant, Role};
use parley_core::AppError;
use parley_services::{ChannelHandle, EventReceiver, SessionManager, SessionRequest};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Connection parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub entity_id: String,
    pub role: Role,
}

/// Client to server frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Ping,
    RequestSession {
        target_id: String,
        kind: InteractionKind,
    },
    AcceptSession {
        session_id: Uuid,
    },
    RejectSession {
        session_id: Uuid,
    },
    EndSession {
        session_id: Uuid,
    },
}

/// Who is on the other end of the socket
#[derive(Debug, Clone)]
struct Identity {
    entity_id: String,
    role: Role,
}

impl Identity {
    fn counterpart_role(&self) -> Role {
        match self.role {
            Role::Requester => Role::Expert,
            Role::Expert => Role::Requester,
        }
    }
}

/// WebSocket connection handler
///
/// GET /ws?entityId=...&role=requester|expert
pub async fn ws_handler(
    req: HttpRequest,
    body: web::Payload,
    query: web::Query<WsQuery>,
    manager: web::Data<SessionManager>,
) -> Result<HttpResponse, actix_web::Error> {
    let WsQuery { entity_id, role } = query.into_inner();
    if entity_id.trim().is_empty() {
        return Err(AppError::Validation("entityId is required".to_string()).into());
    }

    let (response, session, msg_stream) = actix_ws::handle(&req, body)?;

    let (channel, events) = ChannelHandle::open();
    let connection_id = channel.connection_id();
    manager.on_connect(&entity_id, channel);

    info!(entity_id = %entity_id, connection_id = %connection_id, "WebSocket connection established");

    let identity = Identity { entity_id, role };
    let manager = manager.into_inner();
    actix_web::rt::spawn(async move {
        ws_session(session, msg_stream, events, manager, identity, connection_id).await;
    });

    Ok(response)
}

/// Handle one socket until either side goes away
async fn ws_session(
    mut session: WsSession,
    mut msg_stream: MessageStream,
    mut events: EventReceiver,
    manager: Arc<SessionManager>,
    identity: Identity,
    connection_id: Uuid,
) {
    let mut ping_interval = interval(PING_INTERVAL);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    info!(entity_id = %identity.entity_id, "Channel superseded by a newer connection");
                    break;
                };
                if send_event(&mut session, &event).await.is_err() {
                    warn!(entity_id = %identity.entity_id, "Failed to forward event, closing connection");
                    break;
                }
            }

            msg = msg_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(&manager, &identity, &text).await {
                            if send_event(&mut session, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(reason))) => {
                        info!(entity_id = %identity.entity_id, "Client closed connection: {:?}", reason);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(entity_id = %identity.entity_id, "WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if session.ping(b"").await.is_err() {
                    warn!(entity_id = %identity.entity_id, "Failed to send ping, closing connection");
                    break;
                }
            }
        }
    }

    drop(events);
    manager.on_disconnect(connection_id);
    info!(entity_id = %identity.entity_id, "WebSocket connection closed");
    let _ = session.close(None).await;
}

async fn send_event(session: &mut WsSession, event: &OutboundEvent) -> Result<(), actix_ws::Closed> {
    match serde_json::to_string(event) {
        Ok(json) => session.text(json).await,
        Err(e) => {
            error!("Failed to serialize {}: {}", event.name(), e);
            Ok(())
        }
    }
}

/// Run one client frame; returns a direct reply when there is one
///
/// Lifecycle results reach the socket as engine events, so only pings and
/// failures are answered here.
async fn handle_client_message(
    manager: &Arc<SessionManager>,
    identity: &Identity,
    text: &str,
) -> Option<OutboundEvent> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(entity_id = %identity.entity_id, "Unparseable client frame: {}", e);
            return Some(OutboundEvent::Error {
                message: format!("invalid message: {}", e),
            });
        }
    };

    let result = match message {
        ClientMessage::Ping => return Some(OutboundEvent::Pong),
        ClientMessage::RequestSession { target_id, kind } => manager
            .initiate(SessionRequest {
                initiator: Participant::new(identity.entity_id.clone(), identity.role),
                target: Participant::new(target_id, identity.counterpart_role()),
                kind,
            })
            .await
            .map(|_| ()),
        ClientMessage::AcceptSession { session_id } => manager
            .accept(session_id, &identity.entity_id)
            .await
            .map(|_| ()),
        ClientMessage::RejectSession { session_id } => manager
            .reject(session_id, &identity.entity_id)
            .await
            .map(|_| ()),
        ClientMessage::EndSession { session_id } => manager
            .end_by(session_id, &identity.entity_id)
            .await
            .map(|_| ()),
    };

    result.err().map(|e| {
        debug!(entity_id = %identity.entity_id, "Client request failed: {}", e);
        OutboundEvent::Error {
            message: e.to_string(),
        }
    })
}

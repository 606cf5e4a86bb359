use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error};

use leadflow_core::{Action, Scope, permission};

use super::api::SharedState;
use super::auth::Identity;
use super::models::{Lead, MonthlyIncentive};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    LeadCreated { lead: Lead },
    LeadUpdated { lead: Lead },
    LeadDeleted { lead_id: i64, sales_rep_id: i64 },
    IncentiveCalculated { incentive: MonthlyIncentive },
    IncentiveApproved { incentive: MonthlyIncentive },
    IncentiveRejected { incentive: MonthlyIncentive },
    IncentivePaid { incentive: MonthlyIncentive },
}

impl WsMessage {
    /// The user the event is about: a lead's sales rep or an incentive's earner.
    fn owner_id(&self) -> i64 {
        match self {
            Self::LeadCreated { lead } | Self::LeadUpdated { lead } => lead.sales_rep_id,
            Self::LeadDeleted { sales_rep_id, .. } => *sales_rep_id,
            Self::IncentiveCalculated { incentive }
            | Self::IncentiveApproved { incentive }
            | Self::IncentiveRejected { incentive }
            | Self::IncentivePaid { incentive } => incentive.user_id,
        }
    }

    /// Permission a subscriber needs to see this event.
    fn required_action(&self) -> Action {
        match self {
            Self::LeadCreated { .. } | Self::LeadUpdated { .. } | Self::LeadDeleted { .. } => {
                Action::ViewLeads
            }
            _ => Action::ViewIncentives,
        }
    }
}

/// A serialized event together with who may see it.
#[derive(Debug, Clone)]
pub struct OrgEvent {
    pub organization_id: i64,
    pub owner_id: i64,
    pub action: Action,
    pub payload: String,
}

pub type EventSender = broadcast::Sender<OrgEvent>;

impl OrgEvent {
    /// Whether `identity` may receive this event.
    pub fn visible_to(&self, identity: &Identity) -> bool {
        if identity.organization_id != self.organization_id {
            return false;
        }
        match permission(identity.role, self.action) {
            Some(Scope::Own) => identity.user_id == self.owner_id,
            Some(Scope::Org | Scope::Global) => true,
            None => false,
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    identity: Identity,
) -> impl IntoResponse {
    let rx = state.events.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, identity))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<OrgEvent>, identity: Identity) {
    debug!(user_id = identity.user_id, "websocket connected");
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, identity).await;
    debug!(user_id = identity.user_id, "websocket closed");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards broadcast events the subscriber may see, drains client frames,
/// and pings periodically. If no Pong arrives within [`PONG_TIMEOUT`] after a
/// Ping, the connection is treated as dead.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<OrgEvent>,
    identity: Identity,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !event.visible_to(&identity) {
                            continue;
                        }
                        if sender.send(Message::Text(event.payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "websocket subscriber lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to subscribers of its organization.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &EventSender, organization_id: i64, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(payload) => {
            let _ = tx.send(OrgEvent {
                organization_id,
                owner_id: msg.owner_id(),
                action: msg.required_action(),
                payload,
            });
        }
        Err(e) => {
            error!(error = %e, "failed to serialize WsMessage");
        }
    }
}

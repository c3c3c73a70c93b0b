use axum::{
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::{ApiError, SharedState};
use super::auth::{Visibility, bearer_token, resolve_token};
use super::lifecycle::TimerAction;
use super::models::*;
use super::presence::PresenceRegistry;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    ActivityCreated {
        activity: Activity,
    },
    ActivityUpdated {
        activity: Activity,
    },
    ActivityDeleted {
        activity_id: i64,
    },
    ActivityStatusChanged {
        activity: Activity,
        from: ActivityStatus,
        action: TimerAction,
        user_id: i64,
    },
    TimeAdjusted {
        activity: Activity,
        adjustment: TimeAdjustment,
    },
    /// `subtask` is `None` once the subtask has been deleted.
    SubtaskChanged {
        activity_id: i64,
        subtask_id: i64,
        subtask: Option<Subtask>,
    },
    FeedEvent {
        entry: FeedEntry,
    },
    PresenceChanged {
        online: Vec<PresenceEntry>,
    },
    /// `project` is `None` once the project has been deleted.
    ProjectChanged {
        project_id: i64,
        project: Option<Project>,
    },
    /// `sector` is `None` once the sector has been deleted.
    SectorChanged {
        sector_id: i64,
        sector: Option<Sector>,
    },
    /// `plant` is `None` once the plant has been deleted.
    PlantChanged {
        plant_id: i64,
        plant: Option<Plant>,
    },
    /// Users are deactivated, never deleted.
    UserChanged {
        user: User,
    },
}

/// Who may receive a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum Audience {
    Everyone,
    Sector(i64),
    /// Same rule as reading the activity: its sector, assignee and creator.
    Activity {
        sector_id: Option<i64>,
        user_ids: Vec<i64>,
    },
}

impl Audience {
    pub fn for_activity(activity: &Activity) -> Self {
        let mut user_ids = vec![activity.created_by];
        if let Some(assignee) = activity.assignee_id {
            if assignee != activity.created_by {
                user_ids.push(assignee);
            }
        }
        Self::Activity {
            sector_id: activity.sector_id,
            user_ids,
        }
    }

    /// Same rule as reading a user: admins, the user and their sector.
    pub fn for_user(user: &User) -> Self {
        Self::Activity {
            sector_id: user.sector_id,
            user_ids: vec![user.id],
        }
    }

    pub fn for_sector(sector_id: Option<i64>) -> Self {
        match sector_id {
            Some(id) => Self::Sector(id),
            None => Self::Everyone,
        }
    }

    pub fn includes(&self, viewer: &Visibility) -> bool {
        match (self, viewer) {
            (Self::Everyone, _) | (_, Visibility::All) => true,
            (Self::Sector(id), vis) => vis.sees_sector(Some(*id)),
            (
                Self::Activity {
                    sector_id,
                    user_ids,
                },
                Visibility::Scoped {
                    sector_id: own,
                    user_id,
                },
            ) => (own.is_some() && sector_id == own) || user_ids.contains(user_id),
        }
    }
}

/// What an envelope carries to each socket.
#[derive(Debug, Clone, PartialEq)]
pub enum WsPayload {
    /// A serialized [`WsMessage`], the same for every recipient.
    Text(String),
    /// The online set changed. Each socket renders `PresenceChanged` with
    /// only the entries its viewer may see.
    Presence,
}

/// A broadcast tagged with its audience.
#[derive(Debug, Clone)]
pub struct WsEnvelope {
    pub audience: Audience,
    pub payload: WsPayload,
}

impl WsEnvelope {
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            WsPayload::Text(text) => Some(text.as_str()),
            WsPayload::Presence => None,
        }
    }

    /// The frame to send to `viewer`, or `None` if it is not for them.
    pub fn render(&self, viewer: &Visibility, presence: &PresenceRegistry) -> Option<String> {
        if !self.audience.includes(viewer) {
            return None;
        }
        match &self.payload {
            WsPayload::Text(text) => Some(text.clone()),
            WsPayload::Presence => {
                let msg = WsMessage::PresenceChanged {
                    online: presence.visible_to(viewer),
                };
                serde_json::to_string(&msg)
                    .map_err(|e| tracing::warn!(error = %e, "Failed to serialize presence"))
                    .ok()
            }
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// `GET /ws?token=...`. Browsers cannot set headers on a WebSocket, so the
/// token may come in the query string; a bearer header also works.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = query
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| ApiError::Unauthorized("Missing token".into()))?;
    let user = resolve_token(&state, token).await?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, user))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: SharedState, user: User) {
    let (sender, receiver) = socket.split();
    let rx = state.ws_tx.subscribe();

    tracing::debug!(user_id = user.id, "WebSocket connected");
    connect(&state, &user);

    run_socket_loop(
        sender,
        receiver,
        rx,
        Visibility::for_user(&user),
        &state.presence,
    )
    .await;

    disconnect(&state, user.id);
    tracing::debug!(user_id = user.id, "WebSocket disconnected");
}

/// Register a socket; announces presence only when the user comes online.
fn connect(state: &SharedState, user: &User) {
    if state.presence.join(user, Utc::now()) {
        publish_presence(state);
    }
}

/// Drop a socket; announces presence only when the user's last one closes.
fn disconnect(state: &SharedState, user_id: i64) {
    if state.presence.leave(user_id) {
        publish_presence(state);
    }
}

fn publish_presence(state: &SharedState) {
    let _ = state.ws_tx.send(WsEnvelope {
        audience: Audience::Everyone,
        payload: WsPayload::Presence,
    });
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards broadcasts the viewer may see, answers nothing from the client
/// except Pong bookkeeping, and exits once no Pong arrives within
/// [`PONG_TIMEOUT`] of a Ping.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<WsEnvelope>,
    viewer: Visibility,
    presence: &PresenceRegistry,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(envelope) => {
                        let Some(frame) = envelope.render(&viewer, presence) else {
                            continue;
                        };
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "WebSocket client lagging; messages dropped");
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

/// Serialize and broadcast a WsMessage. No receivers is not an error.
pub fn broadcast_message(tx: &broadcast::Sender<WsEnvelope>, audience: Audience, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(text) => {
            let _ = tx.send(WsEnvelope {
                audience,
                payload: WsPayload::Text(text),
            });
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize WsMessage");
        }
    }
}

/// Broadcast an activity-scoped message.
pub fn broadcast_activity(tx: &broadcast::Sender<WsEnvelope>, activity: &Activity, msg: &WsMessage) {
    broadcast_message(tx, Audience::for_activity(activity), msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::api::test_support::test_app;

    fn activity(sector_id: Option<i64>, assignee_id: Option<i64>, created_by: i64) -> Activity {
        Activity {
            id: 3,
            title: "Swap bearings".into(),
            description: String::new(),
            status: ActivityStatus::InProgress,
            priority: Priority::High,
            sector_id,
            plant_id: None,
            project_id: None,
            assignee_id,
            created_by,
            total_seconds: 0,
            running_since: Some("2024-05-06T08:00:00Z".into()),
            due_date: None,
            completed_at: None,
            created_at: "2024-05-06T07:00:00Z".into(),
            updated_at: "2024-05-06T08:00:00Z".into(),
        }
    }

    fn scoped(sector_id: Option<i64>, user_id: i64) -> Visibility {
        Visibility::Scoped { sector_id, user_id }
    }

    #[test]
    fn test_status_changed_serialization() {
        let msg = WsMessage::ActivityStatusChanged {
            activity: activity(Some(1), Some(2), 2),
            from: ActivityStatus::Paused,
            action: TimerAction::Start,
            user_id: 2,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ActivityStatusChanged");
        assert_eq!(json["data"]["from"], "paused");
        assert_eq!(json["data"]["action"], "start");
        assert_eq!(json["data"]["activity"]["status"], "in_progress");
    }

    #[test]
    fn test_deleted_subtask_serializes_null() {
        let msg = WsMessage::SubtaskChanged {
            activity_id: 3,
            subtask_id: 9,
            subtask: None,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "SubtaskChanged");
        assert!(json["data"]["subtask"].is_null());
    }

    #[test]
    fn test_message_roundtrip_deserialization() {
        let msg = WsMessage::ActivityDeleted { activity_id: 42 };
        let json = serde_json::to_string(&msg).unwrap();
        match serde_json::from_str::<WsMessage>(&json).unwrap() {
            WsMessage::ActivityDeleted { activity_id } => assert_eq!(activity_id, 42),
            other => panic!("Expected ActivityDeleted, got {:?}", other),
        }
    }

    #[test]
    fn test_activity_audience_matches_read_rules() {
        let audience = Audience::for_activity(&activity(Some(1), Some(7), 9));
        assert!(audience.includes(&Visibility::All));
        assert!(audience.includes(&scoped(Some(1), 100)));
        assert!(audience.includes(&scoped(Some(2), 7)));
        assert!(audience.includes(&scoped(None, 9)));
        assert!(!audience.includes(&scoped(Some(2), 100)));
        assert!(!audience.includes(&scoped(None, 100)));
    }

    #[test]
    fn test_sectorless_activity_not_leaked_to_sectorless_viewers() {
        let audience = Audience::for_activity(&activity(None, None, 9));
        assert!(!audience.includes(&scoped(None, 100)));
        assert!(audience.includes(&scoped(None, 9)));
    }

    #[test]
    fn test_user_audience_matches_read_rules() {
        let mut ana = member(7, "Ana", Some(1));
        let audience = Audience::for_user(&ana);
        assert!(audience.includes(&scoped(None, 7)));
        assert!(audience.includes(&scoped(Some(1), 8)));
        assert!(!audience.includes(&scoped(Some(2), 8)));

        ana.sector_id = None;
        assert!(!Audience::for_user(&ana).includes(&scoped(None, 8)));
    }

    #[test]
    fn test_sector_audience() {
        assert_eq!(Audience::for_sector(None), Audience::Everyone);
        let audience = Audience::for_sector(Some(4));
        assert!(audience.includes(&scoped(Some(4), 1)));
        assert!(!audience.includes(&scoped(Some(5), 1)));
        assert!(Audience::Everyone.includes(&scoped(None, 1)));
    }

    #[tokio::test]
    async fn test_broadcast_channel_delivers_to_subscribers() {
        let (tx, _) = broadcast::channel::<WsEnvelope>(16);
        let mut rx1 = tx.subscribe();
        let mut rx2 = tx.subscribe();

        broadcast_message(&tx, Audience::Everyone, &WsMessage::ActivityDeleted { activity_id: 1 });

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();
        assert!(received1.text().unwrap().contains("ActivityDeleted"));
        assert_eq!(received1.payload, received2.payload);
        assert_eq!(received1.audience, Audience::Everyone);
    }

    #[tokio::test]
    async fn test_broadcast_no_receivers_does_not_panic() {
        let (tx, _) = broadcast::channel::<WsEnvelope>(16);
        broadcast_activity(
            &tx,
            &activity(Some(1), None, 1),
            &WsMessage::ActivityDeleted { activity_id: 1 },
        );
    }

    fn member(id: i64, name: &str, sector_id: Option<i64>) -> User {
        User {
            id,
            email: format!("{}@example.com", name.to_lowercase()),
            name: name.to_string(),
            role: Role::Member,
            sector_id,
            active: true,
            password_hash: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn online_names(frame: &str) -> Vec<String> {
        let json: serde_json::Value = serde_json::from_str(frame).unwrap();
        assert_eq!(json["type"], "PresenceChanged");
        json["data"]["online"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_presence_rendered_per_viewer_sector() {
        let app = test_app();
        let mut rx = app.state.ws_tx.subscribe();

        connect(&app.state, &member(1, "Ana", Some(1)));
        connect(&app.state, &member(2, "Bruno", Some(2)));
        connect(&app.state, &member(3, "Carla", None));

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.payload, WsPayload::Presence);
        assert!(envelope.text().is_none());

        let north = envelope
            .render(&scoped(Some(1), 1), &app.state.presence)
            .unwrap();
        assert_eq!(online_names(&north), vec!["Ana", "Carla"]);

        let south = envelope
            .render(&scoped(Some(2), 2), &app.state.presence)
            .unwrap();
        assert_eq!(online_names(&south), vec!["Bruno", "Carla"]);

        let admin = envelope.render(&Visibility::All, &app.state.presence).unwrap();
        assert_eq!(online_names(&admin), vec!["Ana", "Bruno", "Carla"]);
    }

    #[tokio::test]
    async fn test_presence_announced_on_first_join_and_last_leave_only() {
        let app = test_app();
        let mut rx = app.state.ws_tx.subscribe();
        let ana = member(1, "Ana", Some(1));

        connect(&app.state, &ana);
        assert_eq!(rx.try_recv().unwrap().payload, WsPayload::Presence);

        // Second tab
        connect(&app.state, &ana);
        assert!(rx.try_recv().is_err());

        disconnect(&app.state, ana.id);
        assert!(rx.try_recv().is_err());

        disconnect(&app.state, ana.id);
        let envelope = rx.try_recv().unwrap();
        let frame = envelope.render(&scoped(Some(1), 1), &app.state.presence).unwrap();
        assert!(online_names(&frame).is_empty());
    }

    #[test]
    fn test_render_skips_viewers_outside_audience() {
        let presence = PresenceRegistry::new();
        let envelope = WsEnvelope {
            audience: Audience::Sector(4),
            payload: WsPayload::Text("{}".into()),
        };
        assert!(envelope.render(&scoped(Some(5), 1), &presence).is_none());
        assert_eq!(envelope.render(&scoped(Some(4), 1), &presence).as_deref(), Some("{}"));
    }
}

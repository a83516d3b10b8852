use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::models::messages::{
    CellEdit, Frame, PositionUpdate, CELL_EDIT_END, CELL_EDIT_START, CELL_LOCKED, CELL_UNLOCKED,
    PING, USER_DESELECTED, USER_LEFT, USER_POSITION_UPDATE, WELCOME,
};
use crate::ws::hub::{ClientHandle, Hub};
use crate::ws::locks::CellLockInfo;
use crate::ws::{PING_PERIOD, PONG_WAIT, WRITE_WAIT};

/// Drive one upgraded websocket connection until it closes.
///
/// Registers with the hub, writes the welcome frame directly on the socket so
/// it precedes anything the hub queues, then runs the two pumps. Whichever
/// pump exits first takes the other down with it, and the connection leaves
/// through the single detach call at the bottom.
pub async fn run_connection(socket: WebSocket, hub: Arc<Hub>, user: crate::models::UserIdentity) {
    let (mut ws_tx, ws_rx) = socket.split();

    let attached = hub.attach(user).await;
    let handle = attached.handle.clone();

    if !send_welcome(&mut ws_tx, &handle).await {
        hub.detach(handle).await;
        return;
    }

    let mut send_task = tokio::spawn(write_pump(ws_tx, attached.receiver));
    let mut recv_task = tokio::spawn(read_pump(ws_rx, Arc::clone(&hub), handle.clone()));

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        _ = handle.closed() => {
            send_task.abort();
            recv_task.abort();
        }
    }

    hub.detach(handle).await;
}

/// Written straight to the socket, bypassing the send queue, so the frontend
/// can render itself before the hub has processed registration.
async fn send_welcome(ws_tx: &mut SplitSink<WebSocket, Message>, client: &ClientHandle) -> bool {
    let user = client.user();
    let frame = Frame::new(
        WELCOME,
        json!({
            "clientId": client.user_key(),
            "userId": user.user_id,
            "username": user.username,
            "firstname": user.firstname,
            "lastname": user.lastname,
            "color": user.color,
        }),
    );
    let message = match frame.to_json() {
        Ok(message) => message,
        Err(e) => {
            warn!("Failed to serialize welcome for {}: {}", user.username, e);
            return false;
        }
    };

    match timeout(WRITE_WAIT, ws_tx.send(Message::Text(message))).await {
        Ok(Ok(())) => {
            info!(
                "User {} ({} {}) connected via websocket",
                user.username, user.firstname, user.lastname
            );
            true
        }
        _ => {
            warn!("Failed to send welcome to {}", user.username);
            false
        }
    }
}

/// Pump frames from the socket into the hub. Every read runs under the
/// heartbeat deadline, a silent connection falls out here.
async fn read_pump(mut ws_rx: SplitStream<WebSocket>, hub: Arc<Hub>, client: ClientHandle) {
    client.touch();
    loop {
        let message = match timeout(PONG_WAIT, ws_rx.next()).await {
            Err(_) => {
                debug!("Read deadline expired for user {}", client.user().username);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("Websocket error from user {}: {}", client.user().username, e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => process_frame(&hub, &client, &text).await,
            Message::Pong(_) => client.touch(),
            Message::Close(_) => break,
            // Protocol pings are answered by the transport
            _ => {}
        }
    }
}

/// Pump queued frames out to the socket, interleaved with protocol pings.
async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut receiver: mpsc::Receiver<String>,
) {
    let start = tokio::time::Instant::now() + PING_PERIOD;
    let mut ticker = tokio::time::interval_at(start, PING_PERIOD);

    loop {
        tokio::select! {
            maybe = receiver.recv() => {
                match maybe {
                    Some(message) => {
                        match timeout(WRITE_WAIT, ws_tx.send(Message::Text(message))).await {
                            Ok(Ok(())) => {}
                            _ => return,
                        }
                    }
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                match timeout(WRITE_WAIT, ws_tx.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        }
    }
}

/// Dispatch one inbound frame. A frame that fails to parse is logged and
/// ignored, the connection stays open.
pub(crate) async fn process_frame(hub: &Hub, client: &ClientHandle, raw: &str) {
    let frame: Frame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(
                "Could not decode message from user {}: {}",
                client.user().username,
                e
            );
            return;
        }
    };

    match frame.kind.as_str() {
        USER_POSITION_UPDATE => handle_position_update(hub, client, frame.payload).await,
        USER_DESELECTED => handle_deselect(hub, client).await,
        CELL_EDIT_START => handle_cell_edit_start(hub, client, frame.payload).await,
        CELL_EDIT_END => handle_cell_edit_end(hub, client, frame.payload).await,
        // Application-level ping, the protocol heartbeat keeps the connection alive
        PING => {}
        other => debug!(
            "Unhandled message type {} from user {}",
            other,
            client.user().username
        ),
    }
}

async fn handle_position_update(hub: &Hub, client: &ClientHandle, payload: Value) {
    let Ok(update) = serde_json::from_value::<PositionUpdate>(payload) else {
        return;
    };
    if !update.is_valid() {
        return;
    }

    // Presence is keyed by user, shared across every tab
    hub.presence().set(client.user_key(), update.row, update.col);

    let user = client.user();
    hub.broadcast_message(
        USER_POSITION_UPDATE,
        json!({
            "clientId": client.user_key(),
            "row": update.row,
            "col": update.col,
            "userId": user.user_id,
            "username": user.username,
            "firstname": user.firstname,
            "lastname": user.lastname,
            "color": user.color,
        }),
        Some(client.id()),
    )
    .await;
}

async fn handle_deselect(hub: &Hub, client: &ClientHandle) {
    if hub.presence().remove(client.user_key()) {
        hub.broadcast_message(
            USER_LEFT,
            json!({ "clientId": client.user_key() }),
            Some(client.id()),
        )
        .await;
        info!("User {} deselected", client.user().username);
    }
}

async fn handle_cell_edit_start(hub: &Hub, client: &ClientHandle, payload: Value) {
    let Ok(edit) = serde_json::from_value::<CellEdit>(payload) else {
        return;
    };
    let (Some(lock_key), Some(asset_id)) = (edit.lock_key(), edit.asset_id_string()) else {
        return;
    };

    let user = client.user();
    let locked = hub.cell_locks().lock(
        &lock_key,
        CellLockInfo {
            user_id: client.user_key().to_string(),
            asset_id,
            key: edit.key.clone(),
            firstname: user.firstname.clone(),
            lastname: user.lastname.clone(),
            color: user.color.clone(),
        },
    );

    // A cell held by someone else fails without a reply
    if locked {
        hub.broadcast_message(
            CELL_LOCKED,
            json!({
                "assetId": edit.asset_id,
                "key": edit.key,
                "userId": client.user_key(),
                "firstname": user.firstname,
                "lastname": user.lastname,
                "color": user.color,
            }),
            Some(client.id()),
        )
        .await;
    }
}

async fn handle_cell_edit_end(hub: &Hub, client: &ClientHandle, payload: Value) {
    let Ok(edit) = serde_json::from_value::<CellEdit>(payload) else {
        return;
    };
    let Some(lock_key) = edit.lock_key() else {
        return;
    };

    if hub.cell_locks().unlock(&lock_key, client.user_key()) {
        hub.broadcast_message(
            CELL_UNLOCKED,
            json!({ "assetId": edit.asset_id, "key": edit.key }),
            Some(client.id()),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::messages::EXISTING_USERS;
    use crate::models::UserIdentity;
    use crate::ws::hub::{Bridge, HubConfig};
    use std::time::Duration;

    fn identity(user_id: i64, username: &str) -> UserIdentity {
        UserIdentity {
            user_id,
            username: username.to_string(),
            firstname: "Test".to_string(),
            lastname: "User".to_string(),
            color: "#1d4ed8".to_string(),
        }
    }

    fn start_hub() -> Arc<Hub> {
        let (hub, runner) = Hub::new(Bridge::Direct, HubConfig::default());
        tokio::spawn(runner.run());
        hub
    }

    async fn recv_frame(receiver: &mut mpsc::Receiver<String>) -> Frame {
        let raw = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("send channel closed");
        serde_json::from_str(&raw).expect("invalid frame")
    }

    #[tokio::test]
    async fn position_update_enriches_and_fans_out() {
        let hub = start_hub();
        let a = hub.attach(identity(7, "alice")).await;
        let mut b = hub.attach(identity(9, "bob")).await;
        assert_eq!(recv_frame(&mut b.receiver).await.kind, EXISTING_USERS);

        process_frame(
            &hub,
            &a.handle,
            r#"{"type":"USER_POSITION_UPDATE","payload":{"row":3,"col":5}}"#,
        )
        .await;

        let frame = recv_frame(&mut b.receiver).await;
        assert_eq!(frame.kind, USER_POSITION_UPDATE);
        assert_eq!(frame.payload["clientId"], "7");
        assert_eq!(frame.payload["row"], 3);
        assert_eq!(frame.payload["username"], "alice");
        assert_eq!(frame.payload["color"], "#1d4ed8");

        assert!(hub.presence().get("7").is_some());
    }

    #[tokio::test]
    async fn invalid_position_is_dropped_silently() {
        let hub = start_hub();
        let a = hub.attach(identity(7, "alice")).await;
        let mut b = hub.attach(identity(9, "bob")).await;
        assert_eq!(recv_frame(&mut b.receiver).await.kind, EXISTING_USERS);

        process_frame(
            &hub,
            &a.handle,
            r#"{"type":"USER_POSITION_UPDATE","payload":{"row":-1,"col":5}}"#,
        )
        .await;
        process_frame(
            &hub,
            &a.handle,
            r#"{"type":"USER_POSITION_UPDATE","payload":{"row":2}}"#,
        )
        .await;
        process_frame(&hub, &a.handle, "not even json").await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(b.receiver.try_recv().is_err());
        assert!(hub.presence().get("7").is_none());
    }

    #[tokio::test]
    async fn deselect_without_presence_emits_nothing() {
        let hub = start_hub();
        let a = hub.attach(identity(7, "alice")).await;
        let mut b = hub.attach(identity(9, "bob")).await;
        assert_eq!(recv_frame(&mut b.receiver).await.kind, EXISTING_USERS);

        process_frame(&hub, &a.handle, r#"{"type":"USER_DESELECTED"}"#).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(b.receiver.try_recv().is_err());

        // With presence set, deselect announces the departure
        process_frame(
            &hub,
            &a.handle,
            r#"{"type":"USER_POSITION_UPDATE","payload":{"row":1,"col":1}}"#,
        )
        .await;
        assert_eq!(recv_frame(&mut b.receiver).await.kind, USER_POSITION_UPDATE);

        process_frame(&hub, &a.handle, r#"{"type":"USER_DESELECTED"}"#).await;
        let frame = recv_frame(&mut b.receiver).await;
        assert_eq!(frame.kind, USER_LEFT);
        assert_eq!(frame.payload["clientId"], "7");
    }

    #[tokio::test]
    async fn lock_contention_has_one_winner_and_a_silent_loser() {
        let hub = start_hub();
        let a = hub.attach(identity(7, "alice")).await;
        let b = hub.attach(identity(9, "bob")).await;
        let mut observer = hub.attach(identity(11, "carol")).await;
        assert_eq!(recv_frame(&mut observer.receiver).await.kind, EXISTING_USERS);

        process_frame(
            &hub,
            &a.handle,
            r#"{"type":"CELL_EDIT_START","payload":{"assetId":42,"key":"model"}}"#,
        )
        .await;
        process_frame(
            &hub,
            &b.handle,
            r#"{"type":"CELL_EDIT_START","payload":{"assetId":42,"key":"model"}}"#,
        )
        .await;

        let frame = recv_frame(&mut observer.receiver).await;
        assert_eq!(frame.kind, CELL_LOCKED);
        assert_eq!(frame.payload["userId"], "7");
        assert_eq!(frame.payload["assetId"], 42);

        // Bob's failed attempt produced no second frame
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(observer.receiver.try_recv().is_err());
        assert_eq!(hub.cell_locks().snapshot().get("42:model").unwrap().user_id, "7");
    }

    #[tokio::test]
    async fn unlock_by_non_holder_is_silent() {
        let hub = start_hub();
        let a = hub.attach(identity(7, "alice")).await;
        let b = hub.attach(identity(9, "bob")).await;
        let mut observer = hub.attach(identity(11, "carol")).await;
        assert_eq!(recv_frame(&mut observer.receiver).await.kind, EXISTING_USERS);

        process_frame(
            &hub,
            &a.handle,
            r#"{"type":"CELL_EDIT_START","payload":{"assetId":42,"key":"model"}}"#,
        )
        .await;
        assert_eq!(recv_frame(&mut observer.receiver).await.kind, CELL_LOCKED);

        process_frame(
            &hub,
            &b.handle,
            r#"{"type":"CELL_EDIT_END","payload":{"assetId":42,"key":"model"}}"#,
        )
        .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(observer.receiver.try_recv().is_err());

        process_frame(
            &hub,
            &a.handle,
            r#"{"type":"CELL_EDIT_END","payload":{"assetId":42,"key":"model"}}"#,
        )
        .await;
        let frame = recv_frame(&mut observer.receiver).await;
        assert_eq!(frame.kind, CELL_UNLOCKED);
        assert_eq!(frame.payload["assetId"], 42);
        assert_eq!(frame.payload["key"], "model");
        assert!(hub.cell_locks().is_empty());
    }
}

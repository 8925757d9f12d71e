//! Given/when steps for bridge scenarios.

use std::sync::Arc;

use rstest_bdd_macros::{given, when};
use serde_json::json;

use super::StepResult;
use super::state::{BridgeState, BridgeWorld, wait_until};

pub(crate) fn world(bridge_state: &BridgeState) -> StepResult<Arc<BridgeWorld>> {
    bridge_state
        .world
        .get()
        .ok_or_else(|| String::from("bridge should be running"))
}

#[given("a bridge with no enabled bots")]
fn given_bridge_without_bots(bridge_state: &BridgeState) -> StepResult<()> {
    bridge_state.world.set(Arc::new(BridgeWorld::new(&[])?));
    Ok(())
}

#[given("a bridge with enabled bot {id}")]
fn given_bridge_with_bot(bridge_state: &BridgeState, id: String) -> StepResult<()> {
    bridge_state
        .world
        .set(Arc::new(BridgeWorld::new(&[id.as_str()])?));
    Ok(())
}

#[given("bot {id} connects and says hello")]
fn given_bot_connects(bridge_state: &BridgeState, id: String) -> StepResult<()> {
    world(bridge_state)?.connect(&id)
}

#[when("bot {id} connects and says hello")]
fn when_bot_connects(bridge_state: &BridgeState, id: String) -> StepResult<()> {
    world(bridge_state)?.connect(&id)
}

#[when("the host delivers {count} tick events")]
fn when_host_delivers_ticks(bridge_state: &BridgeState, count: u32) -> StepResult<()> {
    let world = world(bridge_state)?;
    for n in 1..=count {
        world
            .server
            .deliver("tick", &json!({ "n": n }))
            .map_err(|e| format!("delivery failed: {e}"))?;
    }
    Ok(())
}

#[when("a chat message {text} arrives in room {room}")]
fn when_chat_arrives(bridge_state: &BridgeState, text: String, room: String) -> StepResult<()> {
    world(bridge_state)?
        .server
        .forward_inbound_event(&room, "alice", &text, false)
        .map_err(|e| format!("forward failed: {e}"))?;
    Ok(())
}

#[when("bot {id} replies {message} to room {room} twice")]
fn when_bot_replies_twice(
    bridge_state: &BridgeState,
    id: String,
    message: String,
    room: String,
) -> StepResult<()> {
    let world = world(bridge_state)?;
    {
        let mut clients = world.clients();
        let client = clients
            .get_mut(&id)
            .ok_or_else(|| format!("bot {id} is not connected"))?;
        let reply = json!({ "type": "reply", "room": room, "message": message }).to_string();
        for line in [reply.as_str(), reply.as_str(), r#"{"type":"toast","message":"sync"}"#] {
            client
                .send(line)
                .map_err(|e| format!("send failed: {e}"))?;
        }
    }

    // The bridge handles a connection's lines in order, so the trailing toast
    // marks both replies as processed.
    let marker = format!("toast {id} sync");
    if wait_until(|| world.effects.snapshot().contains(&marker)) {
        Ok(())
    } else {
        Err(String::from("bridge never processed the replies"))
    }
}

#[when("the host disconnects bot {id}")]
fn when_host_disconnects(bridge_state: &BridgeState, id: String) -> StepResult<()> {
    if world(bridge_state)?.server.disconnect(&id) {
        Ok(())
    } else {
        Err(format!("bot {id} had no connection"))
    }
}

//! Assertion helpers for bridge behavioural tests.

use std::time::Duration;

use rstest_bdd_macros::then;

use super::StepResult;
use super::state::{BridgeState, Read, WAIT};
use super::steps::world;

fn read_from(bridge_state: &BridgeState, id: &str, timeout: Duration) -> StepResult<Read> {
    let world = world(bridge_state)?;
    let mut clients = world.clients();
    let client = clients
        .get_mut(id)
        .ok_or_else(|| format!("bot {id} is not connected"))?;
    Ok(client.read(timeout))
}

#[then("bot {id} receives ticks {first} to {last} in order")]
fn bot_receives_ticks(bridge_state: &BridgeState, id: String, first: u32, last: u32) -> StepResult<()> {
    for n in first..=last {
        let expected = format!(r#"{{"type":"tick","data":{{"n":{n}}}}}"#);
        match read_from(bridge_state, &id, WAIT)? {
            Read::Line(line) if line == expected => {}
            other => return Err(format!("expected {expected}, got {other:?}")),
        }
    }
    Ok(())
}

#[then("no events are pending")]
fn no_events_pending(bridge_state: &BridgeState) -> StepResult<()> {
    let pending = world(bridge_state)?.server.pending_len();
    if pending == 0 {
        Ok(())
    } else {
        Err(format!("{pending} event(s) still pending"))
    }
}

#[then("bot {id} receives the chat message {text}")]
fn bot_receives_chat(bridge_state: &BridgeState, id: String, text: String) -> StepResult<()> {
    match read_from(bridge_state, &id, WAIT)? {
        Read::Line(line)
            if line.starts_with(r#"{"type":"message""#)
                && line.contains(&format!(r#""message":"{text}""#)) =>
        {
            Ok(())
        }
        other => Err(format!("expected chat message {text}, got {other:?}")),
    }
}

#[then("bot {id} receives nothing")]
fn bot_receives_nothing(bridge_state: &BridgeState, id: String) -> StepResult<()> {
    match read_from(bridge_state, &id, Duration::from_millis(200))? {
        Read::Nothing => Ok(()),
        other => Err(format!("expected silence, got {other:?}")),
    }
}

#[then("the host sees {count} reply from {id}")]
fn host_sees_replies(bridge_state: &BridgeState, count: usize, id: String) -> StepResult<()> {
    let prefix = format!("reply {id} ");
    let replies = world(bridge_state)?
        .effects
        .snapshot()
        .iter()
        .filter(|entry| entry.starts_with(&prefix))
        .count();
    if replies == count {
        Ok(())
    } else {
        Err(format!("expected {count} reply effect(s), got {replies}"))
    }
}

#[then("bot {id} sees its connection closed")]
fn bot_sees_closed(bridge_state: &BridgeState, id: String) -> StepResult<()> {
    match read_from(bridge_state, &id, WAIT)? {
        Read::Closed => Ok(()),
        other => Err(format!("expected a closed connection, got {other:?}")),
    }
}

//! Given/when steps for supervision scenarios.

use std::sync::Arc;
use std::time::Duration;

use botbox::supervisor::StopMode;
use rstest_bdd_macros::{given, when};

use super::StepResult;
use super::state::{StartResult, SupervisorState, SupervisorWorld};

pub(crate) fn world(supervisor_state: &SupervisorState) -> StepResult<Arc<SupervisorWorld>> {
    supervisor_state
        .world
        .get()
        .ok_or_else(|| String::from("supervisor should be configured"))
}

#[given("a supervisor allowing {max_tenants} tenants")]
fn given_supervisor(supervisor_state: &SupervisorState, max_tenants: usize) -> StepResult<()> {
    let world = SupervisorWorld::new(max_tenants)
        .map_err(|e| format!("failed to build supervisor: {e}"))?;
    supervisor_state.world.set(Arc::new(world));
    Ok(())
}

#[when("tenant {id} is started")]
fn when_started(supervisor_state: &SupervisorState, id: String) -> StepResult<()> {
    let world = world(supervisor_state)?;
    let result = world.runtime.block_on(world.supervisor.ensure_running(&id));
    supervisor_state.last_start.set(StartResult::from(result));
    Ok(())
}

#[when("tenant {id} is started twice concurrently")]
fn when_started_concurrently(supervisor_state: &SupervisorState, id: String) -> StepResult<()> {
    let world = world(supervisor_state)?;
    let (left, right) = world.runtime.block_on(async {
        tokio::join!(
            world.supervisor.ensure_running(&id),
            world.supervisor.ensure_running(&id),
        )
    });
    supervisor_state
        .concurrent
        .set(vec![StartResult::from(left), StartResult::from(right)]);
    Ok(())
}

#[when("tenant {id} is paused")]
fn when_paused(supervisor_state: &SupervisorState, id: String) -> StepResult<()> {
    let world = world(supervisor_state)?;
    world
        .runtime
        .block_on(world.supervisor.stop(&id, StopMode::Pause))
        .map_err(|e| format!("pause failed: {e}"))?;
    Ok(())
}

#[when("tenant {id} is stopped")]
fn when_stopped(supervisor_state: &SupervisorState, id: String) -> StepResult<()> {
    let world = world(supervisor_state)?;
    world
        .runtime
        .block_on(world.supervisor.stop(&id, StopMode::Disable))
        .map_err(|e| format!("stop failed: {e}"))?;
    Ok(())
}

#[when("tenant {id} has exited")]
fn when_exited(supervisor_state: &SupervisorState, id: String) -> StepResult<()> {
    let world = world(supervisor_state)?;
    for _ in 0..250 {
        if !world.supervisor.executor().is_running(&id) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    Err(format!("tenant {id} is still running"))
}

#[when("enabled tenants are revived")]
fn when_revived(supervisor_state: &SupervisorState) -> StepResult<()> {
    let world = world(supervisor_state)?;
    let starts = world
        .runtime
        .block_on(world.supervisor.revive_enabled())
        .map_err(|e| format!("revival failed: {e}"))?;
    let revived = starts
        .into_iter()
        .map(|start| (start.tenant_id, StartResult::from(start.outcome)))
        .collect();
    supervisor_state.revived.set(revived);
    Ok(())
}

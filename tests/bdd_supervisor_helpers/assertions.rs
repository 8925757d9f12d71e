//! Assertion helpers for supervision behavioural tests.

use botbox::host::TenantFlags;
use botbox::supervisor::StartOutcome;
use rstest_bdd_macros::then;

use super::StepResult;
use super::state::{StartResult, SupervisorState};
use super::steps::world;

fn last_start(supervisor_state: &SupervisorState) -> StepResult<StartResult> {
    supervisor_state
        .last_start
        .get()
        .ok_or_else(|| String::from("a start should have been attempted"))
}

#[then("one start launches the tenant and the other finds it running")]
fn one_start_wins(supervisor_state: &SupervisorState) -> StepResult<()> {
    let mut results = supervisor_state
        .concurrent
        .get()
        .ok_or_else(|| String::from("concurrent starts should have run"))?;
    results.sort_by_key(|result| *result != StartResult::Outcome(StartOutcome::Started));

    let expected = vec![
        StartResult::Outcome(StartOutcome::Started),
        StartResult::Outcome(StartOutcome::AlreadyRunning),
    ];
    if results == expected {
        Ok(())
    } else {
        Err(format!("expected {expected:?}, got {results:?}"))
    }
}

#[then("the start reports the tenant disabled")]
fn start_reports_disabled(supervisor_state: &SupervisorState) -> StepResult<()> {
    match last_start(supervisor_state)? {
        StartResult::Outcome(StartOutcome::Disabled) => Ok(()),
        other => Err(format!("expected Disabled, got {other:?}")),
    }
}

#[then("the start fails with a {kind} error")]
fn start_fails_with(supervisor_state: &SupervisorState, kind: String) -> StepResult<()> {
    match last_start(supervisor_state)? {
        StartResult::Failed(actual) if actual == kind => Ok(()),
        other => Err(format!("expected a {kind} failure, got {other:?}")),
    }
}

#[then("the running tenant count is {count}")]
fn running_count_is(supervisor_state: &SupervisorState, count: usize) -> StepResult<()> {
    let actual = world(supervisor_state)?.supervisor.executor().running_count();
    if actual == count {
        Ok(())
    } else {
        Err(format!("expected {count} running tenant(s), got {actual}"))
    }
}

#[then("the guest was prepared {count} time")]
fn guest_prepared(supervisor_state: &SupervisorState, count: u32) -> StepResult<()> {
    let actual = world(supervisor_state)?.gate.calls();
    if actual == count {
        Ok(())
    } else {
        Err(format!("expected {count} preparation(s), got {actual}"))
    }
}

fn expect_flags(
    supervisor_state: &SupervisorState,
    id: &str,
    expected: TenantFlags,
) -> StepResult<()> {
    let actual = world(supervisor_state)?.flags(id);
    if actual == Some(expected) {
        Ok(())
    } else {
        Err(format!("expected {id} to have {expected:?}, got {actual:?}"))
    }
}

#[then("tenant {id} is disabled")]
fn tenant_is_disabled(supervisor_state: &SupervisorState, id: String) -> StepResult<()> {
    expect_flags(supervisor_state, &id, TenantFlags::DISABLED)
}

#[then("tenant {id} is enabled")]
fn tenant_is_enabled(supervisor_state: &SupervisorState, id: String) -> StepResult<()> {
    expect_flags(
        supervisor_state,
        &id,
        TenantFlags {
            enabled: true,
            auto_start: true,
        },
    )
}

#[then("the error log records a {kind} for {id}")]
fn error_log_records(supervisor_state: &SupervisorState, kind: String, id: String) -> StepResult<()> {
    let log = world(supervisor_state)?.error_log();
    let record = log
        .lines()
        .find(|line| line.contains(&format!(r#""tenantId":"{id}""#)))
        .ok_or_else(|| format!("no record for {id} in {log:?}"))?;
    if record.contains(&format!(r#""kind":"{kind}""#)) {
        Ok(())
    } else {
        Err(format!("expected kind {kind}, got {record}"))
    }
}

fn revival_of(supervisor_state: &SupervisorState, id: &str) -> StepResult<StartResult> {
    let revived = supervisor_state
        .revived
        .get()
        .ok_or_else(|| String::from("a revival should have run"))?;
    revived
        .into_iter()
        .find(|(tenant_id, _)| tenant_id == id)
        .map(|(_, result)| result)
        .ok_or_else(|| format!("tenant {id} was not considered for revival"))
}

#[then("the revival restarted tenant {id}")]
fn revival_restarted(supervisor_state: &SupervisorState, id: String) -> StepResult<()> {
    match revival_of(supervisor_state, &id)? {
        StartResult::Outcome(StartOutcome::Started) => Ok(()),
        other => Err(format!("expected {id} to be started again, got {other:?}")),
    }
}

#[then("the revival left tenant {id} running")]
fn revival_left_running(supervisor_state: &SupervisorState, id: String) -> StepResult<()> {
    match revival_of(supervisor_state, &id)? {
        StartResult::Outcome(StartOutcome::AlreadyRunning) => Ok(()),
        other => Err(format!("expected {id} to be left running, got {other:?}")),
    }
}

#[then("the revival skipped tenant {id}")]
fn revival_skipped(supervisor_state: &SupervisorState, id: String) -> StepResult<()> {
    match supervisor_state.revived.get() {
        Some(revived) if revived.iter().all(|(tenant_id, _)| tenant_id != &id) => Ok(()),
        Some(revived) => Err(format!("expected {id} to be skipped, got {revived:?}")),
        None => Err(String::from("a revival should have run")),
    }
}

//! Integration tests for the connection orchestration flow
//!
//! Drives the orchestrator end to end over simulated tunnels: endpoint
//! selection, entitlement gating, bounded retry, cancellation, teardown
//! timeouts and superseding intents.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio_test::{assert_err, assert_ok};
use veil_core::config::OrchestratorConfig;
use veil_core::error::{ErrorKind, UpgradeFeature, VpnError};
use veil_core::types::{
    AttemptId, ConnectionIntent, Endpoint, Liveness, Profile, ProfileTarget, SelectionMode, Tier,
    UserEntitlement,
};
use veil_core::vpn::simulated::{Outcome, SimulatedTunnelFactory, Teardown};
use veil_core::vpn::{
    ConnectionState, EntitlementSource, Orchestrator, OrchestratorHandle, RetryReason,
    StateChange, StaticDirectory, TunnelStatus,
};

const CANCEL_TIMEOUT_MS: u64 = 150;

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        cancel_timeout_ms: CANCEL_TIMEOUT_MS,
        retry_delay_ms: 10,
        event_buffer: 64,
    }
}

/// Free NL server, plus-tier CH server, secure-core IS-CH server and a
/// free SE server under maintenance
fn test_directory() -> StaticDirectory {
    StaticDirectory::new(vec![
        Endpoint::new("NL#1", "NL", "nl1.example.net", Tier::Free).with_score(2.0),
        Endpoint::new("CH#1", "CH", "ch1.example.net", Tier::Plus).with_score(0.5),
        Endpoint::new("IS-CH#1", "CH", "is-ch1.example.net", Tier::Basic)
            .with_score(3.0)
            .with_secure_core(true),
        Endpoint::new("SE#1", "SE", "se1.example.net", Tier::Free)
            .with_score(0.1)
            .with_status(Liveness::Maintenance),
    ])
    .with_profiles(vec![Profile {
        name: "work".to_string(),
        target: ProfileTarget::Country("nl".to_string()),
    }])
}

fn spawn_with(
    entitlement: impl EntitlementSource,
    tunnels: &SimulatedTunnelFactory,
) -> OrchestratorHandle {
    Orchestrator::new(
        test_config(),
        Arc::new(test_directory()),
        Arc::new(entitlement),
        Arc::new(tunnels.clone()),
    )
    .spawn()
}

fn simulated() -> SimulatedTunnelFactory {
    SimulatedTunnelFactory::new(Duration::from_millis(5))
}

/// Wait until the current transition satisfies `pred`
async fn wait_for(handle: &OrchestratorHandle, pred: impl Fn(&ConnectionState) -> bool) {
    let mut current = handle.watch();
    let reached = tokio::time::timeout(
        Duration::from_secs(2),
        current.wait_for(|change| pred(&change.state)),
    )
    .await
    .is_ok_and(|r| r.is_ok());
    assert!(reached, "state not reached, stuck at {}", handle.state());
}

/// Collect broadcast transitions until `last` has been seen
async fn collect_until(
    events: &mut broadcast::Receiver<StateChange>,
    last: impl Fn(&StateChange) -> bool,
) -> Vec<StateChange> {
    let mut seen = Vec::new();
    loop {
        let change = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for transition")
            .expect("event stream closed");
        let done = last(&change);
        seen.push(change);
        if done {
            return seen;
        }
    }
}

fn states(changes: &[StateChange]) -> Vec<ConnectionState> {
    changes.iter().map(|c| c.state.clone()).collect()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_fastest_prefers_covered_endpoint() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);
    let mut events = handle.subscribe();

    let id = assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);
    let changes = collect_until(&mut events, |c| c.state == ConnectionState::Connected).await;

    assert_eq!(
        states(&changes),
        vec![
            ConnectionState::ResolvingEndpoint,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert!(changes.iter().all(|c| c.attempt == id));
    // CH#1 scores better but needs a plus plan; SE#1 is under maintenance
    assert_eq!(handle.current().endpoint.map(|e| e.id), Some("NL#1".to_string()));
    assert_eq!(tunnels.starts(), 1);
}

#[tokio::test]
async fn test_country_and_profile_resolution() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Plus), &tunnels);

    let intent = ConnectionIntent::new(SelectionMode::Country("ch".to_string()), "country");
    assert_ok!(handle.connect(intent).await);
    wait_for(&handle, |s| *s == ConnectionState::Connected).await;
    assert_eq!(handle.current().endpoint.map(|e| e.id), Some("CH#1".to_string()));

    let intent = ConnectionIntent::new(SelectionMode::Profile("work".to_string()), "profile");
    assert_ok!(handle.connect(intent).await);
    wait_for(&handle, |s| *s == ConnectionState::Connected).await;
    assert_eq!(handle.current().endpoint.map(|e| e.id), Some("NL#1".to_string()));
}

#[tokio::test]
async fn test_unknown_profile_fails_resolution() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    let intent = ConnectionIntent::new(SelectionMode::Profile("home".to_string()), "profile");
    let err = assert_err!(handle.connect(intent).await);

    assert!(matches!(
        err,
        VpnError::Connection(ErrorKind::ResolutionFailed(_))
    ));
    assert!(matches!(
        handle.state(),
        ConnectionState::Error(ErrorKind::ResolutionFailed(_))
    ));
    assert_eq!(tunnels.starts(), 0);
}

#[tokio::test]
async fn test_maintenance_server_never_reaches_tunnel() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Visionary), &tunnels);

    let err = assert_err!(handle.connect(ConnectionIntent::server("SE#1", "pick")).await);

    assert_eq!(err, VpnError::Connection(ErrorKind::ServerUnavailable));
    assert_eq!(
        handle.state(),
        ConnectionState::Error(ErrorKind::ServerUnavailable)
    );
    assert_eq!(tunnels.starts(), 0);
}

#[tokio::test]
async fn test_upgrade_required_for_higher_tier() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    let err = assert_err!(handle.connect(ConnectionIntent::server("CH#1", "pick")).await);

    assert_eq!(
        err,
        VpnError::Connection(ErrorKind::RequiresUpgrade(UpgradeFeature::MultiTier {
            required: Tier::Plus
        }))
    );
    assert_eq!(tunnels.starts(), 0);
}

#[tokio::test]
async fn test_secure_core_requires_plus_before_tier_check() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Basic), &tunnels);

    let err = assert_err!(handle.connect(ConnectionIntent::server("IS-CH#1", "pick")).await);

    assert_eq!(
        err,
        VpnError::Connection(ErrorKind::RequiresUpgrade(UpgradeFeature::SecureRouting))
    );
}

#[tokio::test]
async fn test_unreachable_retries_exactly_once() {
    let tunnels = simulated();
    tunnels.script([Outcome::Unreachable, Outcome::Unreachable]);
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);
    let mut events = handle.subscribe();

    assert_ok!(handle.connect(ConnectionIntent::server("NL#1", "pick")).await);
    let changes = collect_until(&mut events, |c| c.state.is_terminal()).await;

    assert_eq!(
        states(&changes),
        vec![
            ConnectionState::ResolvingEndpoint,
            ConnectionState::Connecting,
            ConnectionState::Retrying(RetryReason::Unreachable),
            ConnectionState::Connecting,
            ConnectionState::Error(ErrorKind::Unreachable),
        ]
    );
    settle().await;
    assert_eq!(tunnels.starts(), 2);
    // The second start is released along with the attempt
    assert_eq!(tunnels.cancels(), 1);
}

#[tokio::test]
async fn test_unreachable_then_connected_on_retry() {
    let tunnels = simulated();
    tunnels.script([Outcome::Unreachable, Outcome::Connect]);
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    let id = assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);
    wait_for(&handle, |s| *s == ConnectionState::Connected).await;

    assert_eq!(handle.current().attempt, id);
    assert_eq!(tunnels.starts(), 2);
}

#[tokio::test]
async fn test_tunnel_fault_is_not_retried() {
    let tunnels = simulated();
    tunnels.script([Outcome::Fail("authentication failed".to_string())]);
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);
    wait_for(&handle, ConnectionState::is_terminal).await;
    settle().await;

    assert_eq!(
        handle.state(),
        ConnectionState::Error(ErrorKind::TunnelFault("authentication failed".to_string()))
    );
    assert_eq!(tunnels.starts(), 1);
    assert_eq!(tunnels.cancels(), 1);
    assert_eq!(tunnels.stops(), 0);
}

#[tokio::test]
async fn test_fault_after_connected_stops_tunnel() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);
    wait_for(&handle, |s| *s == ConnectionState::Connected).await;

    assert!(tunnels.emit(0, TunnelStatus::Failed("tun device lost".to_string())));
    wait_for(&handle, ConnectionState::is_terminal).await;
    assert_eq!(
        handle.state(),
        ConnectionState::Error(ErrorKind::TunnelFault("tun device lost".to_string()))
    );
    assert_eq!(tunnels.stops(), 1);
    assert_eq!(tunnels.cancels(), 0);
}

#[tokio::test]
async fn test_connection_lost_after_connected() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);
    wait_for(&handle, |s| *s == ConnectionState::Connected).await;

    assert!(tunnels.emit(0, TunnelStatus::Disconnected));
    wait_for(&handle, ConnectionState::is_terminal).await;
    assert_eq!(
        handle.state(),
        ConnectionState::Error(ErrorKind::TunnelFault("connection lost".to_string()))
    );
}

#[tokio::test]
async fn test_cancel_suppresses_late_connected() {
    let tunnels = simulated();
    tunnels.script([Outcome::Hang]);
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);
    let mut events = handle.subscribe();

    let id = assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);
    assert_eq!(handle.state(), ConnectionState::Connecting);
    assert_ok!(handle.cancel().await);
    assert_eq!(handle.state(), ConnectionState::Idle);

    // The tunnel finishes anyway: nothing may reach the state machine
    assert!(!tunnels.emit(0, TunnelStatus::Connected));
    settle().await;
    assert_eq!(handle.state(), ConnectionState::Idle);
    assert_eq!(tunnels.cancels(), 1);

    let changes = collect_until(&mut events, |c| c.state == ConnectionState::Idle).await;
    assert_eq!(
        states(&changes),
        vec![
            ConnectionState::ResolvingEndpoint,
            ConnectionState::Connecting,
            ConnectionState::Disconnecting,
            ConnectionState::Idle,
        ]
    );
    assert!(changes.iter().all(|c| c.attempt == id));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_cancel_while_retrying() {
    let tunnels = simulated();
    tunnels.script([Outcome::Unreachable, Outcome::Hang]);
    let handle = Orchestrator::new(
        OrchestratorConfig {
            retry_delay_ms: 500,
            ..test_config()
        },
        Arc::new(test_directory()),
        Arc::new(UserEntitlement::new(Tier::Free)),
        Arc::new(tunnels.clone()),
    )
    .spawn();

    assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);
    wait_for(&handle, |s| matches!(s, ConnectionState::Retrying(_))).await;

    assert_ok!(handle.cancel().await);
    assert_eq!(handle.state(), ConnectionState::Idle);

    // The pending retry timer fires into a finished attempt
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(handle.state(), ConnectionState::Idle);
    assert_eq!(tunnels.starts(), 1);
}

#[tokio::test]
async fn test_unresponsive_teardown_is_bounded() {
    let tunnels = simulated();
    tunnels.script([Outcome::Hang]).set_teardown(Teardown::Unresponsive);
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);

    let started = Instant::now();
    assert_ok!(handle.cancel().await);
    let elapsed = started.elapsed();

    assert_eq!(handle.state(), ConnectionState::Idle);
    assert!(elapsed >= Duration::from_millis(CANCEL_TIMEOUT_MS));
    assert!(elapsed < Duration::from_secs(2));

    // The abandoned session is muted for good
    assert!(!tunnels.emit(0, TunnelStatus::Connected));
    settle().await;
    assert_eq!(handle.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_commands_during_teardown_are_deferred_in_order() {
    let tunnels = simulated();
    tunnels.script([Outcome::Hang]).set_teardown(Teardown::Unresponsive);
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);
    let first = assert_ok!(handle.connect(ConnectionIntent::fastest("first")).await);
    let mut events = handle.subscribe();

    let (cancelled, second) = tokio::join!(
        handle.cancel(),
        handle.connect(ConnectionIntent::fastest("second"))
    );
    assert_ok!(cancelled);
    let second = assert_ok!(second);

    let changes = collect_until(&mut events, |c| c.state == ConnectionState::Connected).await;
    let tagged: Vec<(AttemptId, ConnectionState)> = changes
        .into_iter()
        .map(|c| (c.attempt, c.state))
        .collect();
    assert_eq!(
        tagged,
        vec![
            (first, ConnectionState::Disconnecting),
            (first, ConnectionState::Idle),
            (second, ConnectionState::ResolvingEndpoint),
            (second, ConnectionState::Connecting),
            (second, ConnectionState::Connected),
        ]
    );
}

#[tokio::test]
async fn test_new_intent_supersedes_live_attempt() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Plus), &tunnels);

    let first = assert_ok!(handle.connect(ConnectionIntent::server("NL#1", "first")).await);
    wait_for(&handle, |s| *s == ConnectionState::Connected).await;

    let mut events = handle.subscribe();
    let second = assert_ok!(handle.connect(ConnectionIntent::server("CH#1", "second")).await);
    let changes = collect_until(&mut events, |c| c.state == ConnectionState::Connected).await;

    // Old attempt is fully torn down before the new one shows up
    let first_done = changes
        .iter()
        .position(|c| c.attempt == first && c.state == ConnectionState::Idle)
        .expect("first attempt never went idle");
    let second_begins = changes
        .iter()
        .position(|c| c.attempt == second)
        .expect("second attempt never published");
    assert!(first_done < second_begins);

    // At most one non-terminal attempt at any time
    let mut live: Option<AttemptId> = None;
    for change in &changes {
        if change.state.is_terminal() {
            if live == Some(change.attempt) {
                live = None;
            }
        } else {
            assert!(live.is_none() || live == Some(change.attempt));
            live = Some(change.attempt);
        }
    }

    assert_eq!(tunnels.stops(), 1);
    assert_eq!(handle.current().endpoint.map(|e| e.id), Some("CH#1".to_string()));
}

#[tokio::test]
async fn test_rejected_intent_leaves_live_attempt_alone() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    let live = assert_ok!(handle.connect(ConnectionIntent::server("NL#1", "first")).await);
    wait_for(&handle, |s| *s == ConnectionState::Connected).await;
    let mut events = handle.subscribe();

    let err = assert_err!(handle.connect(ConnectionIntent::server("CH#1", "second")).await);
    assert!(matches!(
        err,
        VpnError::Connection(ErrorKind::RequiresUpgrade(_))
    ));

    // The rejection is reported, tagged with its own attempt
    let change = assert_ok!(events.recv().await);
    assert_ne!(change.attempt, live);
    assert!(matches!(
        change.state,
        ConnectionState::Error(ErrorKind::RequiresUpgrade(_))
    ));

    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(handle.current().attempt, live);
    assert_eq!(tunnels.starts(), 1);
    assert_eq!(tunnels.stops(), 0);
}

#[tokio::test]
async fn test_disconnect_stops_connected_tunnel() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);
    wait_for(&handle, |s| *s == ConnectionState::Connected).await;

    assert_ok!(handle.disconnect().await);
    assert_eq!(handle.state(), ConnectionState::Idle);
    assert_eq!(tunnels.stops(), 1);
    assert_eq!(tunnels.cancels(), 0);
}

#[tokio::test]
async fn test_invalid_commands_are_rejected() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    let err = assert_err!(handle.cancel().await);
    assert_eq!(
        err,
        VpnError::InvalidStateTransition {
            state: "idle".to_string(),
            action: "cancel",
        }
    );
    assert_err!(handle.disconnect().await);

    assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);
    wait_for(&handle, |s| *s == ConnectionState::Connected).await;

    // Connected sessions are disconnected, not cancelled
    let err = assert_err!(handle.cancel().await);
    assert!(matches!(err, VpnError::InvalidStateTransition { action: "cancel", .. }));
    assert_err!(handle.acknowledge().await);
    assert_eq!(handle.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_acknowledge_clears_error() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    assert_err!(handle.connect(ConnectionIntent::server("SE#1", "pick")).await);
    assert_eq!(
        handle.current().error(),
        Some(&ErrorKind::ServerUnavailable)
    );

    assert_ok!(handle.acknowledge().await);
    assert_eq!(handle.state(), ConnectionState::Idle);
    // Acknowledging twice is harmless
    assert_ok!(handle.acknowledge().await);
}

#[tokio::test]
async fn test_entitlement_snapshot_per_intent() {
    let tunnels = simulated();
    let (plan, entitlement) = watch::channel(UserEntitlement::new(Tier::Free));
    let handle = spawn_with(entitlement, &tunnels);

    assert_err!(handle.connect(ConnectionIntent::server("CH#1", "pick")).await);

    // Upgrading takes effect on the next intent
    plan.send_replace(UserEntitlement::new(Tier::Plus));
    tunnels.script([Outcome::Unreachable, Outcome::Connect]);
    assert_ok!(handle.connect(ConnectionIntent::server("CH#1", "pick")).await);

    // A downgrade mid-attempt does not re-gate the retry
    plan.send_replace(UserEntitlement::new(Tier::Free));
    wait_for(&handle, |s| *s == ConnectionState::Connected).await;
    assert_eq!(tunnels.starts(), 2);
}

#[tokio::test]
async fn test_shutdown_tears_down_and_closes() {
    let tunnels = simulated();
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);
    wait_for(&handle, |s| *s == ConnectionState::Connected).await;

    handle.shutdown().await;
    assert_eq!(handle.state(), ConnectionState::Idle);
    assert_eq!(tunnels.stops(), 1);
    assert_eq!(
        handle.connect(ConnectionIntent::fastest("late")).await,
        Err(VpnError::OrchestratorClosed)
    );
}

#[tokio::test]
async fn test_dropping_every_handle_tears_down_attempt() {
    let tunnels = simulated();
    tunnels.script([Outcome::Hang]);
    let handle = spawn_with(UserEntitlement::new(Tier::Free), &tunnels);

    assert_ok!(handle.connect(ConnectionIntent::fastest("quick connect")).await);
    let mut events = handle.subscribe();
    let spare = handle.clone();
    drop(handle);
    settle().await;
    // A clone keeps the orchestrator running
    assert_eq!(spare.state(), ConnectionState::Connecting);

    drop(spare);
    let changes = collect_until(&mut events, |c| c.state == ConnectionState::Idle).await;
    assert_eq!(
        states(&changes),
        vec![ConnectionState::Disconnecting, ConnectionState::Idle]
    );
    assert_eq!(tunnels.cancels(), 1);

    let closed = tokio::time::timeout(Duration::from_secs(2), events.recv()).await;
    assert!(matches!(closed, Ok(Err(broadcast::error::RecvError::Closed))));
}

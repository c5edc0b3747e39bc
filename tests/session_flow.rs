//! End-to-end tests of the session runtime against the simulated adapter.

use std::time::Duration;

use tokio::sync::mpsc;

use ble_session::prelude::*;
use ble_session::simulator::{AdapterCall, Fault};
use ble_session::types::DiscoveryEvent;

const ECHO: &str = "AA:BB";
const HRM: &str = "C0:FF:EE:00:00:01";

/// Generous so that paused-clock tests never hit it before a step deadline.
const WAIT: Duration = Duration::from_secs(120);

async fn wait_for(
    events: &mut mpsc::Receiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => {}
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_phase(phase: SessionPhase) -> impl FnMut(&SessionEvent) -> bool {
    move |e| matches!(e, SessionEvent::PhaseChanged { phase: p, .. } if *p == phase)
}

async fn scanned() -> (mpsc::Receiver<SessionEvent>, SessionHandle, SimulatedAdapter) {
    let (mut events, handle, adapter) =
        BleClient::new(ClientConfig::default()).start_simulated();
    handle.start_scan().await.unwrap();
    for _ in 0..3 {
        wait_for(&mut events, |e| {
            matches!(e, SessionEvent::PeripheralDiscovered { .. })
        })
        .await;
    }
    (events, handle, adapter)
}

#[tokio::test]
async fn scan_connect_and_exchange_data() {
    let (mut events, handle, adapter) = scanned().await;

    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.scan.active);
    assert_eq!(snapshot.peripherals.len(), 3);
    assert_eq!(snapshot.peripherals[0].label(), "echo");
    assert_eq!(snapshot.peripherals[2].label(), "Unknown");

    assert_eq!(handle.connect(ECHO).await, Ok(SessionPhase::Connecting));
    wait_for(&mut events, is_phase(SessionPhase::Ready)).await;

    let (tx, mut received) = mpsc::unbounded_channel();
    handle
        .on_data(move |bytes| {
            let _ = tx.send(bytes.to_vec());
        })
        .await
        .unwrap();
    assert_eq!(handle.toggle_notify().await, Ok(true));

    handle.write([0u8, 7, 2, 52].as_slice()).await.unwrap();
    let echoed = tokio::time::timeout(WAIT, received.recv()).await.unwrap();
    assert_eq!(echoed, Some(vec![0, 7, 2, 52]));
    assert_eq!(handle.read().await.unwrap(), vec![0, 7, 2, 52]);

    // Removing the callback drops it, which closes the channel.
    handle.clear_data_callback().await.unwrap();
    handle.write([9u8].as_slice()).await.unwrap();
    let after = tokio::time::timeout(WAIT, received.recv()).await.unwrap();
    assert_eq!(after, None);

    let snapshot = handle.snapshot().await.unwrap();
    let session = snapshot.session.unwrap();
    assert!(session.notify_enabled);
    assert_eq!(
        snapshot.peripherals[0].connection_state,
        ConnectionState::Connected
    );

    handle.disconnect().await.unwrap();
    assert_eq!(handle.snapshot().await.unwrap().phase, SessionPhase::Idle);
    assert!(adapter.subscriptions().is_empty());
}

#[tokio::test]
async fn commands_outside_ready_are_rejected() {
    let (_events, handle, adapter) = scanned().await;
    adapter.clear_calls();

    assert!(matches!(
        handle.read().await,
        Err(BleError::InvalidState { phase: SessionPhase::Idle, .. })
    ));
    assert!(matches!(
        handle.toggle_notify().await,
        Err(BleError::InvalidState { .. })
    ));
    assert!(matches!(
        handle.disconnect().await,
        Err(BleError::InvalidState { .. })
    ));
    assert!(adapter.calls().is_empty());
}

#[tokio::test]
async fn peripheral_without_target_is_ready_but_unbound() {
    let (mut events, handle, _adapter) = scanned().await;

    handle.connect(HRM).await.unwrap();
    let event = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::TargetNotFound { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::TargetNotFound {
            peripheral_id: HRM.into(),
            uuid: normalize_uuid("ec00"),
        }
    );
    wait_for(&mut events, is_phase(SessionPhase::Ready)).await;
    assert!(matches!(handle.read().await, Err(BleError::NotFound(_))));
}

#[tokio::test]
async fn switching_peripherals_disconnects_the_first() {
    let (mut events, handle, adapter) = scanned().await;
    handle.connect(ECHO).await.unwrap();
    wait_for(&mut events, is_phase(SessionPhase::Ready)).await;
    adapter.clear_calls();

    handle.connect(HRM).await.unwrap();
    let calls = adapter.calls();
    assert_eq!(calls[0], AdapterCall::Disconnect(ECHO.into()));
    assert_eq!(calls[1], AdapterCall::Connect(HRM.into()));

    wait_for(&mut events, is_phase(SessionPhase::Ready)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.peripheral_id.as_deref(), Some(HRM));
    assert_eq!(
        snapshot.peripherals[0].connection_state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn requests_are_served_in_order() {
    let (_events, handle, _adapter) =
        BleClient::new(ClientConfig::default()).start_simulated();

    let (scan, snapshot) = tokio::join!(handle.start_scan(), handle.snapshot());
    scan.unwrap();
    assert!(snapshot.unwrap().scan.active);
}

#[tokio::test]
async fn link_loss_returns_to_idle() {
    let (mut events, handle, adapter) = scanned().await;
    handle.connect(ECHO).await.unwrap();
    wait_for(&mut events, is_phase(SessionPhase::Ready)).await;

    adapter.inject(AdapterEvent::Disconnected {
        peripheral_id: ECHO.into(),
        error: Some("out of range".into()),
    });
    let event = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::Disconnected {
            peripheral_id: ECHO.into(),
            reason: Some("out of range".into()),
        }
    );
    assert_eq!(handle.snapshot().await.unwrap().phase, SessionPhase::Idle);
}

#[tokio::test]
async fn failed_link_surfaces_on_the_event_stream() {
    let (mut events, handle, adapter) = scanned().await;
    adapter.set_fault(Fault::ConnectEvent);

    handle.connect(ECHO).await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, SessionEvent::Failed(_))).await;
    assert!(matches!(event, SessionEvent::Failed(BleError::Connection(_))));
    assert_eq!(handle.snapshot().await.unwrap().phase, SessionPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn unanswered_connect_times_out() {
    let (adapter, adapter_events) = SimulatedAdapter::manual(vec![SimulatedPeripheral::new(
        ECHO,
        Some("echo"),
        -40,
        "ec00",
        "ec0e",
        true,
    )]);
    let (mut events, handle) =
        BleClient::new(ClientConfig::default()).start(adapter.clone(), adapter_events);

    adapter.inject(AdapterEvent::Discovered(DiscoveryEvent::new(ECHO, Some("echo"), -40)));
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PeripheralDiscovered { .. })
    })
    .await;

    let started = tokio::time::Instant::now();
    assert_eq!(handle.connect(ECHO).await, Ok(SessionPhase::Connecting));
    let event = wait_for(&mut events, |e| matches!(e, SessionEvent::Failed(_))).await;

    assert!(started.elapsed() >= Duration::from_secs(15));
    assert!(matches!(
        event,
        SessionEvent::Failed(BleError::Connection(msg)) if msg.contains("timed out")
    ));
    assert_eq!(handle.snapshot().await.unwrap().phase, SessionPhase::Idle);

    // The late answer to the abandoned connect (the runtime's first request)
    // is ignored.
    adapter.inject(AdapterEvent::Connected {
        peripheral_id: ECHO.into(),
        request: 1,
        error: None,
    });
    assert_eq!(handle.snapshot().await.unwrap().phase, SessionPhase::Idle);
}

#[tokio::test]
async fn shutdown_disconnects_and_closes_the_handle() {
    let (mut events, handle, adapter) = scanned().await;
    handle.connect(ECHO).await.unwrap();
    wait_for(&mut events, is_phase(SessionPhase::Ready)).await;

    handle.shutdown().await.unwrap();
    assert!(adapter.calls().contains(&AdapterCall::Disconnect(ECHO.into())));
    assert!(adapter.calls().contains(&AdapterCall::StopScan));
    assert_eq!(handle.snapshot().await.unwrap_err(), BleError::Closed);
    assert!(!handle.is_running());
}

#[tokio::test]
async fn dropping_every_handle_tears_the_session_down() {
    let (mut events, handle, adapter) = scanned().await;
    handle.connect(ECHO).await.unwrap();
    wait_for(&mut events, is_phase(SessionPhase::Ready)).await;

    let clone = handle.clone();
    drop(handle);
    drop(clone);

    tokio::time::timeout(WAIT, async { while events.recv().await.is_some() {} })
        .await
        .unwrap();
    assert!(adapter.calls().contains(&AdapterCall::Disconnect(ECHO.into())));
}

mod common;

use common::*;
use hublink_communication::repl;
use hublink_core::{
    ConnectionError, DeviceEvent, DeviceStatus, TransportKind, NO_COMPATIBLE_SERVICE_MESSAGE,
};
use hublink_settings::ReplSettings;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_usb_connect_initializes_repl() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);

    let outcome = session.connect(TransportKind::Usb).await;

    assert!(outcome.success);
    assert_eq!(outcome.error, None);
    let state = session.device();
    assert_eq!(state.status, DeviceStatus::Connected);
    assert_eq!(state.transport_kind, TransportKind::Usb);
    assert_eq!(state.name.as_deref(), Some("LEGO Technic Large Hub"));
    assert_eq!(state.id.as_deref(), Some("/dev/ttyACM0"));

    let writes = device.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0], vec![0x03, 0x0D, 0x0A]);
    assert_eq!(
        writes[1],
        repl::init_preamble(&ReplSettings::default().preamble_imports)
    );
}

#[tokio::test]
async fn test_connect_walks_through_states() {
    let device = MockDevice::new();
    let session = session_with(vec![
        MockConnector::usb(device.clone()).into_arc(),
        MockConnector::ble(device.clone(), nordic_services()).into_arc(),
    ]);

    let mut events = session.subscribe_events();
    assert!(session.connect(TransportKind::Usb).await.success);
    session.disconnect().await;
    assert!(session.connect(TransportKind::Ble).await.success);

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DeviceEvent::StateChanged(state) = event {
            statuses.push(state.status);
        }
    }

    use DeviceStatus::*;
    assert_eq!(
        statuses,
        vec![
            Requesting,
            ConnectingTransport,
            InitializingRepl,
            Connected,
            Disconnected,
            Requesting,
            ConnectingTransport,
            DiscoveringServices,
            InitializingRepl,
            Connected,
        ]
    );
}

#[tokio::test]
async fn test_init_delay_separates_interrupt_and_preamble() {
    let device = MockDevice::new();
    let repl = ReplSettings {
        init_delay_ms: 50,
        ..ReplSettings::default()
    };
    let session = hublink_communication::DeviceSession::new(
        repl,
        vec![MockConnector::usb(device.clone()).into_arc()],
    );

    let start = tokio::time::Instant::now();
    assert!(session.connect(TransportKind::Usb).await.success);

    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(device.writes().len(), 2);
}

#[tokio::test]
async fn test_writes_are_framed_and_ordered() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);
    assert!(session.connect(TransportKind::Usb).await.success);

    assert!(session.write(b"motor.run(port.A, 500)"));
    assert!(session.write(b"sound.beep()"));
    assert!(session.write(b"print('done')"));
    session.write_and_wait(b"time.sleep_ms(10)").await.unwrap();

    let writes = device.writes();
    assert_eq!(
        &writes[2..],
        &[
            repl::frame(b"motor.run(port.A, 500)"),
            repl::frame(b"sound.beep()"),
            repl::frame(b"print('done')"),
            repl::frame(b"time.sleep_ms(10)"),
        ]
    );
}

#[tokio::test]
async fn test_write_requires_connection() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);

    assert!(!session.write(b"print(1)"));
    assert!(!session.interrupt());
    let err = session.write_and_wait(b"print(1)").await.unwrap_err();
    assert_eq!(err.connection_error(), ConnectionError::NotConnected);
    assert!(device.writes().is_empty());
}

#[tokio::test]
async fn test_interrupt_is_sent_unframed() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);
    assert!(session.connect(TransportKind::Usb).await.success);

    assert!(session.interrupt());
    assert!(eventually(|| device.writes().len() == 3).await);
    assert_eq!(device.writes()[2], repl::interrupt());
}

#[tokio::test]
async fn test_failed_write_reports_failure() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);
    assert!(session.connect(TransportKind::Usb).await.success);

    device.fail_writes();
    assert!(session.write_and_wait(b"print(1)").await.is_err());
    assert_eq!(session.device().status, DeviceStatus::Connected);
}

#[tokio::test]
async fn test_disconnect_twice() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);
    assert!(session.connect(TransportKind::Usb).await.success);

    session.disconnect().await;
    assert_eq!(session.device().status, DeviceStatus::Disconnected);
    assert_eq!(session.device().transport_kind, TransportKind::None);

    session.disconnect().await;
    assert_eq!(session.device().status, DeviceStatus::Disconnected);
    assert_eq!(device.closes(), 1);
    assert!(!session.write(b"print(1)"));
}

#[tokio::test]
async fn test_disconnect_from_idle_is_noop() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);
    let mut events = session.subscribe_events();

    session.disconnect().await;

    assert_eq!(session.device().status, DeviceStatus::Idle);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);

    assert!(session.connect(TransportKind::Usb).await.success);
    session.disconnect().await;
    assert!(session.connect(TransportKind::Usb).await.success);

    assert_eq!(device.opens(), 2);
    assert_eq!(device.closes(), 1);
    assert_eq!(session.device().status, DeviceStatus::Connected);
}

#[tokio::test]
async fn test_no_sink_calls_after_disconnect() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    session.on_notify(move |bytes: &[u8]| {
        counter.fetch_add(bytes.len(), Ordering::SeqCst);
    });

    assert!(session.connect(TransportKind::Usb).await.success);
    assert!(device.send_inbound(b">>> "));
    assert!(eventually(|| received.load(Ordering::SeqCst) == 4).await);

    session.disconnect().await;
    device.send_inbound(b"late output\r\n");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(received.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_last_sink_wins() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let f = first.clone();
    session.on_notify(move |_: &[u8]| {
        f.fetch_add(1, Ordering::SeqCst);
    });
    let s = second.clone();
    session.on_notify(move |_: &[u8]| {
        s.fetch_add(1, Ordering::SeqCst);
    });

    assert!(session.connect(TransportKind::Usb).await.success);
    device.send_inbound(b"hello\r\n");
    assert!(eventually(|| second.load(Ordering::SeqCst) == 1).await);
    assert_eq!(first.load(Ordering::SeqCst), 0);

    session.clear_notify();
    device.send_inbound(b"ignored\r\n");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sink_panic_keeps_loop_running() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    session.on_notify(move |_: &[u8]| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("sink failure");
        }
    });

    assert!(session.connect(TransportKind::Usb).await.success);
    device.send_inbound(b"first");
    device.send_inbound(b"second");

    assert!(eventually(|| calls.load(Ordering::SeqCst) == 2).await);
    assert_eq!(session.device().status, DeviceStatus::Connected);
}

#[tokio::test]
async fn test_usb_cancellation_returns_to_idle() {
    let device = MockDevice::new();
    let connector = MockConnector::usb(device.clone()).failing_request(ConnectionError::UserCancelled);
    let session = session_with(vec![connector.into_arc()]);

    let outcome = session.connect(TransportKind::Usb).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error, None);
    assert!(outcome.is_cancellation);
    let state = session.device();
    assert_eq!(state.status, DeviceStatus::Idle);
    assert_eq!(state.error, None);
    assert_eq!(device.opens(), 0);
}

#[tokio::test]
async fn test_ble_without_known_services_fails() {
    let device = MockDevice::new();
    let session = session_with(vec![
        MockConnector::ble(device.clone(), unknown_services()).into_arc(),
    ]);
    let mut events = session.subscribe_events();

    let outcome = session.connect(TransportKind::Ble).await;

    assert!(!outcome.success);
    assert!(!outcome.is_cancellation);
    assert_eq!(outcome.error.as_deref(), Some(NO_COMPATIBLE_SERVICE_MESSAGE));
    let state = session.device();
    assert_eq!(state.status, DeviceStatus::Error);
    assert_eq!(state.transport_kind, TransportKind::None);
    assert_eq!(state.error.as_deref(), Some(NO_COMPATIBLE_SERVICE_MESSAGE));
    assert_eq!(device.closes(), 1);
    assert!(device.writes().is_empty());

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        failed |= matches!(event, DeviceEvent::ConnectFailed(_));
    }
    assert!(failed);
}

#[tokio::test]
async fn test_busy_port_fails_with_message() {
    let device = MockDevice::new();
    let connector = MockConnector::usb(device.clone()).failing_open(ConnectionError::DeviceBusy {
        port: "/dev/ttyACM0".to_string(),
    });
    let session = session_with(vec![connector.into_arc()]);

    let outcome = session.connect(TransportKind::Usb).await;

    assert!(!outcome.success);
    let error = outcome.error.unwrap();
    assert!(error.contains("already in use"));
    assert_eq!(session.device().status, DeviceStatus::Error);
    assert_eq!(session.device().error, Some(error));
}

#[tokio::test]
async fn test_failed_init_tears_down() {
    let device = MockDevice::new();
    device.fail_writes();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);

    let outcome = session.connect(TransportKind::Usb).await;

    assert!(!outcome.success);
    assert_eq!(session.device().status, DeviceStatus::Error);
    assert_eq!(device.opens(), 1);
    assert_eq!(device.closes(), 1);
}

#[tokio::test]
async fn test_error_state_allows_retry() {
    let device = MockDevice::new();
    device.fail_writes();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);
    assert!(!session.connect(TransportKind::Usb).await.success);

    device.fail_from_write(usize::MAX);
    let outcome = session.connect(TransportKind::Usb).await;

    assert!(outcome.success);
    assert_eq!(session.device().error, None);
}

#[tokio::test]
async fn test_connect_while_connected_is_rejected() {
    let device = MockDevice::new();
    let session = session_with(vec![
        MockConnector::usb(device.clone()).into_arc(),
        MockConnector::ble(device.clone(), nordic_services()).into_arc(),
    ]);
    assert!(session.connect(TransportKind::Usb).await.success);

    let outcome = session.connect(TransportKind::Ble).await;

    assert!(!outcome.success);
    assert_eq!(
        outcome.error.as_deref(),
        Some("Cannot connect while connected")
    );
    assert_eq!(session.device().status, DeviceStatus::Connected);
    assert_eq!(session.device().transport_kind, TransportKind::Usb);
    assert_eq!(device.opens(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_from_plain_thread() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);
    assert!(session.connect(TransportKind::Usb).await.success);

    let writer = session.clone();
    let written = std::thread::spawn(move || writer.write(b"print(1)"))
        .join()
        .unwrap();

    assert!(written);
    let expected = repl::frame(b"print(1)");
    assert!(eventually(|| device.writes().last() == Some(&expected)).await);
}

#[tokio::test]
async fn test_missing_transport_is_unsupported() {
    let device = MockDevice::new();
    let session = session_with(vec![
        MockConnector::usb(device.clone()).into_arc(),
        MockConnector::ble(device.clone(), nordic_services())
            .unavailable()
            .into_arc(),
    ]);

    let outcome = session.connect(TransportKind::Ble).await;
    assert!(!outcome.success);
    assert!(outcome.error.is_some_and(|e| e.contains("ble")));
    let state = session.device();
    assert_eq!(state.status, DeviceStatus::Unsupported);
    assert_eq!(state.error, None);
    assert!(state.check_invariants().is_ok());

    assert!(session.connect(TransportKind::Usb).await.success);
}

#[tokio::test]
async fn test_device_initiated_disconnect() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);
    assert!(session.connect(TransportKind::Usb).await.success);
    let mut states = session.watch();
    let mut events = session.subscribe_events();

    device.end_stream();

    let state = wait_for_state(&mut states, |s| s.status == DeviceStatus::Disconnected).await;
    assert_eq!(state.transport_kind, TransportKind::None);
    assert!(eventually(|| device.closes() == 1).await);

    let device_initiated = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(DeviceEvent::Disconnected { device_initiated }) => return device_initiated,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(device_initiated);
}

#[tokio::test]
async fn test_stale_link_loss_is_ignored() {
    let device = MockDevice::new();
    let session = session_with(vec![MockConnector::usb(device.clone()).into_arc()]);

    assert!(session.connect(TransportKind::Usb).await.success);
    let old_link = device.last_link().unwrap();
    session.disconnect().await;
    assert!(session.connect(TransportKind::Usb).await.success);
    let new_link = device.last_link().unwrap();
    assert_ne!(old_link.handle_id(), new_link.handle_id());

    old_link.report_lost();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.device().status, DeviceStatus::Connected);
    assert_eq!(device.closes(), 1);

    new_link.report_lost();
    let mut states = session.watch();
    wait_for_state(&mut states, |s| s.status == DeviceStatus::Disconnected).await;
    assert_eq!(device.closes(), 2);
}

//! Startup auto-reconnect
//!
//! Reopens a previously authorized USB-serial hub without prompting. Only
//! the serial connector can resume; Bluetooth devices always need an explicit
//! user choice.

use crate::session::DeviceSession;
use crate::transport::RequestMode;
use hublink_core::TransportKind;

/// What an auto-reconnect attempt did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoReconnectOutcome {
    /// Nothing to resume; the device stays `Idle`
    NoAuthorizedPorts,
    /// Connected to the named port
    Connected(String),
    /// The attempt failed; the device is back in `Idle`
    Failed(String),
}

/// Try to resume the first authorized serial port.
///
/// Failures are logged only and leave the device `Idle` without an error.
pub async fn auto_reconnect(session: &DeviceSession) -> AutoReconnectOutcome {
    let Some(connector) = session.connector(TransportKind::Usb) else {
        tracing::debug!("No USB connector, skipping auto-reconnect");
        return AutoReconnectOutcome::NoAuthorizedPorts;
    };

    let authorized = connector.authorized_devices().await;
    let Some(first) = authorized.into_iter().next() else {
        tracing::debug!("No authorized ports to resume");
        return AutoReconnectOutcome::NoAuthorizedPorts;
    };

    tracing::info!("Resuming {} ({})", first.name, first.id);
    let outcome = session
        .connect_with(TransportKind::Usb, RequestMode::Resume(first.id.clone()), true)
        .await;

    if outcome.success {
        AutoReconnectOutcome::Connected(first.id)
    } else {
        let reason = outcome
            .error
            .unwrap_or_else(|| "cancelled".to_string());
        tracing::info!("Auto-reconnect to {} failed: {}", first.id, reason);
        AutoReconnectOutcome::Failed(reason)
    }
}

//! Connection state machine
//!
//! [`DeviceSession`] owns the single logical device: its [`DeviceState`],
//! the active link (transport, read loop, write queue) and the notification
//! sink. Connect, disconnect and link-loss teardown run one at a time.
//!
//! USB: `Idle → Requesting → ConnectingTransport → InitializingRepl → Connected`
//! BLE: `... → ConnectingTransport → DiscoveringServices → InitializingRepl → ...`

use crate::read_loop::ReadLoop;
use crate::repl;
use crate::transport::{Connector, DeviceCandidate, LinkContext, RequestMode, Transport};
use crate::write_queue::{WriteSerializer, WriteTicket};
use hublink_core::{
    notify_slot, ConnectionError, DeviceEvent, DeviceState, DeviceStatus, Error, EventDispatcher,
    HandleId, NotifySlot, Result, TransportKind,
};
use hublink_settings::ReplSettings;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

/// Result of a connect attempt
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectOutcome {
    /// The device reached `Connected`
    pub success: bool,
    /// Failure message, absent on success and on cancellation
    pub error: Option<String>,
    /// The user dismissed the device chooser
    pub is_cancellation: bool,
}

impl ConnectOutcome {
    fn connected() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    fn cancelled() -> Self {
        Self {
            is_cancellation: true,
            ..Self::default()
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

struct ActiveLink {
    handle_id: HandleId,
    transport: Arc<dyn Transport>,
    reader: Option<ReadLoop>,
    writer: WriteSerializer,
}

impl ActiveLink {
    /// Release reader, writer and channel. Every step runs regardless of the others.
    async fn teardown(self) {
        if let Some(reader) = &self.reader {
            reader.stop().await;
        }
        self.writer.abandon();
        self.transport.close().await;
        tracing::debug!("{} released", self.handle_id);
    }
}

struct SessionInner {
    state: watch::Sender<DeviceState>,
    events: EventDispatcher,
    connectors: Vec<Arc<dyn Connector>>,
    repl: ReplSettings,
    op_lock: tokio::sync::Mutex<()>,
    link: Mutex<Option<ActiveLink>>,
    sink: NotifySlot,
}

/// The logical hub device
///
/// Cheap to clone; clones share the same device.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    /// Create an idle session over the given connectors
    pub fn new(repl: ReplSettings, connectors: Vec<Arc<dyn Connector>>) -> Self {
        let (state, _) = watch::channel(DeviceState::idle());
        Self {
            inner: Arc::new(SessionInner {
                state,
                events: EventDispatcher::default(),
                connectors,
                repl,
                op_lock: tokio::sync::Mutex::new(()),
                link: Mutex::new(None),
                sink: notify_slot(),
            }),
        }
    }

    /// Snapshot of the device state
    pub fn device(&self) -> DeviceState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every state change
    pub fn watch(&self) -> watch::Receiver<DeviceState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to device events
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Register the sink for inbound device bytes, replacing any previous one
    pub fn on_notify<F>(&self, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.inner.sink.write() = Some(Arc::new(callback));
    }

    /// Remove the notification sink
    pub fn clear_notify(&self) {
        *self.inner.sink.write() = None;
    }

    pub(crate) fn connector(&self, kind: TransportKind) -> Option<Arc<dyn Connector>> {
        self.inner
            .connectors
            .iter()
            .find(|c| c.kind() == kind)
            .cloned()
    }

    /// Connect interactively over `kind`.
    ///
    /// Never returns an error: failures end in `Error` (or `Idle` when the
    /// user cancelled) and are described by the outcome.
    pub async fn connect(&self, kind: TransportKind) -> ConnectOutcome {
        self.connect_with(kind, RequestMode::Interactive, false)
            .await
    }

    /// Connect with an explicit request mode.
    ///
    /// A `silent` attempt returns to `Idle` on failure instead of `Error`.
    pub(crate) async fn connect_with(
        &self,
        kind: TransportKind,
        mode: RequestMode,
        silent: bool,
    ) -> ConnectOutcome {
        let _op = self.inner.op_lock.lock().await;

        let current = self.device();
        if !current.status.can_connect() {
            let err = ConnectionError::InvalidState {
                current: current.status.to_string(),
                requested: "connect".to_string(),
            };
            tracing::warn!("{}", err);
            return ConnectOutcome::failed(err.to_string());
        }

        let available = match self.connector(kind) {
            Some(connector) => connector.is_available().await.then_some(connector),
            None => None,
        };
        let Some(connector) = available else {
            let err = ConnectionError::Unsupported {
                transport: kind.to_string(),
            };
            if silent {
                tracing::info!("Connect attempt skipped: {}", err);
                self.set_state(DeviceState::idle());
            } else {
                tracing::warn!("{}", err);
                self.set_state(DeviceState::unsupported());
            }
            return ConnectOutcome::failed(err.to_string());
        };

        self.set_state(DeviceState::requesting());

        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        match self.establish(connector.as_ref(), mode, lost_tx).await {
            Ok((link, candidate)) => {
                *self.inner.link.lock() = Some(link);
                self.set_state(DeviceState::attached(
                    DeviceStatus::Connected,
                    candidate.kind,
                    &candidate.name,
                    &candidate.id,
                ));
                self.inner.events.publish(DeviceEvent::Connected {
                    name: candidate.name,
                    kind: candidate.kind,
                });
                self.spawn_supervisor(lost_rx);
                ConnectOutcome::connected()
            }
            Err(err) if err.is_cancellation() => {
                tracing::info!("Device selection cancelled");
                self.set_state(DeviceState::idle());
                ConnectOutcome::cancelled()
            }
            Err(err) => {
                let message = err.connection_error().to_string();
                if silent {
                    tracing::info!("Connect attempt failed quietly: {}", message);
                    self.set_state(DeviceState::idle());
                } else {
                    tracing::warn!("Connect failed: {}", message);
                    self.set_state(DeviceState::failed(&message));
                    self.inner
                        .events
                        .publish(DeviceEvent::ConnectFailed(message.clone()));
                }
                ConnectOutcome::failed(message)
            }
        }
    }

    async fn establish(
        &self,
        connector: &dyn Connector,
        mode: RequestMode,
        lost_tx: mpsc::UnboundedSender<HandleId>,
    ) -> Result<(ActiveLink, DeviceCandidate)> {
        let candidate = connector.request(mode).await?;
        self.set_state(DeviceState::attached(
            DeviceStatus::ConnectingTransport,
            candidate.kind,
            &candidate.name,
            &candidate.id,
        ));

        let handle_id = HandleId::new();
        let link_ctx = LinkContext::new(handle_id, lost_tx);
        let transport = connector.open(&candidate, link_ctx.clone()).await?;
        tracing::info!("{} opened for {}", handle_id, candidate.name);

        let mut link = ActiveLink {
            handle_id,
            writer: WriteSerializer::new(Arc::clone(&transport)),
            transport,
            reader: None,
        };

        match self.initialize(&mut link, &candidate, link_ctx).await {
            Ok(()) => Ok((link, candidate)),
            Err(e) => {
                link.teardown().await;
                Err(e)
            }
        }
    }

    async fn initialize(
        &self,
        link: &mut ActiveLink,
        candidate: &DeviceCandidate,
        link_ctx: LinkContext,
    ) -> Result<()> {
        if link.transport.needs_discovery() {
            self.set_state(DeviceState::attached(
                DeviceStatus::DiscoveringServices,
                candidate.kind,
                &candidate.name,
                &candidate.id,
            ));
            link.transport.discover_services().await?;
        }

        link.reader = Some(ReadLoop::start(
            Arc::clone(&link.transport),
            Arc::clone(&self.inner.sink),
            link_ctx,
        ));

        self.set_state(DeviceState::attached(
            DeviceStatus::InitializingRepl,
            candidate.kind,
            &candidate.name,
            &candidate.id,
        ));

        let init_delay = Duration::from_millis(self.inner.repl.init_delay_ms);
        let interrupt = link.writer.enqueue(repl::interrupt(), init_delay);
        let preamble = link.writer.enqueue(
            repl::init_preamble(&self.inner.repl.preamble_imports),
            Duration::ZERO,
        );

        if !interrupt.flushed().await {
            return Err(Error::communication("could not interrupt the REPL"));
        }
        if !preamble.flushed().await {
            return Err(Error::communication("could not send the REPL preamble"));
        }
        tracing::debug!(
            "REPL initialized with {} import(s)",
            self.inner.repl.preamble_imports.len()
        );
        Ok(())
    }

    fn spawn_supervisor(&self, mut lost_rx: mpsc::UnboundedReceiver<HandleId>) {
        let session: Weak<SessionInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(handle_id) = lost_rx.recv().await {
                let Some(inner) = session.upgrade() else {
                    break;
                };
                DeviceSession { inner }.handle_link_lost(handle_id).await;
            }
        });
    }

    /// Tear down the link if `handle_id` is still the active one
    pub(crate) async fn handle_link_lost(&self, handle_id: HandleId) {
        let _op = self.inner.op_lock.lock().await;

        let link = {
            let mut guard = self.inner.link.lock();
            let is_active = guard
                .as_ref()
                .is_some_and(|active| active.handle_id == handle_id);
            if is_active {
                guard.take()
            } else {
                None
            }
        };

        match link {
            Some(link) => {
                tracing::warn!("{} lost by the device", handle_id);
                link.teardown().await;
                self.set_state(DeviceState::disconnected());
                self.inner.events.publish(DeviceEvent::Disconnected {
                    device_initiated: true,
                });
            }
            None => tracing::debug!("Ignoring loss report of stale {}", handle_id),
        }
    }

    /// Tear down the link and move to `Disconnected`.
    ///
    /// Always succeeds. A no-op from `Idle`; repeated calls leave the state
    /// `Disconnected`. No notification sink call happens after this returns.
    pub async fn disconnect(&self) {
        let _op = self.inner.op_lock.lock().await;

        let link = self.inner.link.lock().take();
        let status = self.device().status;
        if link.is_none() && matches!(status, DeviceStatus::Idle | DeviceStatus::Disconnected) {
            return;
        }

        if let Some(link) = link {
            link.teardown().await;
        }
        self.set_state(DeviceState::disconnected());
        self.inner.events.publish(DeviceEvent::Disconnected {
            device_initiated: false,
        });
    }

    fn enqueue(&self, data: Vec<u8>) -> Result<WriteTicket> {
        if !self.device().is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }
        let guard = self.inner.link.lock();
        let link = guard.as_ref().ok_or(ConnectionError::NotConnected)?;
        tracing::debug!("Queueing {} byte(s) to {}", data.len(), link.handle_id);
        Ok(link.writer.enqueue(data, Duration::ZERO))
    }

    /// Send a command, framed for paste mode.
    ///
    /// Returns `false` when no device is connected. Safe to call from threads
    /// outside the runtime.
    pub fn write(&self, payload: &[u8]) -> bool {
        self.enqueue(repl::frame(payload)).is_ok()
    }

    /// Send a framed command and wait until it was written
    pub async fn write_and_wait(&self, payload: &[u8]) -> Result<()> {
        let ticket = self.enqueue(repl::frame(payload))?;
        if ticket.flushed().await {
            Ok(())
        } else {
            Err(Error::communication("command was not written to the device"))
        }
    }

    /// Send bytes as-is, without paste-mode framing
    pub fn send_raw(&self, bytes: &[u8]) -> bool {
        self.enqueue(bytes.to_vec()).is_ok()
    }

    /// Stop the program running on the hub
    pub fn interrupt(&self) -> bool {
        self.send_raw(&repl::interrupt())
    }

    fn set_state(&self, next: DeviceState) {
        debug_assert!(
            next.check_invariants().is_ok(),
            "invalid device state {:?}: {:?}",
            next,
            next.check_invariants()
        );

        let previous = self.inner.state.send_replace(next.clone());
        if !previous.status.can_transition_to(next.status) {
            tracing::warn!("Unexpected transition {} -> {}", previous.status, next.status);
        }
        if previous != next {
            tracing::info!("Device {} -> {}", previous.status, next);
            self.inner.events.publish(DeviceEvent::StateChanged(next));
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.device())
            .field("connectors", &self.inner.connectors.len())
            .finish()
    }
}

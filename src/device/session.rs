//! The connect/disconnect state machine.
//!
//! All transitions go through one mutex around [`SessionSlot`], which is never held across an
//! await point. A connect attempt marks the slot `Connecting` before doing any transport work and
//! only installs the finished [`Session`] if the slot still belongs to that attempt. A
//! `disconnect()` that happens in between cancels the attempt, the attempt then releases whatever
//! it had acquired and reports [`ConnectError::Aborted`].
//!
//! Attempts run one at a time under `attempt_lock`, and `disconnect()` waits for a cancelled
//! attempt to give the lock back, so a retry never shares the scanner or a link with the attempt
//! it replaces.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::device::channel::CommandChannel;
use crate::device::constants::COMMAND_DEADLINE;
use crate::device::scanner::Scanner;
use crate::device::transport::{Link, Radio};
use crate::device::types::{ConnectionState, GattCharacteristic, PeerIdentity};
use crate::error::ConnectError;

/// The live connection to one peer, holding every handle needed to issue commands.
pub struct Session<L: Link> {
    identity: PeerIdentity,
    link: L,
    control_point: GattCharacteristic,
    // held for the duration of one command exchange
    pub(crate) exchange: AsyncMutex<()>,
    closed: AtomicBool,
}

impl<L: Link> Session<L> {
    fn new(identity: PeerIdentity, link: L, control_point: GattCharacteristic) -> Self {
        Session {
            identity,
            link,
            control_point,
            exchange: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn control_point(&self) -> &GattCharacteristic {
        &self.control_point
    }

    pub(crate) fn link(&self) -> &L {
        &self.link
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits for a command in flight to complete, then releases the link.
    async fn close(&self) {
        let _exchange = self.exchange.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(err) = self.link.close().await {
            warn!("Failed to close the link to {}: {}", self.identity.address, err);
        }
    }
}

pub(crate) enum SessionSlot<L: Link> {
    Disconnected,
    Connecting {
        attempt: u64,
        cancel: CancellationToken,
    },
    Connected(Arc<Session<L>>),
}

impl<L: Link> SessionSlot<L> {
    fn state(&self) -> ConnectionState {
        match self {
            SessionSlot::Disconnected => ConnectionState::Disconnected,
            SessionSlot::Connecting { .. } => ConnectionState::Connecting,
            SessionSlot::Connected(_) => ConnectionState::Connected,
        }
    }
}

pub(crate) type SharedSlot<L> = Arc<Mutex<SessionSlot<L>>>;

pub(crate) fn lock_slot<L: Link>(slot: &SharedSlot<L>) -> MutexGuard<'_, SessionSlot<L>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the (at most one) session of a controller.
pub struct SessionManager<R: Radio> {
    radio: Arc<R>,
    scanner: Scanner<R>,
    slot: SharedSlot<R::Link>,
    attempts: AtomicU64,
    // held from the start of an attempt until its scan is stopped and its leftovers are released
    attempt_lock: AsyncMutex<()>,
}

impl<R: Radio> SessionManager<R> {
    pub fn new(radio: Arc<R>) -> Self {
        SessionManager {
            scanner: Scanner::new(radio.clone()),
            radio,
            slot: Arc::new(Mutex::new(SessionSlot::Disconnected)),
            attempts: AtomicU64::new(0),
            attempt_lock: AsyncMutex::new(()),
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        lock_slot(&self.slot).state()
    }

    /// The open session, if any.
    pub fn session(&self) -> Option<Arc<Session<R::Link>>> {
        match &*lock_slot(&self.slot) {
            SessionSlot::Connected(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// A command channel bound to whichever session this manager has open.
    pub fn channel(&self) -> CommandChannel<R::Link> {
        CommandChannel::new(self.slot.clone(), COMMAND_DEADLINE)
    }

    /// Waits for `target` to advertise, connects to it and looks up its control point.
    ///
    /// Gives up after `timeout`; the caller decides whether to try again. On any failure nothing
    /// stays acquired and the state is back to `Disconnected`.
    pub async fn connect(&self, target: PeerIdentity, timeout: Duration) -> Result<Arc<Session<R::Link>>, ConnectError> {
        let (attempt, cancel) = self.begin_attempt(&target)?;
        // an aborted attempt may still be releasing its scan and link
        let _attempt = self.attempt_lock.lock().await;
        info!("Connecting to {} (attempt {})...", target.address, attempt);

        let mut acquired: Option<R::Link> = None;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectError::Aborted),
            result = tokio::time::timeout(timeout, self.establish(&target, &mut acquired)) => match result {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout { timeout }),
            },
        };

        if let Err(err) = self.scanner.stop_scan().await {
            warn!("Failed to stop scanning: {}", err);
        }

        let result = self.finish_attempt(attempt, target, outcome, &mut acquired);

        if let Some(link) = acquired.take() {
            debug!("Releasing the partially opened link to {}", target.address);
            if let Err(err) = link.close().await {
                warn!("Failed to release the link to {}: {}", target.address, err);
            }
        }

        match &result {
            Ok(_) => info!("Flat panel {} connected!", target.address),
            Err(err) => warn!("Connecting to {} failed: {}", target.address, err),
        }
        result
    }

    /// Ends the session or the connect attempt in progress. Always ends in `Disconnected`.
    ///
    /// An attempt in progress is cancelled and has released its scan and link by the time this
    /// returns.
    ///
    /// A command already in flight is allowed to complete before the link is released, new commands
    /// fail with `NotConnected` right away.
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *lock_slot(&self.slot), SessionSlot::Disconnected);

        match previous {
            SessionSlot::Disconnected => debug!("Already disconnected"),
            SessionSlot::Connecting { attempt, cancel } => {
                info!("Aborting connect attempt {}", attempt);
                cancel.cancel();
                // returns once the attempt has released everything it acquired
                drop(self.attempt_lock.lock().await);
                info!("Disconnected");
            },
            SessionSlot::Connected(session) => {
                info!("Disconnecting from {}...", session.identity().address);
                session.close().await;
                info!("Disconnected");
            },
        }
    }

    fn begin_attempt(&self, target: &PeerIdentity) -> Result<(u64, CancellationToken), ConnectError> {
        let mut slot = lock_slot(&self.slot);

        if !matches!(*slot, SessionSlot::Disconnected) {
            return Err(ConnectError::AlreadyConnected);
        }

        if target.address.is_unpaired() {
            return Err(ConnectError::NoPairedDevice);
        }

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        *slot = SessionSlot::Connecting { attempt, cancel: cancel.clone() };
        Ok((attempt, cancel))
    }

    async fn establish(&self, target: &PeerIdentity, acquired: &mut Option<R::Link>) -> Result<GattCharacteristic, ConnectError> {
        // Connecting by address without a fresh advertisement is unreliable: a peer that is
        // powered down yields a connection whose services never resolve.
        let mut candidates = self.scanner.start_scan(target.service_id).await?;

        loop {
            match candidates.next().await {
                Some(candidate) if candidate.address == target.address => break,
                Some(candidate) => debug!("Ignoring advertisement of {}", candidate.address),
                None => return Err(ConnectError::handshake("scan", "the radio stopped reporting advertisements")),
            }
        }

        drop(candidates);
        if let Err(err) = self.scanner.stop_scan().await {
            warn!("Failed to stop scanning: {}", err);
        }

        info!("Discovered the flat panel {}. Attempting to connect...", target.address);
        let link = self.radio.connect(target.address).await
            .map_err(|err| ConnectError::handshake("connect", err))?;
        let link = acquired.insert(link);

        let services = link.services().await
            .map_err(|err| ConnectError::handshake("service discovery", err))?;

        let service = services.iter()
            .find(|service| service.uuid == target.service_id)
            .ok_or_else(|| ConnectError::handshake("service discovery", format!("service {} not found", target.service_id)))?;

        let control_point = service.characteristics.iter()
            .find(|characteristic| characteristic.uuid == target.characteristic_id)
            .ok_or_else(|| ConnectError::handshake("characteristic discovery", format!("characteristic {} not found", target.characteristic_id)))?;

        debug!("Found control point {:?}", control_point);
        Ok(control_point.clone())
    }

    fn finish_attempt(
        &self,
        attempt: u64,
        target: PeerIdentity,
        outcome: Result<GattCharacteristic, ConnectError>,
        acquired: &mut Option<R::Link>,
    ) -> Result<Arc<Session<R::Link>>, ConnectError> {
        let mut slot = lock_slot(&self.slot);

        let current = matches!(&*slot, SessionSlot::Connecting { attempt: a, .. } if *a == attempt);
        if !current {
            // disconnect() got here first
            return Err(ConnectError::Aborted);
        }

        match (outcome, acquired.take()) {
            (Ok(control_point), Some(link)) => {
                let session = Arc::new(Session::new(target, link, control_point));
                *slot = SessionSlot::Connected(session.clone());
                Ok(session)
            },
            (Ok(_), None) => {
                *slot = SessionSlot::Disconnected;
                Err(ConnectError::handshake("connect", "no link was opened"))
            },
            (Err(err), link) => {
                *slot = SessionSlot::Disconnected;
                *acquired = link;
                Err(err)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::constants::CONNECT_TIMEOUT;
    use crate::device::types::BluetoothAddress;
    use crate::sim::panel::SimPanel;
    use crate::sim::radio::{SimRadio, SIM_ADDRESS};

    fn manager_with(panel: SimPanel) -> (SessionManager<SimRadio>, Arc<SimRadio>) {
        let radio = Arc::new(SimRadio::with_panel(panel));
        (SessionManager::new(radio.clone()), radio)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_opens_a_session_to_the_control_point() {
        let panel = SimPanel::flat_panel(SIM_ADDRESS);
        let (manager, radio) = manager_with(panel.clone());

        let session = manager.connect(PeerIdentity::flat_panel(SIM_ADDRESS), CONNECT_TIMEOUT).await.unwrap();

        assert_eq!(manager.current_state(), ConnectionState::Connected);
        assert_eq!(session.identity().address, SIM_ADDRESS);
        assert_eq!(session.control_point().uuid, crate::device::constants::flat_panel_brightness_uuid());
        assert!(panel.is_connected());
        assert_eq!(session.link().panel().address(), SIM_ADDRESS);
        assert_eq!(radio.active_listeners(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_is_rejected() {
        let (manager, _radio) = manager_with(SimPanel::flat_panel(SIM_ADDRESS));
        let target = PeerIdentity::flat_panel(SIM_ADDRESS);

        manager.connect(target, CONNECT_TIMEOUT).await.unwrap();
        assert!(matches!(manager.connect(target, CONNECT_TIMEOUT).await, Err(ConnectError::AlreadyConnected)));
        assert_eq!(manager.current_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn unpaired_address_is_rejected() {
        let (manager, radio) = manager_with(SimPanel::flat_panel(SIM_ADDRESS));

        let result = manager.connect(PeerIdentity::flat_panel(BluetoothAddress::UNPAIRED), CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(ConnectError::NoPairedDevice)));
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert_eq!(radio.scans_started(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let panel = SimPanel::flat_panel(SIM_ADDRESS);
        panel.set_advertising(false);
        let (manager, radio) = manager_with(panel.clone());

        let result = manager.connect(PeerIdentity::flat_panel(SIM_ADDRESS), CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(ConnectError::Timeout { timeout }) if timeout == CONNECT_TIMEOUT));
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert_eq!(radio.active_listeners(), 0);
        assert_eq!(panel.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_service_fails_the_handshake_and_releases_the_link() {
        let panel = SimPanel::new(SIM_ADDRESS, vec![crate::device::constants::flat_panel_service_uuid()], vec![]);
        let (manager, _radio) = manager_with(panel.clone());

        let result = manager.connect(PeerIdentity::flat_panel(SIM_ADDRESS), CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(ConnectError::HandshakeFailed { .. })));
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert_eq!(panel.connect_count(), 1);
        assert!(!panel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_fails_the_handshake() {
        let panel = SimPanel::flat_panel(SIM_ADDRESS);
        panel.set_reject_connect(true);
        let (manager, _radio) = manager_with(panel);

        let result = manager.connect(PeerIdentity::flat_panel(SIM_ADDRESS), CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(ConnectError::HandshakeFailed { .. })));
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_discovery_times_out_and_releases_the_link() {
        let panel = SimPanel::flat_panel(SIM_ADDRESS);
        panel.set_discovery_delay(Duration::from_secs(60));
        let (manager, radio) = manager_with(panel.clone());

        let result = manager.connect(PeerIdentity::flat_panel(SIM_ADDRESS), CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(ConnectError::Timeout { .. })));
        assert_eq!(panel.connect_count(), 1);
        assert!(!panel.is_connected());
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert_eq!(radio.scans_stopped(), radio.scans_started() + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_right_after_an_aborted_connect_succeeds() {
        let panel = SimPanel::flat_panel(SIM_ADDRESS);
        panel.set_advertising(false);
        let (manager, radio) = manager_with(panel.clone());
        let target = PeerIdentity::flat_panel(SIM_ADDRESS);

        let (first, second) = tokio::join!(
            manager.connect(target, CONNECT_TIMEOUT),
            async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                manager.disconnect().await;
                // the aborted attempt has stopped its scan by now
                assert_eq!(radio.active_listeners(), 0);
                panel.set_advertising(true);
                manager.connect(target, CONNECT_TIMEOUT).await
            },
        );

        assert!(matches!(first, Err(ConnectError::Aborted)));
        second.unwrap();
        assert_eq!(manager.current_state(), ConnectionState::Connected);
        assert!(panel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_connect_after_the_link_opened_releases_it() {
        let panel = SimPanel::flat_panel(SIM_ADDRESS);
        panel.set_discovery_delay(Duration::from_secs(5));
        let (manager, _radio) = manager_with(panel.clone());

        let (result, _) = tokio::join!(
            manager.connect(PeerIdentity::flat_panel(SIM_ADDRESS), CONNECT_TIMEOUT),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                assert!(panel.is_connected());
                manager.disconnect().await;
                assert!(!panel.is_connected());
            },
        );

        assert!(matches!(result, Err(ConnectError::Aborted)));
        assert_eq!(panel.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let panel = SimPanel::flat_panel(SIM_ADDRESS);
        let (manager, _radio) = manager_with(panel.clone());

        manager.disconnect().await;
        manager.connect(PeerIdentity::flat_panel(SIM_ADDRESS), CONNECT_TIMEOUT).await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert!(manager.session().is_none());
        assert!(!panel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_connect_aborts_the_attempt() {
        let panel = SimPanel::flat_panel(SIM_ADDRESS);
        panel.set_advertising(false);
        let (manager, radio) = manager_with(panel.clone());

        let (result, _) = tokio::join!(
            manager.connect(PeerIdentity::flat_panel(SIM_ADDRESS), CONNECT_TIMEOUT),
            async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                assert_eq!(manager.current_state(), ConnectionState::Connecting);
                let second = manager.connect(PeerIdentity::flat_panel(SIM_ADDRESS), CONNECT_TIMEOUT).await;
                assert!(matches!(second, Err(ConnectError::AlreadyConnected)));
                assert_eq!(manager.current_state(), ConnectionState::Connecting);
                manager.disconnect().await;
            },
        );

        assert!(matches!(result, Err(ConnectError::Aborted)));
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert_eq!(radio.active_listeners(), 0);

        // the manager is usable again
        panel.set_advertising(true);
        manager.connect(PeerIdentity::flat_panel(SIM_ADDRESS), CONNECT_TIMEOUT).await.unwrap();
        assert_eq!(manager.current_state(), ConnectionState::Connected);
    }
}

use std::sync::{Arc, Mutex, PoisonError};
use futures::stream::BoxStream;
use futures::StreamExt;
use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::transport::Radio;
use crate::device::types::{Advertisement, BluetoothAddress, DiscoveredCandidate};
use crate::error::ScanError;

/// Candidates in arrival order. Ends once the scan is stopped or the radio goes away.
pub type CandidateStream = BoxStream<'static, DiscoveredCandidate>;

/// Listens for advertisements and reports the peers that advertise a given service.
///
/// Every matching advertisement is reported, so the same peer shows up many times. Use
/// [`CandidateList`] when a stable list is needed.
pub struct Scanner<R: Radio> {
    radio: Arc<R>,
    active: Mutex<Option<CancellationToken>>,
}

impl<R: Radio> Scanner<R> {
    pub fn new(radio: Arc<R>) -> Self {
        Scanner {
            radio,
            active: Mutex::new(None),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Starts listening, replacing a scan that is already running.
    ///
    /// Fails right away if the radio is not available, in which case no candidate is ever emitted.
    pub async fn start_scan(&self, service_filter: Uuid) -> Result<CandidateStream, ScanError> {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.active.lock().unwrap_or_else(PoisonError::into_inner).replace(cancel.clone()) {
            debug!("Replacing the running scan");
            previous.cancel();
        }

        let advertisements = match self.radio.start_scan(service_filter).await {
            Ok(v) => v,
            Err(err) => {
                warn!("Scanning failed {:?}", err);
                self.clear_active(&cancel);
                return Err(err.into());
            },
        };
        info!("Scanning for service {}...", service_filter);

        let stop = cancel.clone();
        let candidates = advertisements
            .take_until(async move { stop.cancelled().await })
            .enumerate()
            .filter_map(move |(order, advertisement)| {
                futures::future::ready(to_candidate(service_filter, order, advertisement))
            });

        Ok(candidates.boxed())
    }

    /// Stops listening. Safe to call when no scan was ever started or it was already stopped.
    pub async fn stop_scan(&self) -> Result<(), ScanError> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner).take();

        match active {
            Some(cancel) => {
                cancel.cancel();
                info!("Scan stopped");
            },
            None => debug!("No scan to stop"),
        }

        self.radio.stop_scan().await.map_err(ScanError::from)
    }

    fn clear_active(&self, cancel: &CancellationToken) {
        cancel.cancel();
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        // only ours is cancelled, a scan that replaced it in the meantime is left alone
        if active.as_ref().is_some_and(CancellationToken::is_cancelled) {
            *active = None;
        }
    }
}

fn to_candidate(service_filter: Uuid, order: usize, advertisement: Advertisement) -> Option<DiscoveredCandidate> {
    // Some environments ignore the filter, so make sure to check the service uuid again
    if !advertisement.services.contains(&service_filter) {
        return None;
    }

    Some(DiscoveredCandidate {
        address: advertisement.address,
        first_seen_order: order,
        local_name: advertisement.local_name,
        rssi: advertisement.rssi,
    })
}

/// Candidates de-duplicated by address, in the order they were first seen.
#[derive(Debug, Default, Clone)]
pub struct CandidateList {
    candidates: IndexMap<BluetoothAddress, DiscoveredCandidate>,
}

impl CandidateList {
    pub fn new() -> Self {
        CandidateList::default()
    }

    /// Returns true if the address was not seen before. Later sightings refresh the name and
    /// signal strength but keep the original position.
    pub fn insert(&mut self, candidate: DiscoveredCandidate) -> bool {
        match self.candidates.get_mut(&candidate.address) {
            Some(existing) => {
                if candidate.local_name.is_some() {
                    existing.local_name = candidate.local_name;
                }
                existing.rssi = candidate.rssi.or(existing.rssi);
                false
            },
            None => {
                self.candidates.insert(candidate.address, candidate);
                true
            },
        }
    }

    pub fn contains(&self, address: &BluetoothAddress) -> bool {
        self.candidates.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredCandidate> {
        self.candidates.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::constants::flat_panel_service_uuid;
    use crate::sim::panel::SimPanel;
    use crate::sim::radio::SimRadio;

    fn address(value: u64) -> BluetoothAddress {
        BluetoothAddress::new(value).unwrap()
    }

    fn candidate(value: u64, order: usize, local_name: Option<&str>) -> DiscoveredCandidate {
        DiscoveredCandidate {
            address: address(value),
            first_seen_order: order,
            local_name: local_name.map(str::to_string),
            rssi: Some(-70),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_peers_advertising_the_service_are_reported() {
        let radio = SimRadio::with_panel(SimPanel::flat_panel(address(0x01)));
        radio.add_panel(SimPanel::new(address(0x02), vec![Uuid::from_u128(0x1234)], vec![]));
        let scanner = Scanner::new(Arc::new(radio));

        let candidates: Vec<_> = scanner.start_scan(flat_panel_service_uuid()).await.unwrap()
            .take(4)
            .collect()
            .await;

        assert_eq!(candidates.len(), 4);
        assert!(candidates.iter().all(|c| c.address == address(0x01)));
        assert!(candidates.windows(2).all(|w| w[0].first_seen_order < w[1].first_seen_order));
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_ends_the_stream_and_releases_the_radio() {
        let radio = Arc::new(SimRadio::demo());
        let scanner = Scanner::new(radio.clone());

        let mut candidates = scanner.start_scan(flat_panel_service_uuid()).await.unwrap();
        assert!(candidates.next().await.is_some());
        assert!(scanner.is_scanning());

        scanner.stop_scan().await.unwrap();
        assert!(!scanner.is_scanning());
        assert_eq!(candidates.next().await, None);

        drop(candidates);
        assert_eq!(radio.active_listeners(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let scanner = Scanner::new(Arc::new(SimRadio::demo()));
        scanner.stop_scan().await.unwrap();
        scanner.stop_scan().await.unwrap();
        assert!(!scanner.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_scan_replaces_the_running_one() {
        let scanner = Scanner::new(Arc::new(SimRadio::demo()));

        let mut first = scanner.start_scan(flat_panel_service_uuid()).await.unwrap();
        let mut second = scanner.start_scan(flat_panel_service_uuid()).await.unwrap();

        assert_eq!(first.next().await, None);
        assert!(second.next().await.is_some());
        assert!(scanner.is_scanning());
    }

    #[tokio::test]
    async fn unavailable_radio_fails_right_away() {
        let radio = SimRadio::demo();
        radio.set_available(false);
        let scanner = Scanner::new(Arc::new(radio));

        let result = scanner.start_scan(flat_panel_service_uuid()).await;
        assert!(matches!(result, Err(ScanError::Unavailable { .. })));
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn candidate_list_keeps_first_seen_order() {
        let mut list = CandidateList::new();
        assert!(list.insert(candidate(0x02, 0, None)));
        assert!(list.insert(candidate(0x01, 1, None)));
        assert!(!list.insert(candidate(0x02, 2, Some("Wireless Flat Panel"))));

        assert_eq!(list.len(), 2);
        assert!(list.contains(&address(0x01)));

        let seen: Vec<_> = list.iter().map(|c| (c.address, c.first_seen_order, c.local_name.clone())).collect();
        assert_eq!(seen, vec![
            (address(0x02), 0, Some("Wireless Flat Panel".to_string())),
            (address(0x01), 1, None),
        ]);
    }
}

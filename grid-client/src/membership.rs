use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use grid_core::cluster_view::{ClusterView, ViewDelta};
use grid_core::error::ClientError;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl Display for ClientState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientState::Disconnected => "DISCONNECTED",
            ClientState::Connecting => "CONNECTING",
            ClientState::Connected => "CONNECTED",
            ClientState::Reconnecting => "RECONNECTING",
        };
        write!(f, "{}", name)
    }
}

/// Session state machine plus the current [`ClusterView`].
#[derive(Debug)]
pub struct MembershipTracker {
    state: watch::Sender<ClientState>,
    shutdown: AtomicBool,
    view: ArcSwap<ClusterView>,
    apply_lock: Mutex<()>,
    view_syncs: watch::Sender<u64>,
    partition_count: AtomicU32,
}

impl MembershipTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        let (view_syncs, _) = watch::channel(0);
        Self {
            state,
            shutdown: AtomicBool::new(false),
            view: ArcSwap::from_pointee(ClusterView::default()),
            apply_lock: Mutex::new(()),
            view_syncs,
            partition_count: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn transition(&self, from: &[ClientState], to: ClientState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|state| {
            if self.shutdown.load(Ordering::SeqCst) || !from.contains(state) {
                return false;
            }
            previous = Some(*state);
            *state = to;
            true
        });
        if let Some(previous) = previous {
            info!("client state {} -> {}", previous, to);
        }
        changed
    }

    /// On start or an explicit reconnect request.
    pub fn start(&self) -> Result<(), ClientError> {
        if self.transition(&[ClientState::Disconnected], ClientState::Connecting) {
            Ok(())
        } else if self.is_shutdown() {
            Err(ClientError::ClientNotActive)
        } else {
            Err(ClientError::Config(format!("client cannot start while {}", self.state())))
        }
    }

    /// A connection is up and a view has been received since it was opened.
    pub fn mark_connected(&self) -> bool {
        self.transition(
            &[ClientState::Connecting, ClientState::Reconnecting],
            ClientState::Connected,
        )
    }

    /// The last live connection is gone.
    pub fn connection_lost(&self) -> bool {
        self.transition(&[ClientState::Connected], ClientState::Reconnecting)
    }

    /// The connection budget ran out.
    pub fn connect_failed(&self) -> bool {
        self.transition(
            &[ClientState::Connecting, ClientState::Reconnecting],
            ClientState::Disconnected,
        )
    }

    /// Terminal, returns `true` only for the first call.
    pub fn shutdown(&self) -> bool {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return false;
        }
        let previous = self.state.send_replace(ClientState::Disconnected);
        info!("client state {} -> {} (shutdown)", previous, ClientState::Disconnected);
        true
    }

    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| matches!(state, ClientState::Connected | ClientState::Disconnected))
                .await
                .map(|state| *state)
        })
        .await;
        match waited {
            Ok(Ok(ClientState::Connected)) => Ok(()),
            _ if self.is_shutdown() => Err(ClientError::ClientNotActive),
            Ok(_) => Err(ClientError::ClusterUnavailable("client is disconnected".to_string())),
            Err(_) => Err(ClientError::ClusterUnavailable(format!(
                "client not connected within {:?}, state {}",
                timeout,
                self.state()
            ))),
        }
    }

    pub fn view(&self) -> Arc<ClusterView> {
        self.view.load_full()
    }

    pub fn view_syncs(&self) -> u64 {
        *self.view_syncs.borrow()
    }

    /// Installs `view` when it is newer than the current one, or belongs to a
    /// different cluster. Returns the membership delta for an installed view.
    /// Every call counts as a view sync, installed or not.
    pub fn apply_view(&self, view: ClusterView) -> Option<ViewDelta> {
        let delta = {
            let _guard = self.apply_lock.lock();
            let current = self.view.load_full();
            let new_cluster = match (current.cluster_id, view.cluster_id) {
                (Some(current), Some(next)) => current != next,
                _ => false,
            };
            if new_cluster {
                warn!(
                    "cluster id changed from {:?} to {:?}, replacing view {} with {}",
                    current.cluster_id, view.cluster_id, current.version, view.version
                );
            }
            if !new_cluster && view.version <= current.version {
                debug!("drop stale cluster view {}, current {}", view.version, current.version);
                None
            } else {
                let delta = current.diff(&view);
                info!(
                    "cluster view {} installed, {} members, partitions known {}",
                    view.version,
                    view.members.len(),
                    view.partitions.is_known()
                );
                self.view.store(Arc::new(view));
                Some(delta)
            }
        };
        self.view_syncs.send_modify(|syncs| *syncs += 1);
        delta
    }

    /// Waits for a view sync newer than `seen`.
    pub async fn wait_for_view(&self, seen: u64, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.view_syncs.subscribe();
        let synced = tokio::time::timeout(timeout, async {
            rx.wait_for(|syncs| *syncs > seen).await.map(|syncs| *syncs)
        })
        .await;
        match synced {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ClientError::ClientNotActive),
            Err(_) => Err(ClientError::ClusterUnavailable(format!(
                "no cluster view received within {:?}",
                timeout
            ))),
        }
    }

    pub fn set_partition_count(&self, count: u32) {
        let previous = self.partition_count.swap(count, Ordering::SeqCst);
        if previous != 0 && previous != count {
            warn!("partition count changed from {} to {}", previous, count);
        }
    }

    /// Partition count from the view, or the one announced at authentication.
    pub fn partition_count(&self) -> u32 {
        match self.view.load().partitions.partition_count() {
            0 => self.partition_count.load(Ordering::SeqCst),
            count => count,
        }
    }

    pub fn cluster_id(&self) -> Option<Uuid> {
        self.view.load().cluster_id
    }
}

impl Default for MembershipTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use uuid::Uuid;

    use grid_core::address::Address;
    use grid_core::cluster_view::ClusterView;
    use grid_core::error::ClientError;
    use grid_core::message::cluster_view::{ClusterViewEvent, MemberInfo};

    use crate::membership::{ClientState, MembershipTracker};

    fn view(cluster: u128, version: u64, members: &[u128]) -> ClusterView {
        let event = ClusterViewEvent {
            version,
            members: members
                .iter()
                .enumerate()
                .map(|(i, uuid)| MemberInfo {
                    uuid: *uuid,
                    address: Address::new("127.0.0.1", 5701 + i as u16),
                })
                .collect(),
            partitions: members.iter().cycle().take(7).copied().collect(),
        };
        ClusterView::from_event(Some(Uuid::from_u128(cluster)), &event, |_| None)
    }

    #[test]
    fn test_state_machine() {
        let tracker = MembershipTracker::new();
        assert_eq!(tracker.state(), ClientState::Disconnected);
        assert!(!tracker.connection_lost());
        assert!(tracker.start().is_ok());
        assert!(tracker.start().is_err());
        assert!(tracker.mark_connected());
        assert_eq!(tracker.state(), ClientState::Connected);
        assert!(tracker.connection_lost());
        assert!(!tracker.connection_lost());
        assert_eq!(tracker.state(), ClientState::Reconnecting);
        assert!(tracker.mark_connected());
        assert!(tracker.connection_lost());
        assert!(tracker.connect_failed());
        assert_eq!(tracker.state(), ClientState::Disconnected);
        assert!(tracker.start().is_ok());
        assert!(tracker.shutdown());
        assert!(!tracker.shutdown());
        assert_eq!(tracker.state(), ClientState::Disconnected);
        assert!(matches!(tracker.start(), Err(ClientError::ClientNotActive)));
        assert!(!tracker.mark_connected());
    }

    #[test]
    fn test_view_version_is_monotonic() {
        let tracker = MembershipTracker::new();
        let first = tracker.apply_view(view(1, 2, &[1, 2])).expect("first view");
        assert_eq!(first.added.len(), 2);
        assert!(tracker.apply_view(view(1, 2, &[1])).is_none());
        assert!(tracker.apply_view(view(1, 1, &[1])).is_none());
        assert_eq!(tracker.view().members.len(), 2);
        let delta = tracker.apply_view(view(1, 3, &[2, 3])).expect("newer view");
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(tracker.view().version, 3);
        assert_eq!(tracker.view().partition_owner(0).map(|m| m.uuid), Some(Uuid::from_u128(2)));
        assert_eq!(tracker.view_syncs(), 4);
    }

    #[test]
    fn test_new_cluster_resets_version() {
        let tracker = MembershipTracker::new();
        tracker.apply_view(view(1, 9, &[1]));
        assert!(tracker.apply_view(view(2, 1, &[5])).is_some());
        assert_eq!(tracker.view().version, 1);
        assert_eq!(tracker.cluster_id(), Some(Uuid::from_u128(2)));
    }

    #[test]
    fn test_partition_count_fallback() {
        let tracker = MembershipTracker::new();
        assert_eq!(tracker.partition_count(), 0);
        tracker.set_partition_count(271);
        assert_eq!(tracker.partition_count(), 271);
        tracker.apply_view(view(1, 1, &[1]));
        assert_eq!(tracker.partition_count(), 7);
    }

    #[tokio::test]
    async fn test_wait_until_connected() -> anyhow::Result<()> {
        let tracker = Arc::new(MembershipTracker::new());
        tracker.start()?;
        assert!(tracker.wait_until_connected(Duration::from_millis(50)).await.is_err());
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_until_connected(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.mark_connected();
        waiter.await??;
        tracker.shutdown();
        assert!(matches!(
            tracker.wait_until_connected(Duration::from_secs(1)).await,
            Err(ClientError::ClientNotActive)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_for_view() -> anyhow::Result<()> {
        let tracker = Arc::new(MembershipTracker::new());
        let seen = tracker.view_syncs();
        assert!(tracker.wait_for_view(seen, Duration::from_millis(20)).await.is_err());
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_view(seen, Duration::from_secs(5)).await })
        };
        tracker.apply_view(view(1, 1, &[1]));
        waiter.await??;
        Ok(())
    }
}

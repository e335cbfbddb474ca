use ahash::HashSet;

use uuid::Uuid;

use crate::address::{Address, Endpoint};
use crate::member::{Member, MemberState};
use crate::message::cluster_view::ClusterViewEvent;
use crate::partition::PartitionTable;

/// Immutable snapshot of membership and partition ownership. A new version is
/// built for every change and swapped in as a whole.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ClusterView {
    pub version: u64,
    pub cluster_id: Option<Uuid>,
    pub members: Vec<Member>,
    pub partitions: PartitionTable,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ViewDelta {
    pub added: Vec<Member>,
    pub removed: Vec<Member>,
}

impl ViewDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl ClusterView {
    /// Builds a view from a member push. `translate` maps an advertised
    /// address to the one reachable from this client, if they differ.
    /// The partition table is dropped to unknown when any owner is not part
    /// of the pushed member list.
    pub fn from_event<F>(cluster_id: Option<Uuid>, event: &ClusterViewEvent, translate: F) -> Self
    where
        F: Fn(&Address) -> Option<Address>,
    {
        let members: Vec<Member> = event
            .members
            .iter()
            .map(|info| {
                let endpoint = match translate(&info.address) {
                    Some(public) if public != info.address => Endpoint::with_public(info.address.clone(), public),
                    _ => Endpoint::new(info.address.clone()),
                };
                Member::new(Uuid::from_u128(info.uuid), endpoint)
            })
            .collect();
        let known: HashSet<Uuid> = members.iter().map(|m| m.uuid).collect();
        let owners: Vec<Uuid> = event.partitions.iter().map(|o| Uuid::from_u128(*o)).collect();
        let partitions = if owners.iter().all(|owner| known.contains(owner)) {
            PartitionTable::new(owners)
        } else {
            PartitionTable::Unknown
        };
        Self {
            version: event.version,
            cluster_id,
            members,
            partitions,
        }
    }

    pub fn member(&self, uuid: &Uuid) -> Option<&Member> {
        self.members.iter().find(|m| &m.uuid == uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.member(uuid).is_some()
    }

    pub fn partition_owner(&self, partition_id: i32) -> Option<&Member> {
        self.partitions
            .owner(partition_id)
            .and_then(|owner| self.member(&owner))
    }

    pub fn diff(&self, next: &ClusterView) -> ViewDelta {
        let added = next
            .members
            .iter()
            .filter(|m| !self.contains(&m.uuid))
            .cloned()
            .collect();
        let removed = self
            .members
            .iter()
            .filter(|m| !next.contains(&m.uuid))
            .map(|m| m.with_state(MemberState::Left))
            .collect();
        ViewDelta { added, removed }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::address::Address;
    use crate::cluster_view::ClusterView;
    use crate::member::MemberState;
    use crate::message::cluster_view::{ClusterViewEvent, MemberInfo};

    fn event(version: u64, members: &[(u128, u16)], partitions: Vec<u128>) -> ClusterViewEvent {
        ClusterViewEvent {
            version,
            members: members
                .iter()
                .map(|(uuid, port)| MemberInfo {
                    uuid: *uuid,
                    address: Address::new("10.0.0.1", *port),
                })
                .collect(),
            partitions,
        }
    }

    #[test]
    fn test_from_event_with_known_owners() {
        let event = event(3, &[(1, 5701), (2, 5702)], vec![1, 2, 1]);
        let view = ClusterView::from_event(None, &event, |_| None);
        assert_eq!(view.version, 3);
        assert_eq!(view.members.len(), 2);
        assert!(view.partitions.is_known());
        assert_eq!(view.partition_owner(1).map(|m| m.uuid), Some(Uuid::from_u128(2)));
        assert_eq!(view.partition_owner(3), None);
    }

    #[test]
    fn test_unknown_owner_marks_table_unknown() {
        let event = event(1, &[(1, 5701)], vec![1, 9]);
        let view = ClusterView::from_event(None, &event, |_| None);
        assert!(!view.partitions.is_known());
        assert_eq!(view.partition_owner(0), None);
    }

    #[test]
    fn test_translation_sets_public_address() {
        let event = event(1, &[(1, 5701)], vec![]);
        let public = Address::new("34.1.1.1", 30001);
        let view = ClusterView::from_event(None, &event, |_| Some(public.clone()));
        assert_eq!(view.members[0].connect_address(), &public);
        assert_eq!(view.members[0].address(), &Address::new("10.0.0.1", 5701));
    }

    #[test]
    fn test_diff() {
        let before = ClusterView::from_event(None, &event(1, &[(1, 5701), (2, 5702)], vec![]), |_| None);
        let after = ClusterView::from_event(None, &event(2, &[(2, 5702), (3, 5703)], vec![]), |_| None);
        let delta = before.diff(&after);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].uuid, Uuid::from_u128(3));
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].uuid, Uuid::from_u128(1));
        assert_eq!(delta.removed[0].state, MemberState::Left);
        assert!(after.diff(&after).is_empty());
    }
}

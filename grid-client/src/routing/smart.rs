use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use grid_core::cluster_view::ClusterView;
use grid_remote::connection::Connection;
use grid_remote::registry::ConnectionRegistry;

use crate::routing::{live, InvocationTarget, TRouter};

/// Sends each key addressed request straight to the owner of its partition.
/// Anything that cannot be placed goes round robin over the live connections
/// and the member redirects.
#[derive(Debug, Default)]
pub struct SmartRouter {
    next: AtomicUsize,
}

impl SmartRouter {
    fn any(&self, registry: &ConnectionRegistry) -> Option<Connection> {
        let connections = registry.all();
        if connections.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % connections.len();
        connections.into_iter().nth(index)
    }
}

impl TRouter for SmartRouter {
    fn route(&self, target: &InvocationTarget, view: &ClusterView, registry: &ConnectionRegistry) -> Option<Connection> {
        match target {
            InvocationTarget::Partition(partition_id) => {
                let owner = view.partitions.owner(*partition_id);
                match owner.and_then(|owner| registry.get(&owner)) {
                    Some(connection) => Some(connection),
                    None => {
                        trace!("owner {:?} of partition {} not connected, routing anywhere", owner, partition_id);
                        self.any(registry)
                    }
                }
            }
            InvocationTarget::Member(member) => registry.get(member),
            InvocationTarget::Connection(connection) => live(connection),
            InvocationTarget::Any => self.any(registry),
        }
    }

    fn connects_to_all_members(&self) -> bool {
        true
    }
}

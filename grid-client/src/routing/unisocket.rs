use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::info;

use grid_core::cluster_view::ClusterView;
use grid_remote::connection::Connection;
use grid_remote::registry::ConnectionRegistry;

use crate::routing::{live, InvocationTarget, TRouter};

/// Every request goes through one designated connection. A new one is picked,
/// the oldest live connection, only after the designated one died.
#[derive(Debug, Default)]
pub struct UnisocketRouter {
    designated: ArcSwapOption<Connection>,
}

impl UnisocketRouter {
    pub fn designated(&self, registry: &ConnectionRegistry) -> Option<Connection> {
        let current = self.designated.load_full();
        if let Some(connection) = current.as_deref().filter(|c| c.is_alive()) {
            return Some(connection.clone());
        }
        let next = registry.all().into_iter().next()?;
        let previous = self.designated.compare_and_swap(&current, Some(Arc::new(next.clone())));
        let swapped = match (&*previous, &current) {
            (Some(previous), Some(current)) => Arc::ptr_eq(previous, current),
            (None, None) => true,
            _ => false,
        };
        if swapped {
            info!("designated connection is now {}", next);
            return Some(next);
        }
        self.designated.load_full().map(|c| (*c).clone())
    }
}

impl TRouter for UnisocketRouter {
    fn route(&self, target: &InvocationTarget, _view: &ClusterView, registry: &ConnectionRegistry) -> Option<Connection> {
        match target {
            InvocationTarget::Connection(connection) => live(connection),
            InvocationTarget::Member(member) => registry.get(member),
            InvocationTarget::Partition(_) | InvocationTarget::Any => self.designated(registry),
        }
    }

    fn connects_to_all_members(&self) -> bool {
        false
    }
}

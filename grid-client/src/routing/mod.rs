use std::fmt::{Debug, Formatter};

use enum_dispatch::enum_dispatch;
use uuid::Uuid;

use grid_core::cluster_view::ClusterView;
use grid_remote::connection::Connection;
use grid_remote::registry::ConnectionRegistry;

use crate::routing::smart::SmartRouter;
use crate::routing::unisocket::UnisocketRouter;

pub mod smart;
pub mod unisocket;

/// Where an invocation should go.
#[derive(Debug, Clone)]
pub enum InvocationTarget {
    Partition(i32),
    Member(Uuid),
    Connection(Connection),
    Any,
}

#[enum_dispatch(Router)]
pub trait TRouter {
    /// Picks a live connection for `target`, `None` when nothing fits.
    fn route(&self, target: &InvocationTarget, view: &ClusterView, registry: &ConnectionRegistry) -> Option<Connection>;

    /// Whether the client keeps a connection to every member.
    fn connects_to_all_members(&self) -> bool;
}

#[enum_dispatch]
pub enum Router {
    SmartRouter,
    UnisocketRouter,
}

impl Router {
    pub fn new(smart_routing: bool) -> Self {
        if smart_routing {
            SmartRouter::default().into()
        } else {
            UnisocketRouter::default().into()
        }
    }
}

impl Debug for Router {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Router::SmartRouter(_) => f.debug_struct("SmartRouter").finish(),
            Router::UnisocketRouter(_) => f.debug_struct("UnisocketRouter").finish(),
        }
    }
}

fn live(connection: &Connection) -> Option<Connection> {
    connection.is_alive().then(|| connection.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use uuid::Uuid;

    use grid_core::cluster_view::ClusterView;
    use grid_core::message::CorrelationIds;
    use grid_remote::authenticator::Authenticator;
    use grid_remote::registry::ConnectionRegistry;
    use grid_remote::transport::Transport;

    use crate::routing::{InvocationTarget, Router, TRouter};

    fn empty_registry() -> ConnectionRegistry {
        let authenticator = Authenticator::builder()
            .cluster_name("dev")
            .client_uuid(Uuid::new_v4())
            .client_name("routing")
            .smart_routing(true)
            .build();
        let (registry, _) = ConnectionRegistry::new(
            Transport::plain(Duration::from_secs(1)),
            authenticator,
            Arc::new(CorrelationIds::new()),
            1 << 20,
        );
        registry
    }

    #[tokio::test]
    async fn test_nothing_to_route_to() {
        let registry = empty_registry();
        let view = ClusterView::default();
        for router in [Router::new(true), Router::new(false)] {
            assert!(router.route(&InvocationTarget::Any, &view, &registry).is_none());
            assert!(router.route(&InvocationTarget::Partition(3), &view, &registry).is_none());
            assert!(router.route(&InvocationTarget::Member(Uuid::new_v4()), &view, &registry).is_none());
        }
    }

    #[test]
    fn test_router_mode() {
        assert!(Router::new(true).connects_to_all_members());
        assert!(!Router::new(false).connects_to_all_members());
        assert_eq!(format!("{:?}", Router::new(false)), "UnisocketRouter");
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Statistics {
    invocations: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    retries: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    reconnects: AtomicU64,
    views_applied: AtomicU64,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub invocations: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retries: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub reconnects: u64,
    pub views_applied: u64,
    pub live_connections: usize,
    pub view_version: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Statistics {
    counter! {
        invocation_started => invocations,
        invocation_completed => completed,
        invocation_failed => failed,
        invocation_timed_out => timed_out,
        invocation_retried => retries,
        connection_opened => connections_opened,
        connection_closed => connections_closed,
        reconnect_started => reconnects,
        view_applied => views_applied,
    }

    pub fn snapshot(&self, live_connections: usize, view_version: u64) -> StatisticsSnapshot {
        StatisticsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            views_applied: self.views_applied.load(Ordering::Relaxed),
            live_connections,
            view_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::statistics::Statistics;

    #[test]
    fn test_snapshot() -> anyhow::Result<()> {
        let statistics = Statistics::default();
        statistics.invocation_started();
        statistics.invocation_started();
        statistics.invocation_completed();
        statistics.invocation_retried();
        let snapshot = statistics.snapshot(2, 7);
        assert_eq!(snapshot.invocations, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.live_connections, 2);
        let json = serde_json::to_value(&snapshot)?;
        assert_eq!(json["view_version"], 7);
        Ok(())
    }
}

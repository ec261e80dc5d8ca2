//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{upstream::Upstream, LoadBalancer};

/// Round-robin selector.
/// Stores an internal counter to rotate through servers.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, servers: &[Arc<Upstream>]) -> Option<Arc<Upstream>> {
        if servers.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % servers.len();
        Some(servers[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Server;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let s1 = Arc::new(Upstream::new(&Server::new("a", "http://127.0.0.1:8080")).unwrap());
        let s2 = Arc::new(Upstream::new(&Server::new("b", "http://127.0.0.1:8081")).unwrap());
        let servers = vec![s1, s2];

        assert_eq!(lb.next_server(&servers).unwrap().id(), "a");
        assert_eq!(lb.next_server(&servers).unwrap().id(), "b");
        assert_eq!(lb.next_server(&servers).unwrap().id(), "a");
    }

    #[test]
    fn empty_pool_yields_none() {
        assert!(RoundRobin::new().next_server(&[]).is_none());
    }
}

//! Concurrent request accounting per token.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Counters {
    connections: HashMap<String, u64>,
    total: u64,
}

/// Caps in-flight requests per token.
///
/// Counts never go negative and a token's entry is dropped once it reaches
/// zero.
#[derive(Debug)]
pub struct ConnectionLimiter {
    max_connections: u64,
    counters: Mutex<Counters>,
}

impl ConnectionLimiter {
    pub fn new(max_connections: u64) -> Self {
        Self {
            max_connections,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Admit `amount` more connections for `token`, or refuse without
    /// changing any count.
    pub fn try_acquire(&self, token: &str, amount: u64) -> bool {
        let mut counters = self.counters.lock().expect("connection limiter mutex poisoned");
        let current = counters.connections.get(token).copied().unwrap_or(0);
        if current.saturating_add(amount) > self.max_connections {
            return false;
        }
        counters.connections.insert(token.to_string(), current + amount);
        counters.total += amount;
        true
    }

    pub fn release(&self, token: &str, amount: u64) {
        let mut counters = self.counters.lock().expect("connection limiter mutex poisoned");
        let Some(count) = counters.connections.get_mut(token) else {
            tracing::warn!(token = %token, "Releasing connections of an unknown token");
            return;
        };
        let released = amount.min(*count);
        *count -= released;
        if *count == 0 {
            counters.connections.remove(token);
        }
        counters.total = counters.total.saturating_sub(released);
    }

    pub fn connections(&self, token: &str) -> u64 {
        let counters = self.counters.lock().expect("connection limiter mutex poisoned");
        counters.connections.get(token).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counters.lock().expect("connection limiter mutex poisoned").total
    }

    pub fn tracked(&self) -> usize {
        self.counters
            .lock()
            .expect("connection limiter mutex poisoned")
            .connections
            .len()
    }

    pub fn max_connections(&self) -> u64 {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_of_one() {
        let l = ConnectionLimiter::new(1);
        assert!(l.try_acquire("1.2.3.4", 1));
        assert!(!l.try_acquire("1.2.3.4", 1));
        assert!(l.try_acquire("5.6.7.8", 1));
        l.release("1.2.3.4", 1);
        assert!(l.try_acquire("1.2.3.4", 1));
        assert_eq!(l.total(), 2);
    }

    #[test]
    fn entry_removed_at_zero() {
        let l = ConnectionLimiter::new(3);
        assert!(l.try_acquire("a", 2));
        l.release("a", 1);
        assert_eq!(l.connections("a"), 1);
        l.release("a", 1);
        assert_eq!(l.tracked(), 0);
        assert_eq!(l.total(), 0);
    }

    #[test]
    fn never_negative() {
        let l = ConnectionLimiter::new(3);
        l.release("ghost", 1);
        assert!(l.try_acquire("a", 1));
        l.release("a", 5);
        assert_eq!(l.connections("a"), 0);
        assert_eq!(l.total(), 0);
    }

    #[test]
    fn rejection_does_not_mutate() {
        let l = ConnectionLimiter::new(2);
        assert!(l.try_acquire("a", 2));
        assert!(!l.try_acquire("a", 1));
        assert_eq!(l.connections("a"), 2);
        assert_eq!(l.total(), 2);
    }
}

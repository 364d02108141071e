use std::collections::VecDeque;
use std::sync::Mutex;

/// One turn dropped due to a fence integrity failure (spec §4.5). Never
/// sent to the model, never fed into memory extraction.
#[derive(Debug, Clone)]
pub struct QuarantinedTurn {
    pub session_id: String,
    pub record: String,
    pub reason: String,
}

/// Bounded ring buffer of quarantined turns, most-recent-first (spec §4.5,
/// §8 property 6 — "Quarantine FIFO"). Writes are rare and serialized
/// internally via a `Mutex`.
pub struct QuarantineStore {
    capacity: usize,
    items: Mutex<VecDeque<QuarantinedTurn>>,
}

impl QuarantineStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Insert a new turn at the front, evicting the oldest if over capacity.
    pub fn insert(&self, turn: QuarantinedTurn) {
        let mut items = self.items.lock().unwrap();
        items.push_front(turn);
        while items.len() > self.capacity {
            items.pop_back();
        }
    }

    pub fn count(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// The `n`-th most recently inserted item (1-indexed), or `None` if
    /// fewer than `n` items have been inserted.
    pub fn recent(&self, n: usize) -> Option<QuarantinedTurn> {
        if n == 0 {
            return None;
        }
        self.items.lock().unwrap().get(n - 1).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(id: &str) -> QuarantinedTurn {
        QuarantinedTurn {
            session_id: id.to_string(),
            record: format!("record-{id}"),
            reason: "fence violation".to_string(),
        }
    }

    #[test]
    fn fifo_capacity_and_most_recent_first() {
        let store = QuarantineStore::new(3);
        for i in 0..5 {
            store.insert(turn(&i.to_string()));
        }
        assert_eq!(store.count(), 3);
        // Most recently inserted was "4".
        assert_eq!(store.recent(1).unwrap().session_id, "4");
        assert_eq!(store.recent(3).unwrap().session_id, "2");
        assert!(store.recent(4).is_none());
    }
}

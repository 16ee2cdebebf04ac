//! Per-device issuance gate.
//!
//! Linearizes issuance, revocation and redelivery for one device id while
//! leaving other ids free to proceed. Separate from the identity store's
//! own locks so signing and delivery never hold a store lock. A device's
//! entry lives only while someone holds or waits on its gate.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

type Gate = Arc<Mutex<()>>;

#[derive(Debug, Default)]
pub struct IssuanceGate {
    gates: Mutex<HashMap<String, Gate>>,
}

/// Held for the duration of one issuance step on a device.
pub struct GateGuard<'a> {
    owner: &'a IssuanceGate,
    device_id: String,
    held: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        self.owner.release(&self.device_id);
    }
}

impl IssuanceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until this caller owns the gate for `device_id`.
    pub fn acquire(&self, device_id: &str) -> GateGuard<'_> {
        // Cloned under the map lock so `release` sees every waiter.
        let gate = {
            let mut gates = self.gates.lock();
            Arc::clone(gates.entry(device_id.to_string()).or_default())
        };
        GateGuard {
            owner: self,
            device_id: device_id.to_string(),
            held: Some(gate.lock_arc()),
        }
    }

    /// Number of device ids currently held or waited on.
    pub fn tracked(&self) -> usize {
        self.gates.lock().len()
    }

    fn release(&self, device_id: &str) {
        let mut gates = self.gates.lock();
        if gates
            .get(device_id)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(device_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_id_is_exclusive() {
        let gate = Arc::new(IssuanceGate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    let _guard = gate.acquire("dev-1");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(gate.tracked(), 0);
    }

    #[test]
    fn test_different_ids_do_not_block() {
        let gate = IssuanceGate::new();
        let _a = gate.acquire("dev-a");
        // Would deadlock if ids shared a lock.
        let _b = gate.acquire("dev-b");
        assert_eq!(gate.tracked(), 2);
    }

    #[test]
    fn test_released_ids_are_forgotten() {
        let gate = IssuanceGate::new();
        for n in 0..100 {
            let _guard = gate.acquire(&format!("dev-{}", n));
            assert_eq!(gate.tracked(), 1);
        }
        assert_eq!(gate.tracked(), 0);
    }

    #[test]
    fn test_waiter_keeps_entry_alive() {
        let gate = Arc::new(IssuanceGate::new());
        let first = gate.acquire("dev-1");

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _guard = gate.acquire("dev-1");
                gate.tracked()
            })
        };
        // Let the waiter block on the held gate.
        thread::sleep(Duration::from_millis(50));
        drop(first);

        assert_eq!(waiter.join().unwrap(), 1);
        assert_eq!(gate.tracked(), 0);
    }
}

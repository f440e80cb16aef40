use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

/// One mutex per volume group, created on first use and kept for the life of
/// the process. Mutations on different groups never contend.
#[derive(Default)]
pub struct VgLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VgLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, vg: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(vg.to_string()).or_default().clone()
    }

    /// Runs `f` as the single critical section for `vg`.
    pub fn with<R>(&self, vg: &str, f: impl FnOnce() -> R) -> R {
        let lock = self.get(vg);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn same_vg_is_serialized() {
        let locks = Arc::new(VgLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (locks, inside, max_seen) = (locks.clone(), inside.clone(), max_seen.clone());
                thread::spawn(move || {
                    locks.with("vg", || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_vgs_do_not_block_each_other() {
        let locks = VgLocks::new();
        let nested = locks.with("vg-a", || locks.with("vg-b", || 42));
        assert_eq!(nested, 42);
    }
}

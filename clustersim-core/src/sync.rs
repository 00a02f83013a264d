//! Process-wide critical section for threaded backends
//!
//! The default backend is single-threaded and never takes this lock. When a
//! backend runs its own threads, every entry into engine state from a
//! backend thread must hold the critical section.

use std::sync::atomic::{AtomicBool, Ordering};

/// A spin flag acquired with acquire semantics and released with release
/// semantics.
#[derive(Debug, Default)]
pub struct CriticalSection {
    flag: AtomicBool,
}

impl CriticalSection {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Spin until the flag is taken.
    pub fn enter(&self) -> CriticalGuard<'_> {
        while self
            .flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        CriticalGuard { cs: self }
    }
}

/// Releases the critical section on drop.
pub struct CriticalGuard<'a> {
    cs: &'a CriticalSection,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.cs.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_exclusive_entry() {
        let cs = Arc::new(CriticalSection::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cs = cs.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = cs.enter();
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}

//! TCP client quota.
//!
//! A listener carries a non-owning reference to a [`Quota`]; every accepted
//! connection acquires one token for its lifetime. When no token is
//! available the connection is refused at accept time and the registered
//! callback (if any) is invoked.

use std::sync::atomic::{AtomicUsize, Ordering::{AcqRel, Acquire, Relaxed}};
use std::sync::{Arc, Mutex, Weak};

pub type QuotaCb = Box<dyn Fn() + Send + Sync>;

pub struct Quota {
    me: Weak<Quota>,
    max: AtomicUsize,
    used: AtomicUsize,
    cb: Mutex<Option<QuotaCb>>,
}

impl Quota {
    pub fn new(max: usize) -> Arc<Quota> {
        Arc::new_cyclic(|me| Quota {
            me: me.clone(),
            max: AtomicUsize::new(max),
            used: AtomicUsize::new(0),
            cb: Mutex::new(None),
        })
    }

    /// Register a callback fired each time an acquire attempt is refused.
    pub fn set_callback(&self, cb: QuotaCb) {
        *self.cb.lock().unwrap() = Some(cb);
    }

    pub fn set_max(&self, max: usize) {
        self.max.store(max, Relaxed);
    }

    pub fn max(&self) -> usize {
        self.max.load(Relaxed)
    }

    pub fn used(&self) -> usize {
        self.used.load(Acquire)
    }

    /// Try to take one token. Returns a guard that releases the token on
    /// drop, or `None` (after firing the refusal callback) if the quota is
    /// exhausted.
    pub fn acquire(&self) -> Option<QuotaGuard> {
        let max = self.max.load(Relaxed);
        let mut used = self.used.load(Acquire);
        loop {
            if used >= max {
                if let Some(cb) = self.cb.lock().unwrap().as_ref() {
                    cb();
                }
                return None;
            }
            match self
                .used
                .compare_exchange(used, used + 1, AcqRel, Acquire)
            {
                Ok(_) => {
                    return Some(QuotaGuard {
                        quota: self.me.upgrade().expect("live quota upgrades"),
                    })
                }
                Err(cur) => used = cur,
            }
        }
    }
}

/// One acquired quota token; released when dropped.
pub struct QuotaGuard {
    quota: Arc<Quota>,
}

impl Drop for QuotaGuard {
    fn drop(&mut self) {
        self.quota.used.fetch_sub(1, AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    #[test]
    fn test_acquire_release_balance() {
        let q = Quota::new(2);
        let a = q.acquire().unwrap();
        let b = q.acquire().unwrap();
        assert!(q.acquire().is_none());
        assert_eq!(q.used(), 2);
        drop(a);
        assert_eq!(q.used(), 1);
        let c = q.acquire().unwrap();
        assert_eq!(q.used(), 2);
        drop(b);
        drop(c);
        assert_eq!(q.used(), 0);
    }

    #[test]
    fn test_refusal_callback_fires() {
        let q = Quota::new(1);
        let hits = Arc::new(Counter::new(0));
        let h = hits.clone();
        q.set_callback(Box::new(move || {
            h.fetch_add(1, Relaxed);
        }));
        let _g = q.acquire().unwrap();
        assert!(q.acquire().is_none());
        assert!(q.acquire().is_none());
        assert_eq!(hits.load(Relaxed), 2);
    }

    #[test]
    fn test_zero_quota_refuses_everything() {
        let q = Quota::new(0);
        assert!(q.acquire().is_none());
    }
}

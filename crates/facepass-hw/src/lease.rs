//! Process-wide exclusive claims on camera device paths.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

static HELD: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn held() -> &'static Mutex<HashSet<String>> {
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on one device path, released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    path: String,
}

impl DeviceLease {
    /// Claim `path`, or `None` if another owner in this process holds it.
    pub fn acquire(path: &str) -> Option<Self> {
        let mut held = held().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(path.to_string()) {
            return None;
        }
        tracing::debug!(device = path, "device lease acquired");
        Some(Self {
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_held(path: &str) -> bool {
        held()
            .lock()
            .map(|held| held.contains(path))
            .unwrap_or(false)
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut held = held().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.path);
        tracing::debug!(device = %self.path, "device lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let path = "/dev/lease-test-a";
        let lease = DeviceLease::acquire(path).unwrap();
        assert!(DeviceLease::is_held(path));
        assert!(DeviceLease::acquire(path).is_none());

        drop(lease);
        assert!(!DeviceLease::is_held(path));
        assert!(DeviceLease::acquire(path).is_some());
    }

    #[test]
    fn test_distinct_paths_are_independent() {
        let a = DeviceLease::acquire("/dev/lease-test-b").unwrap();
        let b = DeviceLease::acquire("/dev/lease-test-c").unwrap();
        assert_eq!(a.path(), "/dev/lease-test-b");
        assert_eq!(b.path(), "/dev/lease-test-c");
    }
}

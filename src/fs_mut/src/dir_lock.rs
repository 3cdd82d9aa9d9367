use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use lazy_static::lazy_static;

/// Process-wide registry of per-directory reader/writer locks, for
/// collaborators that operate on directories on the backing volume.
/// Acquisitions are refcounted; when the last guard drops, the whole
/// map is reset.

#[derive(Default)]
struct Registry {
    locks_out: u64,
    entries: HashMap<String, EntryState>,
}

#[derive(Default, Clone, Copy)]
struct EntryState {
    readers: u64,
    writer: bool,
}

struct DirLocks {
    mu: Mutex<Registry>,
    cond: Condvar,
}

lazy_static! {
    static ref DIR_LOCKS: DirLocks = DirLocks {
        mu: Mutex::new(Registry::default()),
        cond: Condvar::new(),
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Keep,
    Delete,
}

/// A held directory lock. Releases on drop.
pub struct DirLockGuard {
    dir: String,
    mode: LockMode,
}

/// Take a shared lock on `dir`. Holding it prevents the directory from
/// being deleted.
pub fn keep_directory_lock(dir: &str) -> DirLockGuard {
    let mut registry = DIR_LOCKS.mu.lock().unwrap();
    loop {
        let entry = registry.entries.entry(dir.to_string()).or_default();
        if !entry.writer {
            entry.readers += 1;
            registry.locks_out += 1;
            return DirLockGuard {
                dir: dir.to_string(),
                mode: LockMode::Keep,
            };
        }
        registry = DIR_LOCKS.cond.wait(registry).unwrap();
    }
}

/// Take an exclusive lock on `dir`, required while deleting it.
/// Excludes all shared holders.
pub fn delete_directory_lock(dir: &str) -> DirLockGuard {
    let mut registry = DIR_LOCKS.mu.lock().unwrap();
    loop {
        let entry = registry.entries.entry(dir.to_string()).or_default();
        if !entry.writer && entry.readers == 0 {
            entry.writer = true;
            registry.locks_out += 1;
            return DirLockGuard {
                dir: dir.to_string(),
                mode: LockMode::Delete,
            };
        }
        registry = DIR_LOCKS.cond.wait(registry).unwrap();
    }
}

impl Drop for DirLockGuard {
    fn drop(&mut self) {
        let mut registry = DIR_LOCKS.mu.lock().unwrap();
        if let Some(entry) = registry.entries.get_mut(&self.dir) {
            match self.mode {
                LockMode::Keep => entry.readers = entry.readers.saturating_sub(1),
                LockMode::Delete => entry.writer = false,
            }
        }
        registry.locks_out = registry.locks_out.saturating_sub(1);
        if registry.locks_out == 0 {
            registry.entries = HashMap::new();
        }
        drop(registry);
        DIR_LOCKS.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    // The registry is process-global; serialize the tests that inspect it.
    lazy_static! {
        static ref TEST_SERIAL: Mutex<()> = Mutex::new(());
    }

    fn registry_len() -> usize {
        DIR_LOCKS.mu.lock().unwrap().entries.len()
    }

    #[test]
    fn test_keep_locks_share() {
        let _serial = TEST_SERIAL.lock().unwrap();
        let a = keep_directory_lock("/data/shared");
        let b = keep_directory_lock("/data/shared");
        drop(a);
        drop(b);
        assert_eq!(registry_len(), 0);
    }

    #[test]
    fn test_delete_waits_for_keepers() {
        let _serial = TEST_SERIAL.lock().unwrap();
        let keep = keep_directory_lock("/data/busy");
        let (tx, rx) = mpsc::channel();
        let deleter = thread::spawn(move || {
            let _del = delete_directory_lock("/data/busy");
            tx.send(()).unwrap();
        });

        assert!(
            rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "delete lock must wait for the shared holder"
        );
        drop(keep);
        rx.recv_timeout(Duration::from_secs(5))
            .expect("delete lock acquired after keep released");
        deleter.join().unwrap();
    }

    #[test]
    fn test_registry_resets_when_idle() {
        let _serial = TEST_SERIAL.lock().unwrap();
        let a = keep_directory_lock("/data/a");
        let b = delete_directory_lock("/data/b");
        assert_eq!(registry_len(), 2);
        drop(a);
        assert_eq!(registry_len(), 2, "map persists while any lock is out");
        drop(b);
        assert_eq!(registry_len(), 0, "map resets once the last lock drops");
    }
}

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Guarded values are queues, lifecycle states and worker handles; a panic
/// elsewhere never leaves them half-updated.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_poisoned_mutex_still_yields_value() {
        // ---
        let shared = Arc::new(Mutex::new(vec![1]));
        let clone = shared.clone();
        let _ = std::thread::spawn(move || {
            let mut guard = clone.lock().unwrap();
            guard.push(2);
            panic!("poison the lock");
        })
        .join();

        assert!(shared.is_poisoned());
        lock_ignore_poison(&shared).push(3);
        assert_eq!(*lock_ignore_poison(&shared), vec![1, 2, 3]);
    }
}

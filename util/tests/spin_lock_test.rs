//! Test coverage of the spin lock.

use util::sync::SpinLock;

#[test]
fn test_mutual_exclusion() {
    let counter = SpinLock::new(0_u64);
    std::thread::scope(|s| {
        for _ in 0..8 {
            let counter = &counter;
            s.spawn(move || {
                for _ in 0..1000 {
                    *counter.lock() += 1;
                }
            });
        }
    });
    assert_eq!(
        counter.into_inner(),
        8000,
        "Increments under the lock should never be lost"
    );
}

#[test]
fn test_try_lock_contention() {
    let lock = SpinLock::new(());
    let guard = lock.lock();
    assert!(
        lock.try_lock().is_none(),
        "`try_lock` should fail while the lock is held"
    );
    drop(guard);
    assert!(
        lock.try_lock().is_some(),
        "`try_lock` should succeed after release"
    );
}

#[test]
fn test_exclusive_access_paths() {
    let mut lock = SpinLock::new(3_u32);
    *lock.get_mut() += 1;
    assert_eq!(*lock.lock(), 4);
    assert_eq!(lock.into_inner(), 4);
}

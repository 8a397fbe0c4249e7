#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicUsize, Ordering};
use loom::sync::{Arc, Mutex};
use loom::thread;
use tenantguard::rate_limit::{BucketConfig, TokenBucket};

// Every interleaving of three callers on a two-token bucket admits exactly two.
#[test]
fn bucket_critical_section_never_over_admits() {
    loom::model(|| {
        let config = BucketConfig::per_second(2, 1.0).unwrap();
        let bucket = Arc::new(Mutex::new(TokenBucket::full(&config, 0)));
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let bucket = bucket.clone();
                let admitted = admitted.clone();
                thread::spawn(move || {
                    if bucket.lock().unwrap().try_acquire(&config, 0).is_allowed() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 2);
        assert_eq!(bucket.lock().unwrap().tokens(), 0.0);
    });
}

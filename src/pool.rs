//! Bounded fan-out over scoped threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Run `f` over `items` on at most `limit` threads; results keep input order.
///
/// Workers pull the next index from a shared cursor, so a slow item never
/// holds up the others. A `limit` of 0 is treated as 1.
pub fn run_bounded<T, R, F>(items: &[T], limit: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let workers = limit.max(1).min(items.len());
    if workers <= 1 {
        return items.iter().map(&f).collect();
    }

    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<R>>> = Mutex::new(items.iter().map(|_| None).collect());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let idx = next.fetch_add(1, Ordering::Relaxed);
                    let Some(item) = items.get(idx) else {
                        return;
                    };
                    let result = f(item);
                    slots.lock().unwrap_or_else(PoisonError::into_inner)[idx] = Some(result);
                }
            });
        }
    });

    slots
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn preserves_input_order() {
        let items: Vec<u64> = (0..20).collect();
        let out = run_bounded(&items, 4, |&n| {
            std::thread::sleep(Duration::from_millis((20 - n) * 2));
            n * 10
        });
        assert_eq!(out, items.iter().map(|n| n * 10).collect::<Vec<_>>());
    }

    #[test]
    fn never_exceeds_the_limit() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items = vec![(); 16];
        run_bounded(&items, 3, |()| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn zero_limit_and_empty_input() {
        assert_eq!(run_bounded(&[1, 2], 0, |n| n + 1), [2, 3]);
        assert!(run_bounded(&[] as &[u8], 4, |n| *n).is_empty());
    }
}

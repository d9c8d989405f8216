use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BarrierError {
    #[error("barrier was broken while waiting")]
    Broken,
}

#[derive(Debug)]
struct BarrierState {
    count: usize,
    sense: bool,
    broken: bool,
}

/// A reusable barrier for a fixed number of parties that puts threads to
/// sleep.
///
/// Once broken, every current and future `wait` fails until the barrier is
/// dropped.
#[derive(Debug)]
pub struct SenseBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl SenseBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState {
                count: 0,
                sense: false,
                broken: false,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Blocks until `parties` threads have called this function.
    ///
    /// Returns `true` on exactly one thread per generation: the one that
    /// arrived last.
    pub fn wait(&self) -> Result<bool, BarrierError> {
        let mut state = self.state.lock();
        if state.broken {
            return Err(BarrierError::Broken);
        }

        let my_sense = state.sense;
        state.count += 1;

        if state.count >= self.parties {
            // LAST
            state.count = 0;
            state.sense = !my_sense;
            self.cvar.notify_all();
            return Ok(true);
        }

        // FOLLOWER; condvar wakeups may be spurious
        while state.sense == my_sense {
            if state.broken {
                return Err(BarrierError::Broken);
            }
            self.cvar.wait(&mut state);
        }
        Ok(false)
    }

    pub fn break_barrier(&self) {
        let mut state = self.state.lock();
        if !state.broken {
            state.broken = true;
            self.cvar.notify_all();
        }
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    /// Threads currently blocked in `wait`.
    pub fn waiting(&self) -> usize {
        self.state.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_party_never_blocks() {
        let barrier = SenseBarrier::new(1);
        assert_eq!(barrier.wait(), Ok(true));
        assert_eq!(barrier.wait(), Ok(true));
    }

    #[test]
    fn releases_all_parties_with_one_leader() {
        let barrier = Arc::new(SenseBarrier::new(4));
        let leaders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                let leaders = leaders.clone();
                thread::spawn(move || {
                    if barrier.wait().unwrap() {
                        leaders.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 1);
        assert_eq!(barrier.waiting(), 0);
    }

    #[test]
    fn is_reusable_across_generations() {
        let barrier = Arc::new(SenseBarrier::new(3));
        let crossings = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let barrier = barrier.clone();
                let crossings = crossings.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        barrier.wait().unwrap();
                        crossings.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(crossings.load(Ordering::SeqCst), 150);
    }

    #[test]
    fn breaking_releases_waiters_with_an_error() {
        let barrier = Arc::new(SenseBarrier::new(3));
        let waiter = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.wait())
        };

        while barrier.waiting() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        barrier.break_barrier();

        assert_eq!(waiter.join().unwrap(), Err(BarrierError::Broken));
        assert!(barrier.is_broken());
        assert_eq!(barrier.wait(), Err(BarrierError::Broken));
    }
}

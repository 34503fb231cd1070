//! Binary gate: at most one GPU submission outstanding

use flume::{Receiver, Sender};

/// A capacity-1 semaphore. The token lives in a bounded channel; holding a
/// [`GatePermit`] means holding the token.
#[derive(Debug)]
pub struct Gate {
    give: Sender<()>,
    take: Receiver<()>,
}

impl Gate {
    pub fn new() -> Self {
        let (give, take) = flume::bounded(1);
        let _ = give.try_send(());
        Self { give, take }
    }

    /// Block until the previous permit is released
    pub fn acquire(&self) -> GatePermit {
        // The gate owns a sender, so the channel never disconnects.
        let _ = self.take.recv();
        GatePermit {
            give: self.give.clone(),
        }
    }

    pub fn try_acquire(&self) -> Option<GatePermit> {
        self.take.try_recv().ok().map(|()| GatePermit {
            give: self.give.clone(),
        })
    }

    pub fn is_open(&self) -> bool {
        !self.take.is_empty()
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the token to its gate when dropped. Sendable, so it can ride
/// along with a GPU completion callback.
#[derive(Debug)]
#[must_use = "dropping the permit releases the gate"]
pub struct GatePermit {
    give: Sender<()>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let _ = self.give.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_permit() {
        let gate = Gate::new();
        let permit = gate.try_acquire();
        assert!(permit.is_some());
        assert!(gate.try_acquire().is_none());
        assert!(!gate.is_open());

        drop(permit);
        assert!(gate.is_open());
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn permit_released_from_another_thread() {
        let gate = Gate::new();
        let permit = gate.acquire();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(permit);
        });

        let _second = gate.acquire();
        releaser.join().unwrap();
    }

    #[test]
    fn holders_never_overlap() {
        let gate = Arc::new(Gate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let (gate, inside, peak) = (gate.clone(), inside.clone(), peak.clone());
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _permit = gate.acquire();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(gate.is_open());
    }
}

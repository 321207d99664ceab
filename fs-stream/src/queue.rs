use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Serializes operations issued against one stream.
///
/// At most one operation runs at a time; waiters proceed strictly in
/// arrival order. The queue has no failure modes of its own, it forwards
/// whatever the wrapped operation returns.
pub struct OpQueue {
    tickets: Mutex<Tickets>,
    turn: Condvar,
}

#[derive(Default)]
struct Tickets {
    issued: u64,
    serving: u64,
}

impl OpQueue {
    pub fn new() -> Self {
        Self {
            tickets: Mutex::new(Tickets::default()),
            turn: Condvar::new(),
        }
    }

    /// Run `op` once every earlier submission has finished.
    ///
    /// The ticket fixing this call's place in line is taken before any
    /// waiting happens, so arrival order is execution order. The ticket is
    /// retired even if `op` panics, so a failed operation never wedges the
    /// queue.
    pub fn run<T>(&self, op: impl FnOnce() -> T) -> T {
        let ticket = {
            let mut tickets = self.lock();
            let ticket = tickets.issued;
            tickets.issued += 1;
            while tickets.serving != ticket {
                tickets = self
                    .turn
                    .wait(tickets)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            ticket
        };
        debug_assert_eq!(ticket, self.lock().serving);

        let _turn = TurnGuard { queue: self };
        op()
    }

    /// Tickets issued but not yet retired, the running operation included.
    pub fn pending(&self) -> usize {
        let tickets = self.lock();
        (tickets.issued - tickets.serving) as usize
    }

    /// Total number of operations ever submitted.
    pub fn issued(&self) -> u64 {
        self.lock().issued
    }

    fn lock(&self) -> MutexGuard<'_, Tickets> {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for OpQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Retires the running ticket on drop, panicking operations included.
struct TurnGuard<'a> {
    queue: &'a OpQueue,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut tickets = self.queue.lock();
        tickets.serving += 1;
        drop(tickets);
        self.queue.turn.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_runs_immediately_when_idle() {
        let queue = OpQueue::new();
        assert_eq!(queue.run(|| 41 + 1), 42);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_fifo_completion_order() {
        let queue = Arc::new(OpQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u64 {
            handles.push(thread::spawn({
                let queue = queue.clone();
                let order = order.clone();
                move || {
                    queue.run(|| {
                        thread::sleep(Duration::from_millis(20));
                        order.lock().unwrap().push(i);
                    });
                }
            }));
            // Wait until this submission holds its ticket before issuing
            // the next one, so submission order is well-defined.
            while queue.issued() < i + 1 {
                thread::yield_now();
            }
        }

        for handle in handles {
            handle.join().expect("Thread panicked");
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_panicking_operation_releases_queue() {
        let queue = Arc::new(OpQueue::new());

        let inner = queue.clone();
        let result = thread::spawn(move || {
            inner.run(|| panic!("boom"));
        })
        .join();
        assert!(result.is_err());

        // The queue must still serve new submissions.
        assert_eq!(queue.run(|| "still alive"), "still alive");
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_error_results_are_forwarded() {
        let queue = OpQueue::new();
        let out: Result<(), &str> = queue.run(|| Err("op failed"));
        assert_eq!(out, Err("op failed"));
        // A failed operation still releases its ticket.
        assert_eq!(queue.run(|| 7), 7);
    }
}

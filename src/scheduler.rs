//! Off-thread timer service.
//!
//! The timer thread only keeps deadlines. Callbacks stay with the owner and
//! are handed back by [`SchedulingWorker::wait`] on the owner's thread, so
//! nothing that touches the device ever crosses threads. A fired timer is
//! honored only if its correlation id is the latest one issued; anything
//! older is dropped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

enum Request {
    Schedule { id: u64, delay: Duration },
    Close,
}

pub struct SchedulingWorker<T> {
    name: String,
    requests: Sender<Request>,
    fired: Receiver<u64>,
    handle: Option<JoinHandle<()>>,
    pending: Option<(u64, T)>,
}

impl<T> SchedulingWorker<T> {
    /// Start a timer thread named `name`
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (requests, request_rx) = mpsc::channel();
        let (fired_tx, fired) = mpsc::channel();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_timers(request_rx, fired_tx))?;

        tracing::debug!("Scheduling worker '{}' started", name);

        Ok(Self {
            name: name.to_string(),
            requests,
            fired,
            handle: Some(handle),
            pending: None,
        })
    }

    /// Arm a timer. `callback` is returned by [`wait`](Self::wait) once the
    /// delay elapses, unless a newer id has been scheduled meanwhile.
    pub fn schedule(&mut self, id: u64, delay: Duration, callback: T) {
        self.pending = Some((id, callback));
        if self.handle.is_none() {
            return;
        }
        if self.requests.send(Request::Schedule { id, delay }).is_err() {
            tracing::warn!("Scheduling worker '{}' is gone", self.name);
        }
    }

    /// Block until the latest scheduled callback is due.
    ///
    /// Returns `None` when nothing is pending or the worker is closed.
    pub fn wait(&mut self) -> Option<T> {
        loop {
            let expected = self.pending.as_ref()?.0;
            match self.fired.recv() {
                Ok(id) if id == expected => return self.pending.take().map(|(_, cb)| cb),
                Ok(id) => {
                    tracing::trace!("Worker '{}' dropped stale timer {}", self.name, id);
                }
                Err(_) => {
                    self.pending = None;
                    return None;
                }
            }
        }
    }

    /// Invalidate the pending callback without closing the worker
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Whether a callback is armed
    pub fn pending(&self) -> usize {
        usize::from(self.pending.is_some())
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Stop the timer thread. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.pending = None;
        if let Some(handle) = self.handle.take() {
            let _ = self.requests.send(Request::Close);
            if handle.join().is_err() {
                tracing::warn!("Scheduling worker '{}' panicked", self.name);
            }
            tracing::debug!("Scheduling worker '{}' closed", self.name);
        }
    }
}

impl<T> Drop for SchedulingWorker<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_timers(requests: Receiver<Request>, fired: Sender<u64>) {
    let mut timers: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while let Some(&Reverse((deadline, id))) = timers.peek() {
            if deadline > now {
                break;
            }
            timers.pop();
            if fired.send(id).is_err() {
                return;
            }
        }

        let request = match timers.peek() {
            Some(&Reverse((deadline, _))) => {
                match requests.recv_timeout(deadline.saturating_duration_since(now)) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match requests.recv() {
                Ok(request) => request,
                Err(_) => return,
            },
        };

        match request {
            Request::Schedule { id, delay } => timers.push(Reverse((Instant::now() + delay, id))),
            Request::Close => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_delay() {
        let mut worker = SchedulingWorker::spawn("test-timer").unwrap();
        let start = Instant::now();
        worker.schedule(1, Duration::from_millis(20), "tick");
        assert_eq!(worker.wait(), Some("tick"));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(worker.pending(), 0);
    }

    #[test]
    fn only_latest_id_is_honored() {
        let mut worker = SchedulingWorker::spawn("test-timer").unwrap();
        worker.schedule(1, Duration::ZERO, 1);
        worker.schedule(2, Duration::from_millis(10), 2);
        assert_eq!(worker.pending(), 1);
        assert_eq!(worker.wait(), Some(2));
    }

    #[test]
    fn cancelled_callback_never_returns() {
        let mut worker = SchedulingWorker::spawn("test-timer").unwrap();
        worker.schedule(7, Duration::ZERO, ());
        worker.cancel();
        assert_eq!(worker.wait(), None);
    }

    #[test]
    fn close_is_idempotent() {
        let mut worker: SchedulingWorker<()> = SchedulingWorker::spawn("test-timer").unwrap();
        worker.close();
        worker.close();
        assert!(worker.is_closed());
        worker.schedule(1, Duration::ZERO, ());
        assert_eq!(worker.wait(), None);
    }
}

//! Coalescing trigger: at most one reconciliation runs, at most one waits.
//!
//! Triggers go through a single-slot channel with a non-blocking send. While
//! the worker is busy and the slot is taken, further triggers are dropped
//! rather than queued, so a slow build never builds up a backlog.

use std::ops::ControlFlow;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

/// Outcome of a trigger attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Handed to the worker (or parked in the single waiting slot).
    Accepted,
    /// Worker busy and a trigger already waiting; this one was dropped.
    Coalesced,
    /// The worker is gone.
    Closed,
}

/// Cloneable handle used to trigger the worker.
#[derive(Debug)]
pub struct Trigger<T> {
    tx: SyncSender<T>,
}

impl<T> Clone for Trigger<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Trigger<T> {
    pub fn beat(&self, payload: T) -> Beat {
        match self.tx.try_send(payload) {
            Ok(()) => Beat::Accepted,
            Err(TrySendError::Full(_)) => {
                debug!("worker busy, trigger coalesced");
                Beat::Coalesced
            }
            Err(TrySendError::Disconnected(_)) => Beat::Closed,
        }
    }
}

/// Receiving side, consumed by [`run_worker`].
#[derive(Debug)]
pub struct Inbox<T> {
    rx: Receiver<T>,
}

impl<T> Inbox<T> {
    /// Take the waiting trigger, if any, without blocking.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

pub fn channel<T>() -> (Trigger<T>, Inbox<T>) {
    let (tx, rx) = sync_channel(1);
    (Trigger { tx }, Inbox { rx })
}

/// Run `work` for every accepted trigger until every [`Trigger`] is dropped
/// or `work` asks to stop. Errors are logged and the loop carries on.
pub fn run_worker<T, F>(inbox: Inbox<T>, mut work: F)
where
    F: FnMut(T) -> Result<ControlFlow<()>>,
{
    while let Ok(payload) = inbox.rx.recv() {
        match work(payload) {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => {
                info!("worker stopping");
                return;
            }
            Err(err) => error!(err = %format!("{err:#}"), "reconciliation failed"),
        }
    }
    debug!("all triggers dropped, worker exiting");
}

/// Beat `trigger` immediately and then every `period` until the worker
/// goes away.
pub fn spawn_ticker<T, F>(trigger: Trigger<T>, period: Duration, mut payload: F) -> Result<JoinHandle<()>>
where
    T: Send + 'static,
    F: FnMut() -> T + Send + 'static,
{
    thread::Builder::new()
        .name("ticker".to_string())
        .spawn(move || {
            loop {
                if trigger.beat(payload()) == Beat::Closed {
                    debug!("worker closed, ticker exiting");
                    return;
                }
                thread::sleep(period);
            }
        })
        .context("spawn ticker thread")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use anyhow::anyhow;

    use super::*;

    #[test]
    fn busy_worker_coalesces_rapid_triggers() {
        let (trigger, inbox) = channel::<usize>();
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let executed = Arc::new(AtomicUsize::new(0));

        let worker = {
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            let executed = Arc::clone(&executed);
            thread::spawn(move || {
                run_worker(inbox, |n| {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    started_tx.send(n).expect("started");
                    gate_rx.recv().expect("gate");
                    executed.fetch_add(1, Ordering::SeqCst);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(ControlFlow::Continue(()))
                });
            })
        };

        assert_eq!(trigger.beat(1), Beat::Accepted);
        assert_eq!(started_rx.recv().expect("first run"), 1);

        let beats: Vec<Beat> = (2..=10).map(|n| trigger.beat(n)).collect();
        assert_eq!(beats[0], Beat::Accepted);
        assert!(beats[1..].iter().all(|b| *b == Beat::Coalesced));

        gate_tx.send(()).expect("release first");
        assert_eq!(started_rx.recv().expect("second run"), 2);
        gate_tx.send(()).expect("release second");

        drop(trigger);
        worker.join().expect("join");
        assert_eq!(executed.load(Ordering::SeqCst), 2);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn errors_do_not_stop_the_worker() {
        let (trigger, inbox) = channel::<u32>();
        let seen = Arc::new(AtomicUsize::new(0));
        let worker = {
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                run_worker(inbox, |n| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if n == 1 {
                        Err(anyhow!("fetch failed"))
                    } else {
                        Ok(ControlFlow::Continue(()))
                    }
                });
            })
        };
        for n in 1..=2 {
            while trigger.beat(n) != Beat::Accepted {
                thread::yield_now();
            }
        }
        drop(trigger);
        worker.join().expect("join");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn break_stops_the_worker_and_closes_triggers() {
        let (trigger, inbox) = channel::<()>();
        let worker = thread::spawn(move || run_worker(inbox, |()| Ok(ControlFlow::Break(()))));
        assert_eq!(trigger.beat(()), Beat::Accepted);
        worker.join().expect("join");
        assert_eq!(trigger.beat(()), Beat::Closed);
    }

    #[test]
    fn ticker_beats_until_worker_is_gone() {
        let (trigger, inbox) = channel::<()>();
        let ticker = spawn_ticker(trigger, Duration::from_millis(1), || ()).expect("spawn");
        let mut runs = 0;
        run_worker(inbox, |()| {
            runs += 1;
            Ok(if runs == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            })
        });
        ticker.join().expect("ticker exits");
        assert_eq!(runs, 3);
    }
}

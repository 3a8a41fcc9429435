// Delivery of read results on the host's preferred context

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tracing::debug;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Posts a job to the host's preferred execution context (a UI thread, an
/// event loop, ...). Implementations must not run the job inline on the
/// caller when that would re-enter the worker.
pub trait Notifier: Send + Sync {
    fn post(&self, job: Job);
}

/// Runs jobs on whichever thread posts them
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineNotifier;

impl Notifier for InlineNotifier {
    fn post(&self, job: Job) {
        job();
    }
}

/// Forwards jobs over a channel to a [`NotifyPump`] owned by the preferred thread
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: Sender<Job>,
}

impl ChannelNotifier {
    pub fn new() -> (ChannelNotifier, NotifyPump) {
        let (tx, rx) = mpsc::channel();
        (ChannelNotifier { tx }, NotifyPump { rx })
    }
}

impl Notifier for ChannelNotifier {
    fn post(&self, job: Job) {
        if self.tx.send(job).is_err() {
            debug!("Notify pump dropped, discarding callback");
        }
    }
}

impl fmt::Debug for ChannelNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelNotifier").finish_non_exhaustive()
    }
}

/// Receiving end of a [`ChannelNotifier`]; the owning thread runs the jobs
pub struct NotifyPump {
    rx: Receiver<Job>,
}

impl NotifyPump {
    /// Run every job already posted, returning how many ran
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for one job and run it
    pub fn run_one(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => {
                job();
                true
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }
}

impl fmt::Debug for NotifyPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyPump").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn test_inline_notifier_runs_immediately() {
        let hit = Arc::new(Mutex::new(false));
        let hit2 = Arc::clone(&hit);
        InlineNotifier.post(Box::new(move || *hit2.lock().unwrap() = true));
        assert!(*hit.lock().unwrap());
    }

    #[test]
    fn test_channel_notifier_runs_on_pump_thread() {
        let (notifier, pump) = ChannelNotifier::new();
        let seen = Arc::new(Mutex::new(None));

        let seen2 = Arc::clone(&seen);
        thread::spawn(move || {
            notifier.post(Box::new(move || {
                *seen2.lock().unwrap() = Some(thread::current().id());
            }));
        })
        .join()
        .unwrap();

        assert!(seen.lock().unwrap().is_none());
        assert_eq!(pump.run_pending(), 1);
        assert_eq!(*seen.lock().unwrap(), Some(thread::current().id()));
    }

    #[test]
    fn test_pump_run_one_times_out() {
        let (_notifier, pump) = ChannelNotifier::new();
        assert!(!pump.run_one(Duration::from_millis(10)));
    }

    #[test]
    fn test_post_after_pump_dropped_is_ignored() {
        let (notifier, pump) = ChannelNotifier::new();
        drop(pump);
        notifier.post(Box::new(|| panic!("must not run")));
    }
}

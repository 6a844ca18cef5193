//! Asynchronous event processing on a dedicated worker thread.
//!
//! Many producers hand items to a single consumer which processes them in
//! submission order (per producer) on its own thread. The consumer drains
//! items in batches, so a burst of submissions wakes the worker once rather
//! than once per item.
//!
//! Failure handling is strict: the first handler error stops the worker,
//! drops everything still queued, and is then reported from every later
//! [`submit`](EventProcessor::submit) and from [`stop`](EventProcessor::stop).

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::ProcessorError;

/// Upper bound on how many queued items the worker takes per wakeup.
const MAX_BATCH: usize = 1024;

struct Shared {
    running: AtomicBool,
    failure: Mutex<Option<Arc<anyhow::Error>>>,
}

impl Shared {
    fn record_failure(&self, error: anyhow::Error) {
        let mut slot = self.failure.lock().expect("failure lock poisoned");
        // Only the first failure is pinned.
        if slot.is_none() {
            *slot = Some(Arc::new(error));
        }
        self.running.store(false, Ordering::Release);
    }

    fn failure(&self) -> Option<Arc<anyhow::Error>> {
        self.failure.lock().expect("failure lock poisoned").clone()
    }
}

/// A multi-producer single-consumer processor.
///
/// Items submitted from any thread are handed to a single handler running on
/// a dedicated worker thread. Items from one producer are processed in the
/// order they were submitted.
pub struct EventProcessor<T> {
    name: String,
    sender: Option<Sender<T>>,
    done: Receiver<()>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl<T: Send + 'static> EventProcessor<T> {
    /// Spawn the worker thread and return a handle for submitting items.
    pub fn spawn<F>(name: &str, handler: F) -> Result<Self, ProcessorError>
    where
        F: FnMut(T) -> anyhow::Result<()> + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let (done_sender, done) = crossbeam_channel::bounded(1);

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            failure: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                run_worker(receiver, handler, &worker_shared);
                // Dropping the sender signals `stop` that the queue is drained.
                drop(done_sender);
            })
            .map_err(|source| ProcessorError::Spawn {
                name: name.to_string(),
                source,
            })?;

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            done,
            worker: Some(worker),
            shared,
        })
    }

    /// Queue an item for the worker.
    ///
    /// Returns without waiting for the item to be processed. If the handler
    /// has already failed, the original failure is returned instead and the
    /// item is discarded.
    pub fn submit(&self, item: T) -> Result<(), ProcessorError> {
        if let Some(source) = self.shared.failure() {
            return Err(ProcessorError::Failed {
                name: self.name.clone(),
                source,
            });
        }
        let sender = self.sender.as_ref().ok_or_else(|| ProcessorError::Stopped {
            name: self.name.clone(),
        })?;
        sender.send(item).map_err(|_| {
            // The worker is gone. Either it failed between our check above
            // and the send, or it was aborted.
            match self.shared.failure() {
                Some(source) => ProcessorError::Failed {
                    name: self.name.clone(),
                    source,
                },
                None => ProcessorError::Stopped {
                    name: self.name.clone(),
                },
            }
        })
    }

    /// Stop accepting items, wait for the queue to drain, then shut the
    /// worker down.
    ///
    /// If the queue does not drain within `timeout`, or the handler failed
    /// at any point, that is reported as an error.
    pub fn stop(mut self, timeout: Duration) -> Result<(), ProcessorError> {
        // Closing the channel lets the worker finish the backlog and exit.
        drop(self.sender.take());

        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                // Leave the worker detached, joining a stuck handler would
                // turn the timeout into a hang.
                self.worker.take();
                return Err(ProcessorError::StopTimeout {
                    name: self.name.clone(),
                    timeout,
                });
            }
        }

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        match self.shared.failure() {
            Some(source) => Err(ProcessorError::Failed {
                name: self.name.clone(),
                source,
            }),
            None => Ok(()),
        }
    }

    /// Shut the worker down without draining, discarding queued items.
    pub fn abort(mut self) {
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<T> Drop for EventProcessor<T> {
    fn drop(&mut self) {
        // No-op after `stop` or `abort`, both take the worker handle.
        self.shared.running.store(false, Ordering::Release);
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker<T, F>(receiver: Receiver<T>, mut handler: F, shared: &Shared)
where
    F: FnMut(T) -> anyhow::Result<()>,
{
    // Blocks until an item arrives or every producer hung up.
    'outer: while let Ok(first) = receiver.recv() {
        if !shared.running.load(Ordering::Acquire) {
            // Aborted, drop whatever is left.
            break;
        }

        let mut batch = Vec::with_capacity(16);
        batch.push(first);
        while batch.len() < MAX_BATCH {
            match receiver.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }

        for item in batch {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(item)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => error,
                Err(payload) => {
                    anyhow::anyhow!("Handler panicked: {}", crate::utils::panic_message(&*payload))
                }
            };
            shared.record_failure(error);
            break 'outer;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn processes_every_item_before_stop() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let processor = EventProcessor::spawn("test", move |_: u32| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        for item in 0..100 {
            processor.submit(item).unwrap();
        }
        processor.stop(Duration::from_secs(5)).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn accepts_items_from_many_threads() {
        const THREADS: usize = 8;
        const ITEMS: usize = 250;

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let processor = EventProcessor::spawn("test", move |_: usize| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for item in 0..ITEMS {
                        processor.submit(item).unwrap();
                    }
                });
            }
        });
        processor.stop(Duration::from_secs(5)).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), THREADS * ITEMS);
    }

    #[test]
    fn preserves_per_producer_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let processor = EventProcessor::spawn("test", move |item: u32| {
            sink.lock().unwrap().push(item);
            Ok(())
        })
        .unwrap();

        for item in 0..1000 {
            processor.submit(item).unwrap();
        }
        processor.stop(Duration::from_secs(5)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn first_failure_is_pinned() {
        let processor = EventProcessor::spawn("test", move |item: u32| {
            if item == 3 {
                anyhow::bail!("item {item} is broken");
            }
            Ok(())
        })
        .unwrap();

        for item in 0..10 {
            // Submission may already observe the failure depending on timing.
            if processor.submit(item).is_err() {
                break;
            }
        }

        // Eventually every submit reports the pinned failure.
        let error = loop {
            match processor.submit(99) {
                Ok(()) => std::thread::yield_now(),
                Err(error) => break error,
            }
        };
        assert!(matches!(error, ProcessorError::Failed { .. }));
        assert!(error.to_string().contains("item 3 is broken"));

        let error = processor.stop(Duration::from_secs(5)).unwrap_err();
        assert!(error.to_string().contains("item 3 is broken"));
    }

    #[test]
    fn abort_discards_queued_items() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let (started_sender, started) = crossbeam_channel::bounded::<()>(1);
        let (gate_sender, gate) = crossbeam_channel::bounded::<()>(0);
        let processor = EventProcessor::spawn("test", move |_: u32| {
            // Park the worker on the first item so the rest stay queued.
            let _ = started_sender.try_send(());
            let _ = gate.recv();
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        processor.submit(0).unwrap();
        started.recv().unwrap();
        for item in 1..100 {
            processor.submit(item).unwrap();
        }

        std::thread::scope(|scope| {
            // Abort raises the shutdown flag first, then blocks joining the
            // parked worker until the gate opens.
            scope.spawn(move || processor.abort());
            std::thread::sleep(Duration::from_millis(100));
            drop(gate_sender);
        });

        // The worker finished the item it held and dropped the other 99.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_times_out_on_a_stuck_handler() {
        let (gate_sender, gate) = crossbeam_channel::bounded::<()>(0);
        let processor = EventProcessor::spawn("test", move |_: u32| {
            let _ = gate.recv();
            Ok(())
        })
        .unwrap();

        processor.submit(1).unwrap();
        let error = processor.stop(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(error, ProcessorError::StopTimeout { .. }));

        // Release the parked worker so the thread can exit.
        drop(gate_sender);
    }

    #[test]
    fn handler_panic_is_reported_as_failure() {
        let processor = EventProcessor::spawn("test", move |_: u32| -> anyhow::Result<()> {
            panic!("boom");
        })
        .unwrap();

        processor.submit(1).ok();
        let error = processor.stop(Duration::from_secs(5)).unwrap_err();
        assert!(error.to_string().contains("boom"));
    }
}

//! Command stream machinery for the host device: per-stream worker
//! threads, completion events, and download handles.

use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use super::DeviceError;

enum EventState {
    Pending,
    Complete,
    Failed(DeviceError),
}

struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

/// Completion marker for a point in a command stream.
///
/// An event completes once every command issued to its stream before the
/// record has executed. If the stream faulted first, the event carries the
/// fault instead.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(crate) fn new() -> Self {
        Event {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    pub(crate) fn complete(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = EventState::Complete;
        self.inner.cond.notify_all();
    }

    pub(crate) fn fail(&self, err: DeviceError) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = EventState::Failed(err);
        self.inner.cond.notify_all();
    }

    /// Blocks the calling thread until the event resolves.
    pub fn wait(&self) -> Result<(), DeviceError> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match &*state {
                EventState::Pending => {
                    state = self
                        .inner
                        .cond
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
                EventState::Complete => return Ok(()),
                EventState::Failed(err) => return Err(err.clone()),
            }
        }
    }

    /// Non-blocking probe; `None` while still pending.
    pub fn poll(&self) -> Option<Result<(), DeviceError>> {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            EventState::Pending => None,
            EventState::Complete => Some(Ok(())),
            EventState::Failed(err) => Some(Err(err.clone())),
        }
    }
}

/// Handle to an in-flight device-to-host copy.
pub struct Download {
    pub(crate) bytes: Arc<Mutex<Option<Vec<u8>>>>,
    pub(crate) done: Event,
}

impl Download {
    /// Blocks until the copy lands and takes the bytes.
    pub fn wait(self) -> Result<Vec<u8>, DeviceError> {
        self.done.wait()?;
        let mut slot = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        slot.take()
            .ok_or_else(|| DeviceError::Fault("download completed without data".into()))
    }

    /// Completion event of the underlying copy.
    pub fn event(&self) -> &Event {
        &self.done
    }
}

pub(crate) enum Command {
    Task {
        label: &'static str,
        run: Box<dyn FnOnce() -> Result<(), DeviceError> + Send>,
    },
    Record(Event),
    WaitFor(Event),
    Synchronize(SyncSender<Option<DeviceError>>),
    Shutdown,
}

/// One in-order command stream backed by a worker thread.
///
/// A failed command leaves the stream faulted: subsequent tasks are
/// skipped and subsequent events fail with the same error, until a
/// `Synchronize` reports the fault and clears it.
pub(crate) struct StreamQueue {
    tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl StreamQueue {
    pub(crate) fn spawn(index: u32) -> Self {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(format!("peregrine-stream-{index}"))
            .spawn(move || worker(rx))
            .ok();
        StreamQueue { tx, handle }
    }

    pub(crate) fn sender(&self) -> Sender<Command> {
        self.tx.clone()
    }
}

impl Drop for StreamQueue {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker(rx: Receiver<Command>) {
    let mut fault: Option<DeviceError> = None;
    while let Ok(command) = rx.recv() {
        match command {
            Command::Task { label, run } => {
                if fault.is_some() {
                    continue;
                }
                if let Err(err) = run() {
                    let detail = match err {
                        DeviceError::Fault(message) => message,
                        other => other.to_string(),
                    };
                    fault = Some(DeviceError::Fault(format!("{label}: {detail}")));
                }
            }
            Command::Record(event) => match &fault {
                Some(err) => event.fail(err.clone()),
                None => event.complete(),
            },
            Command::WaitFor(event) => {
                if fault.is_none() {
                    if let Err(err) = event.wait() {
                        fault = Some(err);
                    }
                }
            }
            Command::Synchronize(ack) => {
                let _ = ack.send(fault.take());
            }
            Command::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_completes_after_record() {
        let queue = StreamQueue::spawn(0);
        let event = Event::new();
        queue
            .sender()
            .send(Command::Record(event.clone()))
            .expect("send");
        event.wait().expect("event");
    }

    #[test]
    fn fault_skips_later_tasks_and_clears_on_synchronize() {
        let queue = StreamQueue::spawn(1);
        let tx = queue.sender();
        let ran = Arc::new(Mutex::new(false));

        tx.send(Command::Task {
            label: "boom",
            run: Box::new(|| Err(DeviceError::Fault("injected".into()))),
        })
        .expect("send");
        let ran_in_task = Arc::clone(&ran);
        tx.send(Command::Task {
            label: "after",
            run: Box::new(move || {
                *ran_in_task.lock().unwrap() = true;
                Ok(())
            }),
        })
        .expect("send");

        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        tx.send(Command::Synchronize(ack_tx)).expect("send");
        let fault = ack_rx.recv().expect("ack");
        assert!(fault.is_some(), "synchronize should surface the fault");
        assert!(!*ran.lock().unwrap(), "faulted stream must skip tasks");

        // The fault is cleared: the stream accepts new work again.
        let event = Event::new();
        tx.send(Command::Record(event.clone())).expect("send");
        event.wait().expect("stream should be healthy after sync");
    }
}

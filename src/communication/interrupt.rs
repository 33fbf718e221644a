//! ## Interrupt
//!
//! The interrupt-in pipe and the completion slot a blocked transfer waits on.
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, trace, warn};

use crate::board::lock;
use crate::codec::{self, InterruptFlags};
use crate::constants::misc::{INTERRUPT_BUFFER_SIZE, INTERRUPT_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::types::Endpoint;
use crate::usb::UsbLink;

/// What wakes a transfer blocked on the completion slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Interrupt(InterruptFlags),
    Cancelled,
}

/// ### Completion Slot
///
/// At most one transfer waits here at a time. The listener thread and
/// [`abort`](crate::board::Board::abort) post into it; the mutex doubles as
/// the interrupt allocation lock.
///
#[derive(Debug, Default)]
pub struct CompletionSlot {
    pending: Mutex<Option<Sender<Completion>>>,
}

impl CompletionSlot {
    pub fn new() -> CompletionSlot {
        CompletionSlot::default()
    }

    /// Register the calling transfer, replacing any stale registration
    pub fn register(&self) -> CompletionWaiter<'_> {
        let (tx, rx) = bounded(2);
        *lock(&self.pending) = Some(tx);
        CompletionWaiter { slot: self, rx }
    }

    /// Post to the waiting transfer. Returns `false` if nobody is waiting.
    pub fn notify(&self, completion: Completion) -> bool {
        match lock(&self.pending).as_ref() {
            Some(tx) => match tx.try_send(completion) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }

    fn clear(&self) {
        *lock(&self.pending) = None;
    }
}

/// ### Completion Waiter
///
/// Receiving end of a registration; unregisters when dropped.
///
#[derive(Debug)]
pub struct CompletionWaiter<'a> {
    slot: &'a CompletionSlot,
    rx: Receiver<Completion>,
}

impl CompletionWaiter<'_> {
    /// ### Wait
    ///
    /// Block until a completion carrying any of `wanted` arrives, the
    /// transfer is cancelled, or `timeout` expires.
    ///
    pub fn wait(&self, wanted: InterruptFlags, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        loop {
            let received = match deadline {
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                Some(deadline) => self.rx.recv_deadline(deadline),
            };
            match received {
                Ok(Completion::Interrupt(flags)) if flags.intersects(wanted) => return Ok(()),
                Ok(Completion::Interrupt(_)) => continue,
                Ok(Completion::Cancelled) => return Err(Error::Aborted),
                Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Aborted),
            }
        }
    }
}

impl Drop for CompletionWaiter<'_> {
    fn drop(&mut self) {
        self.slot.clear();
    }
}

/// ### Interrupt Listener
///
/// Thread reading the interrupt-in pipe and handing every packet to a
/// handler. Stops when dropped.
///
#[derive(Debug)]
pub struct InterruptListener {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl InterruptListener {
    pub fn spawn<L, F>(
        name: String,
        link: Arc<L>,
        endpoint: &Endpoint,
        on_interrupt: F,
    ) -> Result<InterruptListener>
    where
        L: UsbLink,
        F: Fn(InterruptFlags) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let address = endpoint.address;
        let thread = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(name)
                .spawn(move || listen(&*link, address, &stop, on_interrupt))
                .map_err(|e| Error::Spawn(e.to_string()))?
        };

        Ok(InterruptListener {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("interrupt listener panicked");
            }
        }
    }
}

impl Drop for InterruptListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen<L: UsbLink>(link: &L, address: u8, stop: &AtomicBool, on_interrupt: impl Fn(InterruptFlags)) {
    let mut buffer = [0u8; INTERRUPT_BUFFER_SIZE];
    while !stop.load(Ordering::SeqCst) {
        match link.read_interrupt(address, &mut buffer, INTERRUPT_POLL_INTERVAL) {
            Ok(count) => {
                let flags = codec::decode_interrupt(&buffer[..count]);
                trace!("interrupt {flags:?}");
                on_interrupt(flags);
            }
            Err(rusb::Error::Timeout) => {}
            Err(rusb::Error::NoDevice) => {
                warn!("adapter disappeared, interrupt listener exiting");
                break;
            }
            Err(e) => {
                debug!("interrupt read failed: {e}");
                std::thread::sleep(INTERRUPT_POLL_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AdapterEndpoints;
    use crate::usb::mock::MockLink;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn waiter_receives_wanted_completion() {
        let slot = CompletionSlot::new();
        let waiter = slot.register();
        assert!(slot.notify(Completion::Interrupt(InterruptFlags::READ_COMPLETE)));
        assert!(slot.notify(Completion::Interrupt(InterruptFlags::WRITE_COMPLETE)));
        assert_eq!(
            waiter.wait(InterruptFlags::WRITE_COMPLETE, Some(Duration::from_millis(50))),
            Ok(())
        );
    }

    #[test]
    fn waiter_times_out_and_unregisters() {
        let slot = CompletionSlot::new();
        {
            let waiter = slot.register();
            assert_eq!(
                waiter.wait(InterruptFlags::WRITE_COMPLETE, Some(Duration::from_millis(5))),
                Err(Error::Timeout)
            );
        }
        assert!(!slot.notify(Completion::Cancelled));
    }

    #[test]
    fn cancellation_wakes_waiter() {
        let slot = Arc::new(CompletionSlot::new());
        let canceller = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                slot.notify(Completion::Cancelled)
            })
        };
        let waiter = slot.register();
        assert_eq!(waiter.wait(InterruptFlags::WRITE_COMPLETE, None), Err(Error::Aborted));
        assert!(canceller.join().unwrap());
    }

    #[test]
    fn listener_forwards_packets() {
        let link = MockLink::new();
        let endpoints = AdapterEndpoints::for_product(0x0718);
        let seen = Arc::new(AtomicUsize::new(0));
        let mut listener = {
            let seen = Arc::clone(&seen);
            InterruptListener::spawn(
                "test-interrupt".to_string(),
                Arc::clone(&link),
                &endpoints.interrupt_in,
                move |flags| {
                    if flags.contains(InterruptFlags::SRQ) {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                },
            )
            .unwrap()
        };
        link.raise_interrupt(&[0x01, 0, 0, 0]);
        let start = std::time::Instant::now();
        while seen.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(1));
        }
        listener.stop();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}

//! The thread parked on the exception port

use crate::installer::Shared;
use crate::kernel::{Backend, ExceptionChannel, FaultReply, Incoming, TaskPorts, ThreadControl};
use crate::{Error, FaultEvent, ThreadHandle};
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

/// Where the monitor thread is in its (single) lifetime
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    /// Blocked waiting for a message
    Waiting = 0,
    /// Running the catch protocol, other threads may be suspended
    Handling = 1,
    /// Past the callback, uninstalling and replying
    Finishing = 2,
    /// Torn down from another thread while handling
    Terminated = 3,
}

impl From<u8> for Phase {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Waiting,
            1 => Self::Handling,
            2 => Self::Finishing,
            _ => Self::Terminated,
        }
    }
}

/// State shared between a monitor thread and whoever uninstalls it
pub(crate) struct MonitorSlot {
    phase: AtomicU8,
    /// The kernel handle of the monitor thread, needed to terminate it
    thread: parking_lot::Mutex<Option<ThreadHandle>>,
}

impl MonitorSlot {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Waiting as u8),
            thread: parking_lot::Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn phase(&self) -> Phase {
        self.phase.load(Ordering::Acquire).into()
    }

    /// Moves from one phase to another, failing with the actual phase if it
    /// wasn't `from`
    #[inline]
    pub(crate) fn transition(&self, from: Phase, to: Phase) -> Result<(), Phase> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Phase::from)
    }

    #[inline]
    pub(crate) fn kernel_thread(&self) -> Option<ThreadHandle> {
        *self.thread.lock()
    }
}

/// The handle to a running monitor thread
pub(crate) struct Monitor {
    pub(crate) handle: std::thread::JoinHandle<()>,
    pub(crate) slot: Arc<MonitorSlot>,
    /// The install generation this monitor belongs to
    pub(crate) generation: u64,
}

impl Monitor {
    /// True if called from the monitor thread itself, eg. from the user
    /// callback or the catch protocol
    #[inline]
    pub(crate) fn is_current(&self) -> bool {
        self.handle.thread().id() == std::thread::current().id()
    }
}

/// Spawns the monitor thread for an install generation
pub(crate) fn spawn<B: Backend>(
    shared: Arc<Shared<B>>,
    channel: B::Channel,
    event: Arc<dyn FaultEvent>,
    generation: u64,
) -> Result<Monitor, Error> {
    let slot = Arc::new(MonitorSlot::new());
    let thread_slot = slot.clone();

    let handle = std::thread::Builder::new()
        .name(shared.options.thread_name.clone())
        .spawn(move || {
            run(&shared, &thread_slot, channel, event.as_ref(), generation);
        })?;

    Ok(Monitor {
        handle,
        slot,
        generation,
    })
}

/// Waits on the exception port until either an exception arrives, which is
/// then handled inline, or we are told to shut down
fn run<B: Backend>(
    shared: &Shared<B>,
    slot: &MonitorSlot,
    mut channel: B::Channel,
    event: &dyn FaultEvent,
    generation: u64,
) {
    *slot.thread.lock() = Some(shared.backend.threads().current());
    let own_task = shared.backend.ports().task();

    loop {
        let request = match channel.receive() {
            Ok(Incoming::Fault(request)) => request,
            Ok(Incoming::Shutdown { generation: target }) if target == generation => {
                log::debug!("monitor for install {generation} shutting down");
                return;
            }
            Ok(Incoming::Shutdown { generation: stale }) => {
                log::debug!("monitor for install {generation} ignoring shutdown for {stale}");
                continue;
            }
            Err(err) => {
                log::debug!("failed to receive on exception port, retrying: {err}");
                continue;
            }
        };

        // A child forked with the exception port installed will send its
        // exceptions to us. They are none of our business, but the child
        // still needs a reply so the kernel moves on to its next handler.
        if request.task != own_task {
            log::debug!("forwarding exception from task {:#x}", request.task);
            if let Err(err) = channel.send(&FaultReply::not_handled(&request)) {
                log::error!("failed to reply to foreign exception: {err}");
            }
            if let Err(err) = channel.release(&request) {
                log::warn!("failed to release foreign exception rights: {err}");
            }
            continue;
        }

        if let Err(phase) = slot.transition(Phase::Waiting, Phase::Handling) {
            log::warn!("monitor received exception while {phase:?}");
        }

        crate::catch::catch(shared, slot, &channel, event, &request);
        return;
    }
}

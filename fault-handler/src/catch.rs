use crate::installer::Shared;
use crate::kernel::{Backend, ExceptionChannel, FaultMessage, FaultReply, ThreadControl};
use crate::monitor::{MonitorSlot, Phase};
use crate::{FaultEvent, ThreadHandle, debug_print};
use std::panic::{self, AssertUnwindSafe};

/// Handles an exception from the current task on the monitor thread.
///
/// 1. Suspends every other thread
/// 2. Invokes the user callback
/// 3. Resumes the threads
/// 4. Uninstalls the exception port, restoring the previous ports
/// 5. Replies to the kernel that we did _not_ handle the exception, so it
///    moves on to the (now restored) previous handler
/// 6. Drops the thread and task rights the message carried
pub(crate) fn catch<B: Backend>(
    shared: &Shared<B>,
    slot: &MonitorSlot,
    channel: &B::Channel,
    event: &dyn FaultEvent,
    request: &FaultMessage,
) {
    let cc = request.context();

    let outcome = {
        let _ss = ScopedSuspend::new(shared.backend.threads(), request.thread);
        debug_print!("caught exception, process is frozen");

        panic::catch_unwind(AssertUnwindSafe(|| event.on_fault(&cc)))
    };

    if outcome.is_err() {
        log::error!("fault callback panicked, the exception is forwarded regardless");
    }

    // If someone else beat us to it they have already uninstalled, and we
    // were supposed to have been terminated
    match slot.transition(Phase::Handling, Phase::Finishing) {
        Ok(()) => shared.uninstall(),
        Err(phase) => log::warn!("monitor was torn down while handling ({phase:?})"),
    }

    let reply = FaultReply::not_handled(request);
    if let Err(err) = channel.send(&reply) {
        log::error!("failed to reply to exception: {err}");
    }
    if let Err(err) = channel.release(request) {
        log::warn!("failed to release exception rights: {err}");
    }
}

/// Suspends every thread in the task other than the current one for its
/// lifetime
struct ScopedSuspend<'tc, T: ThreadControl> {
    threads: &'tc T,
    suspended: Vec<ThreadHandle>,
}

impl<'tc, T: ThreadControl> ScopedSuspend<'tc, T> {
    fn new(threads: &'tc T, faulting: ThreadHandle) -> Self {
        let all = match threads.threads() {
            Ok(all) => all,
            Err(err) => {
                // Only the faulting thread's stack is guaranteed accurate now,
                // anything running elsewhere keeps running
                log::warn!("{err}, only the faulting thread will be suspended");
                vec![faulting]
            }
        };

        let this_thread = threads.current();

        // The capacity is reserved up front so nothing allocates once threads
        // start being suspended
        let mut suspended = Vec::with_capacity(all.len());

        for thread in all {
            if thread == this_thread {
                continue;
            }

            // We try to suspend all threads as a best effort, it's not fatal
            // if we can't
            if threads.suspend(thread).is_ok() {
                suspended.push(thread);
            } else {
                debug_print!("failed to suspend thread");
            }
        }

        Self { threads, suspended }
    }
}

impl<T: ThreadControl> Drop for ScopedSuspend<'_, T> {
    fn drop(&mut self) {
        for thread in &self.suspended {
            if self.threads.resume(*thread).is_err() {
                debug_print!("failed to resume thread");
            }
        }
    }
}

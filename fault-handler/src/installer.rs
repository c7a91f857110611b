use crate::kernel::{
    Backend, EXCEPTION_DEFAULT, ExceptionChannel, ExceptionMask, MACH_EXCEPTION_CODES, PortName,
    TaskPorts, ThreadControl,
};
use crate::monitor::{self, Monitor, Phase};
use crate::{Error, ExceptionClass, ExceptionPortSet, FaultEvent, debug_print};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Configures how the exception port is installed
#[derive(Clone, Debug)]
pub struct Options {
    /// Install even if the process is being traced.
    ///
    /// Debuggers rely on the same exception ports, so this is only useful for
    /// tracing the handler itself. The breakpoint class is not intercepted
    /// when this is set so that breakpoints keep working, however the
    /// debugger will no longer see any of the other exceptions.
    ///
    /// Defaults to whether the `ignore-debugger` feature is enabled.
    pub ignore_debugger: bool,
    /// The name given to the monitor thread
    pub thread_name: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            ignore_debugger: cfg!(feature = "ignore-debugger"),
            thread_name: "fault-handler".to_owned(),
        }
    }
}

impl Options {
    /// The exceptions that we want to handle
    pub fn exception_mask(&self) -> ExceptionMask {
        let mask = ExceptionClass::BadAccess.mask()
            | ExceptionClass::BadInstruction.mask()
            | ExceptionClass::Arithmetic.mask()
            | ExceptionClass::Software.mask();

        // Debuggers implement breakpoints and stepping via EXC_BREAKPOINT (on
        // arm64 that is a `brk #1`), intercepting it breaks them
        if self.ignore_debugger {
            mask
        } else {
            mask | ExceptionClass::Breakpoint.mask()
        }
    }
}

/// The lifecycle state of an [`Installer`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// No exception port is installed
    Uninstalled,
    /// Our exception port is installed and waiting for an exception
    Installed,
    /// An exception has been received and is being handled
    Handling,
}

pub(crate) struct InstallState {
    /// The ports registered before we installed ours
    previous: Option<ExceptionPortSet>,
    /// The port we receive exceptions on. This is never deallocated, as
    /// destroying a port the kernel has a pending exception for breaks
    /// delivery of that exception to any other handler, even restored ones
    endpoint: Option<PortName>,
    monitor: Option<Monitor>,
    generation: u64,
}

pub(crate) struct Shared<B: Backend> {
    pub(crate) backend: B,
    pub(crate) options: Options,
    /// Only written with `state` locked, but read without it so that it can be
    /// queried from the fault callback
    installed: AtomicBool,
    state: parking_lot::Mutex<InstallState>,
}

impl<B: Backend> Shared<B> {
    /// Tears down the monitor thread and restores the previous exception
    /// ports. Safe to call at any point, including from the monitor thread
    pub(crate) fn uninstall(&self) {
        let to_join = {
            let mut state = self.state.lock();

            // Called from the fault callback, every other thread is suspended
            // so nothing below may log or allocate
            let frozen = state.monitor.as_ref().is_some_and(|monitor| {
                monitor.is_current() && monitor.slot.phase() == Phase::Handling
            });

            let to_join = match state.monitor.take() {
                Some(monitor) => self.stop_monitor(monitor, &mut state.endpoint),
                None => None,
            };

            if let Some(previous) = state.previous.take() {
                let failed = previous.restore(self.backend.ports(), frozen);
                if failed > 0 && !frozen {
                    log::error!(
                        "failed to restore {failed} of {} exception ports",
                        previous.len()
                    );
                }
            }

            if self.installed.swap(false, Ordering::AcqRel) {
                if frozen {
                    debug_print!("uninstalled exception port");
                } else {
                    log::debug!("uninstalled exception port");
                }
            }

            to_join
        };

        // Joined outside of the lock, a monitor that is finishing up needs
        // it to run its own uninstall
        if let Some(monitor) = to_join {
            if monitor.handle.join().is_err() {
                log::error!("monitor thread panicked");
            }
        }
    }

    /// Stops the monitor, returning it if it needs to be joined
    fn stop_monitor(&self, monitor: Monitor, endpoint: &mut Option<PortName>) -> Option<Monitor> {
        // Called from the callback or the catch protocol, which will finish
        // by itself
        if monitor.is_current() {
            return None;
        }

        match monitor.slot.transition(Phase::Handling, Phase::Terminated) {
            Ok(()) => {
                // It could be halfway through suspending/resuming threads or
                // about to send a reply, so it can't be asked nicely. This
                // loses the reply for this exception, but the ports are still
                // restored for any that follow
                if let Some(thread) = monitor.slot.kernel_thread() {
                    if let Err(err) = self.backend.threads().terminate(thread) {
                        log::error!("failed to terminate monitor thread: {err}");
                    }
                }
                None
            }
            Err(Phase::Waiting) => {
                let port = (*endpoint)?;
                match self.backend.channel(port).wake(monitor.generation) {
                    Ok(()) => Some(monitor),
                    Err(err) => {
                        // The monitor stays parked on the port, so it can't
                        // be handed to the next install
                        log::error!(
                            "failed to wake monitor thread, abandoning exception port {port:#x}: {err}"
                        );
                        *endpoint = None;
                        None
                    }
                }
            }
            Err(Phase::Finishing) => Some(monitor),
            Err(Phase::Handling | Phase::Terminated) => None,
        }
    }
}

/// Installs and uninstalls the task exception port.
///
/// The exception ports of a task are a process wide resource, so only one
/// installer should be in use at a time, and calls to [`Self::install`] and
/// [`Self::uninstall`] are not expected to race with one another, though they
/// are serialized internally regardless.
///
/// Dropping the installer uninstalls it.
pub struct Installer<B: Backend> {
    shared: Arc<Shared<B>>,
}

impl<B: Backend> Installer<B> {
    #[inline]
    pub fn new(backend: B) -> Self {
        Self::with_options(backend, Options::default())
    }

    pub fn with_options(backend: B, options: Options) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                options,
                installed: AtomicBool::new(false),
                state: parking_lot::Mutex::new(InstallState {
                    previous: None,
                    endpoint: None,
                    monitor: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Installs our exception port, spawning a monitor thread that will invoke
    /// `event` when an exception occurs.
    ///
    /// Does nothing if already installed, or if the process is being traced
    /// unless [`Options::ignore_debugger`] is set. Failures are logged, and
    /// any changes made up to that point are rolled back.
    pub fn install(&self, event: Box<dyn FaultEvent>) {
        let mut state = self.shared.state.lock();

        if self.shared.installed.load(Ordering::Acquire) {
            log::debug!("exception port is already installed");
            return;
        }

        if !self.shared.options.ignore_debugger && self.shared.backend.is_traced() {
            log::warn!("process is being traced, the exception port will not be installed");
            return;
        }

        self.shared.installed.store(true, Ordering::Release);

        if let Err(err) = self.try_install(&mut state, event) {
            log::error!("failed to install exception port: {err}");
            drop(state);
            self.shared.uninstall();
        }
    }

    fn try_install(
        &self,
        state: &mut InstallState,
        event: Box<dyn FaultEvent>,
    ) -> Result<(), Error> {
        let backend = &self.shared.backend;
        let ports = backend.ports();
        let mask = self.shared.options.exception_mask();

        state.previous = Some(ExceptionPortSet::capture(ports, mask)?);

        let endpoint = if let Some(endpoint) = state.endpoint {
            endpoint
        } else {
            let endpoint = ports.allocate_receive_right()?;
            ports.insert_send_right(endpoint)?;
            state.endpoint = Some(endpoint);
            endpoint
        };

        ports.set_exception_ports(
            mask,
            endpoint,
            EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES,
            B::THREAD_STATE_NONE,
        )?;

        state.generation += 1;
        state.monitor = Some(monitor::spawn(
            self.shared.clone(),
            backend.channel(endpoint),
            Arc::from(event),
            state.generation,
        )?);

        log::debug!("installed exception port {endpoint:#x} for mask {mask:#x}");
        Ok(())
    }

    /// Uninstalls our exception port, restoring the ones that were registered
    /// before [`Self::install`].
    ///
    /// Does nothing if not installed. This can be called from the
    /// [`FaultEvent`] callback, but note that it takes the same lock as
    /// [`Self::install`], [`Self::uninstall`] and [`Self::state`], so if one
    /// of those was in progress on a thread that has been suspended for the
    /// callback, this deadlocks.
    #[inline]
    pub fn uninstall(&self) {
        self.shared.uninstall();
    }

    /// Lock free, so can be called from anywhere, including the
    /// [`FaultEvent`] callback
    #[inline]
    pub fn is_installed(&self) -> bool {
        self.shared.installed.load(Ordering::Acquire)
    }

    /// Takes the install lock, see [`Self::uninstall`] for why calling this
    /// from the [`FaultEvent`] callback is not a good idea
    pub fn state(&self) -> State {
        let state = self.shared.state.lock();

        if !self.shared.installed.load(Ordering::Acquire) {
            State::Uninstalled
        } else if state
            .monitor
            .as_ref()
            .is_some_and(|monitor| monitor.slot.phase() == Phase::Handling)
        {
            State::Handling
        } else {
            State::Installed
        }
    }
}

impl<B: Backend> Drop for Installer<B> {
    fn drop(&mut self) {
        self.shared.uninstall();
    }
}

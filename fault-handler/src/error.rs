use crate::kernel::{KERN_SUCCESS, KernReturn};

/// An error that can occur while installing, servicing, or uninstalling the
/// exception port
///
/// These are only ever logged, a fault handler must not change the control
/// flow of the application it is embedded in.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A kernel call returned something other than `KERN_SUCCESS`
    #[error("kernel call failed with {0} ({0:#x})")]
    Kernel(KernReturn),
    /// Sending or receiving a message on a port failed
    #[error("mach_msg failed with {0:#x}")]
    Message(KernReturn),
    /// A message with an id we don't understand arrived on the exception port
    #[error("received unknown message {0}")]
    UnknownMessage(i32),
    /// Enumerating the threads of the task failed
    #[error("unable to enumerate task threads: {0}")]
    Threads(KernReturn),
    /// An I/O or other syscall failed, eg. spawning the monitor thread
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
#[inline]
pub(crate) fn kern_ret(func: impl FnOnce() -> KernReturn) -> Result<(), Error> {
    let res = func();

    if res == KERN_SUCCESS {
        Ok(())
    } else {
        Err(Error::Kernel(res))
    }
}

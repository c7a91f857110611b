mod channel;
mod ffi;
mod ports;
mod threads;

use crate::kernel::{Backend, Flavor, PortName};
use crate::{FaultEvent, Installer};
use std::sync::OnceLock;

pub use channel::MachChannel;
pub use ports::MachPorts;
pub use threads::MachThreads;

/// The kernel capabilities of the current task on Macos
#[derive(Default)]
pub struct MachBackend {
    ports: MachPorts,
    threads: MachThreads,
}

impl Backend for MachBackend {
    type Ports = MachPorts;
    type Threads = MachThreads;
    type Channel = MachChannel;

    const THREAD_STATE_NONE: Flavor = ffi::THREAD_STATE_NONE;

    #[inline]
    fn ports(&self) -> &Self::Ports {
        &self.ports
    }

    #[inline]
    fn threads(&self) -> &Self::Threads {
        &self.threads
    }

    #[inline]
    fn channel(&self, port: PortName) -> Self::Channel {
        MachChannel::new(port)
    }

    fn is_traced(&self) -> bool {
        let mut info = std::mem::MaybeUninit::<libc::proc_bsdinfo>::uninit();
        let size = std::mem::size_of::<libc::proc_bsdinfo>() as i32;

        // SAFETY: syscall
        unsafe {
            if libc::proc_pidinfo(
                libc::getpid(),
                libc::PROC_PIDTBSDINFO,
                0,
                info.as_mut_ptr().cast(),
                size,
            ) != size
            {
                // Assume we're not being debugged, the worst case is that the
                // debugger stops seeing exceptions
                log::warn!(
                    "unable to determine if the process is being traced: {}",
                    std::io::Error::last_os_error()
                );
                return false;
            }

            info.assume_init().pbi_flags & ffi::PROC_FLAG_TRACED != 0
        }
    }
}

/// The exception ports are a per-process resource, so there's one installer
/// for the process
static INSTALLER: OnceLock<Installer<MachBackend>> = OnceLock::new();

/// Installs the exception port for the current process, see
/// [`Installer::install`]
pub fn install(event: Box<dyn FaultEvent>) {
    INSTALLER
        .get_or_init(|| Installer::new(MachBackend::default()))
        .install(event);
}

/// Uninstalls the exception port for the current process, see
/// [`Installer::uninstall`]
pub fn uninstall() {
    if let Some(installer) = INSTALLER.get() {
        installer.uninstall();
    }
}

/// True if the exception port is currently installed for the current process
pub fn is_installed() -> bool {
    INSTALLER.get().is_some_and(Installer::is_installed)
}

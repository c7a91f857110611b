use crate::kernel::{Behavior, ExceptionMask, Flavor, PortName, TaskPorts};
use crate::Error;

/// Number of top level exception types
///
/// This is platform independent, but located the `<arch>/exception.h`
pub const EXC_TYPES_COUNT: usize = 14;

/// A previously registered exception port
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PreviousPort {
    /// The exceptions the port is masking
    pub mask: ExceptionMask,
    /// The port that is sent messages when the exception occurs
    pub port: PortName,
    /// The way in which the exception is raised
    pub behavior: Behavior,
    /// The CPU context included with the exception
    pub flavor: Flavor,
}

/// The exception port configuration of the task, as it was before we
/// installed our own port
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExceptionPortSet {
    count: usize,
    ports: [PreviousPort; EXC_TYPES_COUNT],
}

impl ExceptionPortSet {
    /// Retrieves the ports currently registered for every exception in `mask`
    pub fn capture<P: TaskPorts + ?Sized>(
        task_ports: &P,
        mask: ExceptionMask,
    ) -> Result<Self, Error> {
        task_ports.get_exception_ports(mask)
    }

    /// Appends a port, returning false if the set is already full
    pub fn push(&mut self, port: PreviousPort) -> bool {
        if self.count == EXC_TYPES_COUNT {
            return false;
        }

        self.ports[self.count] = port;
        self.count += 1;
        true
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &PreviousPort> {
        self.ports[..self.count].iter()
    }

    /// Registers each of the ports again, returning how many failed.
    ///
    /// Failures are skipped, restoring some of the ports is better than
    /// restoring none of them. They are logged unless `frozen` is set, in
    /// which case every other thread is suspended and the logger can't be
    /// touched.
    pub fn restore<P: TaskPorts + ?Sized>(&self, task_ports: &P, frozen: bool) -> usize {
        let mut failed = 0;
        for pp in self.iter() {
            if let Err(err) =
                task_ports.set_exception_ports(pp.mask, pp.port, pp.behavior, pp.flavor)
            {
                if frozen {
                    crate::debug_print!("failed to restore exception port");
                } else {
                    log::error!(
                        "failed to restore exception port {:#x} for mask {:#x}: {err}",
                        pp.port,
                        pp.mask
                    );
                }
                failed += 1;
            }
        }

        failed
    }
}

use super::ffi::*;
use crate::error::kern_ret;
use crate::kernel::{Behavior, ExceptionMask, Flavor, PortName, TaskPorts};
use crate::{EXC_TYPES_COUNT, Error, ExceptionPortSet, PreviousPort};

/// The exception ports of the current task
#[derive(Default)]
pub struct MachPorts;

impl TaskPorts for MachPorts {
    #[inline]
    fn task(&self) -> PortName {
        // SAFETY: syscall
        unsafe { mach_task_self() }
    }

    fn get_exception_ports(&self, mask: ExceptionMask) -> Result<ExceptionPortSet, Error> {
        let mut count = EXC_TYPES_COUNT as u32;
        let mut masks = [0; EXC_TYPES_COUNT];
        let mut ports = [0; EXC_TYPES_COUNT];
        let mut behaviors = [0; EXC_TYPES_COUNT];
        let mut flavors = [0; EXC_TYPES_COUNT];

        // SAFETY: syscall, the arrays are the size we tell the kernel they are
        kern_ret(|| unsafe {
            task_get_exception_ports(
                mach_task_self(),
                mask,
                masks.as_mut_ptr(),
                &mut count,
                ports.as_mut_ptr(),
                behaviors.as_mut_ptr(),
                flavors.as_mut_ptr(),
            )
        })?;

        let mut previous = ExceptionPortSet::default();
        for i in 0..(count as usize).min(EXC_TYPES_COUNT) {
            previous.push(PreviousPort {
                mask: masks[i],
                port: ports[i],
                behavior: behaviors[i],
                flavor: flavors[i],
            });
        }

        Ok(previous)
    }

    fn set_exception_ports(
        &self,
        mask: ExceptionMask,
        port: PortName,
        behavior: Behavior,
        flavor: Flavor,
    ) -> Result<(), Error> {
        // SAFETY: syscall
        kern_ret(|| unsafe {
            task_set_exception_ports(mach_task_self(), mask, port, behavior, flavor)
        })
    }

    fn allocate_receive_right(&self) -> Result<PortName, Error> {
        let mut name = MACH_PORT_NULL;

        // SAFETY: syscall
        kern_ret(|| unsafe {
            mp::mach_port_allocate(mach_task_self(), port::MACH_PORT_RIGHT_RECEIVE, &mut name)
        })?;

        Ok(name)
    }

    fn insert_send_right(&self, port: PortName) -> Result<(), Error> {
        // SAFETY: syscall
        kern_ret(|| unsafe {
            mp::mach_port_insert_right(mach_task_self(), port, port, msg::MACH_MSG_TYPE_MAKE_SEND)
        })
    }
}

//! The Mach bindings that aren't in `mach2`, along with the layouts of the
//! messages sent and received on the exception port. These are lifted from
//! headers in usr/include/mach, each one notes the specific header it can be
//! located in

pub use mach2::{
    exception_types as et,
    kern_return::{KERN_SUCCESS, kern_return_t},
    mach_init::mach_thread_self,
    mach_port as mp, mach_types as mt, message as msg,
    port::{self, MACH_PORT_NULL, mach_port_t},
    task, thread_act, thread_status as ts,
    traps::mach_task_self,
    vm,
};

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        pub const THREAD_STATE_NONE: ts::thread_state_flavor_t = 13;
    } else if #[cfg(any(target_arch = "arm", target_arch = "aarch64"))] {
        pub const THREAD_STATE_NONE: ts::thread_state_flavor_t = 5;
    }
}

/// `PROC_FLAG_TRACED` from `sys/proc_info.h`, set in `proc_bsdinfo::pbi_flags`
/// while the process is being debugged
pub const PROC_FLAG_TRACED: u32 = 0x2;

#[repr(i32)]
pub enum MessageIds {
    /// Message ID telling the monitor thread to quit.
    Shutdown = 2,
    /// Taken from mach_exc in /usr/include/mach/exc.defs.
    Exception = crate::kernel::MACH_EXCEPTION_RAISE,
}

impl TryFrom<i32> for MessageIds {
    type Error = i32;

    fn try_from(val: i32) -> Result<Self, Self::Error> {
        Ok(match val {
            2 => Self::Shutdown,
            crate::kernel::MACH_EXCEPTION_RAISE => Self::Exception,
            unknown => return Err(unknown),
        })
    }
}

/// Network Data Representation Record
///
/// ndr.h
#[repr(C)]
#[derive(Copy, Clone)]
pub struct NDR_record_t {
    pub mig_vers: u8,
    pub if_vers: u8,
    pub reserved1: u8,
    pub mig_encoding: u8,
    pub int_rep: u8,
    pub char_rep: u8,
    pub float_rep: u8,
    pub reserved2: u8,
}

/// `__Request__mach_exception_raise_t` from the MIG generated `mach_exc.h`,
/// which is packed to 4 bytes, so the 64-bit codes are not naturally aligned.
///
/// The trailing padding is large enough for the biggest thread state the
/// kernel could send along with it, even though we don't ask for one.
#[repr(C, packed(4))]
pub struct ExceptionMessage {
    pub header: msg::mach_msg_header_t,
    pub body: msg::mach_msg_body_t,
    pub thread: msg::mach_msg_port_descriptor_t,
    pub task: msg::mach_msg_port_descriptor_t,
    pub ndr: NDR_record_t,
    pub exception: et::exception_type_t,
    pub code_count: msg::mach_msg_type_number_t,
    pub code: [i64; 2],
    pub padding: [u8; 1024],
}

/// The reply to an [`ExceptionMessage`].
///
/// `mig_errors.h`
#[repr(C)]
pub struct ExceptionRaiseReply {
    pub header: msg::mach_msg_header_t,
    pub ndr: NDR_record_t,
    pub ret_code: kern_return_t,
}

/// Sent by the installer to the exception port to tell a waiting monitor
/// thread to exit
#[repr(C)]
pub struct ShutdownMessage {
    pub header: msg::mach_msg_header_t,
    pub generation: u64,
}

extern "C" {
    /// Retrieves the currently registered exception ports for each exception
    /// in the mask. The output is 4 distinct arrays, which are basically a
    /// structure of arrays, each entry of which can cover multiple exceptions
    /// if they share the same port, behavior, and flavor.
    ///
    /// task.h
    pub fn task_get_exception_ports(
        task: mt::task_t,                          // The task we want the ports for
        exception_mask: et::exception_mask_t,      // The exceptions we want the ports for
        masks: *mut et::exception_mask_t,          // Output array of each exception mask that has a registered port
        masks_count: *mut u32,                     // In: capacity of the arrays, out: the number of entries filled
        old_handlers: *mut mach_port_t,            // Output array of ports that are registered
        old_behaviors: *mut et::exception_behavior_t, // Output array of behaviors
        old_flavors: *mut ts::thread_state_flavor_t,  // Output array of thread flavors
    ) -> kern_return_t;

    /// Sets a new exception port for the specified exception.
    ///
    /// task.h
    pub fn task_set_exception_ports(
        task: mt::task_t,                      // The task we want to set the port for
        exception_mask: et::exception_mask_t,  // The exception we want to set the port for
        new_port: mach_port_t,                 // The new port to receive exceptions on
        behavior: et::exception_behavior_t,    // The exception behavior when send to the port
        new_flavor: ts::thread_state_flavor_t, // What CPU context info to send with the exception
    ) -> kern_return_t;

    /// Destroys the thread, without any of the cleanup that would normally
    /// happen when it exits
    ///
    /// thread_act.h
    pub fn thread_terminate(target_act: mt::thread_act_t) -> kern_return_t;

    /// The host? NDR
    ///
    /// <arch>/ndr_def.h
    pub static NDR_record: NDR_record_t;
}

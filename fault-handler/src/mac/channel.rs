use super::ffi::*;
use crate::Error;
use crate::error::kern_ret;
use crate::kernel::{ExceptionChannel, FaultMessage, FaultReply, Incoming, MessageHeader, PortName};
use std::mem;

/// The exception port, which we hold both the receive and a send right for
pub struct MachChannel {
    port: mach_port_t,
}

impl MachChannel {
    #[inline]
    pub(super) fn new(port: PortName) -> Self {
        Self { port }
    }
}

impl ExceptionChannel for MachChannel {
    fn receive(&mut self) -> Result<Incoming, Error> {
        // SAFETY: ExceptionMessage is POD and mach_msg is a syscall
        unsafe {
            let mut request: ExceptionMessage = mem::zeroed();
            let size = mem::size_of_val(&request) as u32;

            let kret = msg::mach_msg(
                &mut request.header,
                msg::MACH_RCV_MSG,
                0,
                size,
                self.port,
                msg::MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            );

            if kret != msg::MACH_MSG_SUCCESS {
                return Err(Error::Message(kret));
            }

            let header = request.header;

            match MessageIds::try_from(header.msgh_id) {
                Ok(MessageIds::Exception) => Ok(Incoming::Fault(FaultMessage {
                    header: MessageHeader {
                        bits: header.msgh_bits,
                        remote_port: header.msgh_remote_port,
                        local_port: header.msgh_local_port,
                        id: header.msgh_id,
                    },
                    thread: request.thread.name,
                    task: request.task.name,
                    exception: request.exception,
                    code_count: request.code_count,
                    code: request.code,
                })),
                Ok(MessageIds::Shutdown) => {
                    let shutdown = std::ptr::addr_of!(request)
                        .cast::<ShutdownMessage>()
                        .read_unaligned();
                    Ok(Incoming::Shutdown {
                        generation: shutdown.generation,
                    })
                }
                Err(unknown) => Err(Error::UnknownMessage(unknown)),
            }
        }
    }

    fn send(&self, reply: &FaultReply) -> Result<(), Error> {
        // SAFETY: ExceptionRaiseReply is POD and mach_msg is a syscall
        unsafe {
            let mut raw = ExceptionRaiseReply {
                header: msg::mach_msg_header_t {
                    msgh_bits: reply.header.bits,
                    msgh_size: mem::size_of::<ExceptionRaiseReply>() as u32,
                    msgh_remote_port: reply.header.remote_port,
                    msgh_local_port: reply.header.local_port,
                    msgh_voucher_port: MACH_PORT_NULL,
                    msgh_id: reply.header.id,
                },
                ndr: NDR_record,
                ret_code: reply.ret_code,
            };

            let kret = msg::mach_msg(
                &mut raw.header,
                msg::MACH_SEND_MSG,
                raw.header.msgh_size,
                0,
                MACH_PORT_NULL,
                msg::MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            );

            if kret == msg::MACH_MSG_SUCCESS {
                Ok(())
            } else {
                Err(Error::Message(kret))
            }
        }
    }

    fn release(&self, request: &FaultMessage) -> Result<(), Error> {
        // SAFETY: syscall, the message gave us a send right to the thread
        let thread =
            kern_ret(|| unsafe { mp::mach_port_deallocate(mach_task_self(), request.thread) });
        // SAFETY: syscall, same for the task
        let task = kern_ret(|| unsafe { mp::mach_port_deallocate(mach_task_self(), request.task) });

        thread.and(task)
    }

    fn wake(&self, generation: u64) -> Result<(), Error> {
        let mut shutdown = ShutdownMessage {
            header: msg::mach_msg_header_t {
                msgh_bits: msg::MACH_MSG_TYPE_COPY_SEND,
                msgh_size: mem::size_of::<ShutdownMessage>() as u32,
                msgh_remote_port: self.port,
                msgh_local_port: MACH_PORT_NULL,
                msgh_voucher_port: MACH_PORT_NULL,
                msgh_id: MessageIds::Shutdown as i32,
            },
            generation,
        };

        // SAFETY: syscall
        let kret = unsafe {
            msg::mach_msg(
                &mut shutdown.header,
                msg::MACH_SEND_MSG,
                shutdown.header.msgh_size,
                0,
                MACH_PORT_NULL,
                msg::MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };

        if kret == msg::MACH_MSG_SUCCESS {
            Ok(())
        } else {
            Err(Error::Message(kret))
        }
    }
}

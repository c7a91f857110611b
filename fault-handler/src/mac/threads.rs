use super::ffi::*;
use crate::error::kern_ret;
use crate::kernel::ThreadControl;
use crate::{Error, ThreadHandle};

/// The threads of the current task
#[derive(Default)]
pub struct MachThreads;

impl ThreadControl for MachThreads {
    #[inline]
    fn current(&self) -> ThreadHandle {
        // SAFETY: syscall
        unsafe { mach_thread_self() }
    }

    fn threads(&self) -> Result<Vec<ThreadHandle>, Error> {
        // SAFETY: syscalls, the kernel allocates the array in our address
        // space, which we copy then give back
        unsafe {
            let mut threads_for_task = std::ptr::null_mut();
            let mut thread_count = 0;

            let kret =
                task::task_threads(mach_task_self(), &mut threads_for_task, &mut thread_count);
            if kret != KERN_SUCCESS {
                return Err(Error::Threads(kret));
            }

            let threads =
                std::slice::from_raw_parts(threads_for_task, thread_count as usize).to_vec();

            vm::mach_vm_deallocate(
                mach_task_self(),
                threads_for_task as u64,
                (threads.len() * std::mem::size_of::<mt::thread_act_t>()) as u64,
            );

            Ok(threads)
        }
    }

    #[inline]
    fn suspend(&self, thread: ThreadHandle) -> Result<(), Error> {
        // SAFETY: syscall
        kern_ret(|| unsafe { thread_act::thread_suspend(thread) })
    }

    #[inline]
    fn resume(&self, thread: ThreadHandle) -> Result<(), Error> {
        // SAFETY: syscall
        kern_ret(|| unsafe { thread_act::thread_resume(thread) })
    }

    #[inline]
    fn terminate(&self, thread: ThreadHandle) -> Result<(), Error> {
        // SAFETY: syscall
        kern_ret(|| unsafe { thread_terminate(thread) })
    }
}

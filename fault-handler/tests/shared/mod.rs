//! An in-process stand in for the kernel, so that the install lifecycle and
//! the catch protocol can be driven with synthetic exceptions on any platform
#![allow(dead_code)]

pub use fault_handler::kernel::*;
pub use fault_handler::{
    Error, ExceptionClass, ExceptionPortSet, FaultContext, Installer, Options, PreviousPort,
    State, ThreadHandle, make_fault_event,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

/// The fake `mach_task_self`
pub const TASK: PortName = 0x103;
/// The port every exception is delivered to before anything is installed,
/// think ReportCrash
pub const CRASH_REPORTER: PortName = 0x707;
/// `EXCEPTION_STATE_IDENTITY | MACH_EXCEPTION_CODES`
pub const CRASH_REPORTER_BEHAVIOR: Behavior = 3 | MACH_EXCEPTION_CODES;
pub const CRASH_REPORTER_FLAVOR: Flavor = 7;

const TIMEOUT: Duration = Duration::from_secs(10);

/// The kernel operations that were performed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Set {
        mask: ExceptionMask,
        port: PortName,
    },
    Suspend(ThreadHandle),
    Resume(ThreadHandle),
    Terminate(ThreadHandle),
    /// The thread and task rights of an exception message were dropped
    Release {
        thread: ThreadHandle,
        task: PortName,
    },
}

/// Where an exception ended up
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Delivered to a port we have a receiver for, which replied
    Replied(KernReturn),
    /// Delivered to some other port, which in practice is the end of the line
    Forwarded(PortName),
}

#[derive(Default)]
pub struct Failures {
    pub get: bool,
    pub allocate: bool,
    pub insert: bool,
    /// The number of upcoming `task_set_exception_ports` calls that fail
    pub set: usize,
    pub threads: bool,
    pub wake: bool,
}

#[derive(Default)]
struct Gate {
    /// Only cooperative threads actually stop when suspended
    cooperative: bool,
    suspend_count: u32,
    parked: bool,
}

#[derive(Default)]
struct KernelState {
    registrations: BTreeMap<i32, PreviousPort>,
    next_port: PortName,
    receive_rights: Vec<PortName>,
    send_rights: Vec<PortName>,
    queues: HashMap<PortName, VecDeque<Incoming>>,
    replies: HashMap<PortName, FaultReply>,
    thread_ids: HashMap<std::thread::ThreadId, ThreadHandle>,
    gates: BTreeMap<ThreadHandle, Gate>,
    next_thread: ThreadHandle,
    ops: Vec<Op>,
    traced: bool,
    failures: Failures,
    get_calls: usize,
    channels_opened: usize,
}

impl KernelState {
    fn handle_for(&mut self, id: std::thread::ThreadId) -> ThreadHandle {
        if let Some(handle) = self.thread_ids.get(&id) {
            return *handle;
        }

        self.next_thread += 4;
        let handle = self.next_thread;
        self.thread_ids.insert(id, handle);
        self.gates.insert(handle, Gate::default());
        handle
    }

    fn allocate_port(&mut self) -> PortName {
        self.next_port += 0x100;
        self.next_port
    }
}

struct Inner {
    state: Mutex<KernelState>,
    cvar: Condvar,
}

#[derive(Clone)]
pub struct FakeKernel {
    inner: Arc<Inner>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    pub fn new() -> Self {
        let mut state = KernelState {
            next_port: 0x1003,
            next_thread: 0x2003,
            ..Default::default()
        };

        for class in ExceptionClass::ALL {
            state.registrations.insert(
                class as i32,
                PreviousPort {
                    mask: class.mask(),
                    port: CRASH_REPORTER,
                    behavior: CRASH_REPORTER_BEHAVIOR,
                    flavor: CRASH_REPORTER_FLAVOR,
                },
            );
        }

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                cvar: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.inner.state.lock()
    }

    pub fn set_traced(&self, traced: bool) {
        self.lock().traced = traced;
    }

    pub fn fail(&self, f: impl FnOnce(&mut Failures)) {
        f(&mut self.lock().failures);
    }

    /// The current exception port registration for every class
    pub fn configuration(&self) -> BTreeMap<i32, PreviousPort> {
        self.lock().registrations.clone()
    }

    pub fn registration(&self, class: ExceptionClass) -> PreviousPort {
        self.lock().registrations[&(class as i32)]
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    /// Blocks until `op` has been performed. Replies are sent before the
    /// message rights are released, so the raiser can't just check the ops
    /// once it has been replied to
    pub fn wait_for(&self, op: Op) {
        let mut state = self.lock();
        while !state.ops.contains(&op) {
            assert!(
                !self.inner.cvar.wait_for(&mut state, TIMEOUT).timed_out(),
                "timed out waiting for {op:?}"
            );
        }
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    pub fn get_calls(&self) -> usize {
        self.lock().get_calls
    }

    pub fn channels_opened(&self) -> usize {
        self.lock().channels_opened
    }

    pub fn receive_rights(&self) -> Vec<PortName> {
        self.lock().receive_rights.clone()
    }

    pub fn send_rights(&self) -> Vec<PortName> {
        self.lock().send_rights.clone()
    }

    /// The handle of the calling thread
    pub fn handle_of_current(&self) -> ThreadHandle {
        self.lock().handle_for(std::thread::current().id())
    }

    /// Enqueues a message directly on a port
    pub fn post(&self, port: PortName, msg: Incoming) {
        let mut state = self.lock();
        state
            .queues
            .get_mut(&port)
            .expect("not a port we have a receive right for")
            .push_back(msg);
        self.inner.cvar.notify_all();
    }

    /// Raises an exception on the calling thread, blocking until it has been
    /// replied to if it was delivered to a port that has a receiver
    pub fn raise(&self, class: ExceptionClass, code: [i64; 2]) -> Delivery {
        self.raise_in(TASK, class, code)
    }

    /// Same as [`Self::raise`], but as if raised by another task
    pub fn raise_in(&self, task: PortName, class: ExceptionClass, code: [i64; 2]) -> Delivery {
        let mut state = self.lock();
        let thread = state.handle_for(std::thread::current().id());
        let target = state.registrations[&(class as i32)].port;

        if !state.queues.contains_key(&target) {
            return Delivery::Forwarded(target);
        }

        let reply_port = state.allocate_port();
        state.queues.get_mut(&target).unwrap().push_back(Incoming::Fault(FaultMessage {
            header: MessageHeader {
                // MACH_MSGH_BITS(MACH_MSG_TYPE_MOVE_SEND_ONCE, 0) | MACH_MSGH_BITS_COMPLEX
                bits: 0x8000_0012,
                remote_port: reply_port,
                local_port: target,
                id: MACH_EXCEPTION_RAISE,
            },
            thread,
            task,
            exception: class as i32,
            code_count: 2,
            code,
        }));
        self.inner.cvar.notify_all();

        loop {
            if let Some(reply) = state.replies.remove(&reply_port) {
                assert_eq!(reply.header.id, MACH_EXCEPTION_RAISE + 100);
                return Delivery::Replied(reply.ret_code);
            }

            assert!(
                !self.inner.cvar.wait_for(&mut state, TIMEOUT).timed_out(),
                "timed out waiting for exception reply"
            );
        }
    }

    /// Spawns a thread that increments `counter` until `stop` is set. Unlike
    /// every other thread, it actually stops while suspended
    pub fn spawn_worker(
        &self,
        counter: Arc<AtomicU64>,
        stop: Arc<AtomicBool>,
    ) -> std::thread::JoinHandle<()> {
        let kernel = self.clone();
        let (tx, rx) = std::sync::mpsc::channel();

        let worker = std::thread::spawn(move || {
            let handle = {
                let mut state = kernel.lock();
                let handle = state.handle_for(std::thread::current().id());
                state.gates.get_mut(&handle).unwrap().cooperative = true;
                handle
            };
            tx.send(()).unwrap();

            while !stop.load(Ordering::Relaxed) {
                kernel.checkpoint(handle);
                counter.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(1));
            }

            kernel.lock().gates.get_mut(&handle).unwrap().cooperative = false;
            kernel.inner.cvar.notify_all();
        });

        rx.recv().unwrap();
        worker
    }

    /// Parks the calling worker for as long as it is suspended
    fn checkpoint(&self, handle: ThreadHandle) {
        let mut state = self.lock();
        while state.gates[&handle].suspend_count > 0 {
            state.gates.get_mut(&handle).unwrap().parked = true;
            self.inner.cvar.notify_all();
            self.inner.cvar.wait(&mut state);
        }
        state.gates.get_mut(&handle).unwrap().parked = false;
    }
}

impl TaskPorts for FakeKernel {
    fn task(&self) -> PortName {
        TASK
    }

    fn get_exception_ports(&self, mask: ExceptionMask) -> Result<ExceptionPortSet, Error> {
        let mut state = self.lock();
        state.get_calls += 1;

        if state.failures.get {
            return Err(Error::Kernel(KERN_FAILURE));
        }

        let mut set = ExceptionPortSet::default();
        for class in ExceptionClass::ALL {
            if mask & class.mask() != 0 {
                set.push(state.registrations[&(class as i32)]);
            }
        }

        Ok(set)
    }

    fn set_exception_ports(
        &self,
        mask: ExceptionMask,
        port: PortName,
        behavior: Behavior,
        flavor: Flavor,
    ) -> Result<(), Error> {
        let mut state = self.lock();

        if state.failures.set > 0 {
            state.failures.set -= 1;
            return Err(Error::Kernel(KERN_FAILURE));
        }

        for class in ExceptionClass::ALL {
            if mask & class.mask() != 0 {
                state.registrations.insert(
                    class as i32,
                    PreviousPort {
                        mask: class.mask(),
                        port,
                        behavior,
                        flavor,
                    },
                );
            }
        }

        state.ops.push(Op::Set { mask, port });
        Ok(())
    }

    fn allocate_receive_right(&self) -> Result<PortName, Error> {
        let mut state = self.lock();

        if state.failures.allocate {
            return Err(Error::Kernel(KERN_FAILURE));
        }

        let port = state.allocate_port();
        state.receive_rights.push(port);
        state.queues.insert(port, VecDeque::new());
        Ok(port)
    }

    fn insert_send_right(&self, port: PortName) -> Result<(), Error> {
        let mut state = self.lock();

        if state.failures.insert {
            return Err(Error::Kernel(KERN_FAILURE));
        }

        state.send_rights.push(port);
        Ok(())
    }
}

impl ThreadControl for FakeKernel {
    fn current(&self) -> ThreadHandle {
        self.handle_of_current()
    }

    fn threads(&self) -> Result<Vec<ThreadHandle>, Error> {
        let state = self.lock();

        if state.failures.threads {
            return Err(Error::Threads(KERN_FAILURE));
        }

        Ok(state.gates.keys().copied().collect())
    }

    fn suspend(&self, thread: ThreadHandle) -> Result<(), Error> {
        let mut state = self.lock();
        state.ops.push(Op::Suspend(thread));

        let gate = state.gates.get_mut(&thread).ok_or(Error::Kernel(KERN_FAILURE))?;
        gate.suspend_count += 1;

        // Wait for cooperative threads to actually stop
        while state.gates[&thread].cooperative && !state.gates[&thread].parked {
            assert!(
                !self.inner.cvar.wait_for(&mut state, TIMEOUT).timed_out(),
                "timed out waiting for thread to park"
            );
        }

        Ok(())
    }

    fn resume(&self, thread: ThreadHandle) -> Result<(), Error> {
        let mut state = self.lock();
        state.ops.push(Op::Resume(thread));

        let gate = state.gates.get_mut(&thread).ok_or(Error::Kernel(KERN_FAILURE))?;
        gate.suspend_count = gate.suspend_count.saturating_sub(1);
        self.inner.cvar.notify_all();
        Ok(())
    }

    fn terminate(&self, thread: ThreadHandle) -> Result<(), Error> {
        self.lock().ops.push(Op::Terminate(thread));
        Ok(())
    }
}

pub struct FakeChannel {
    kernel: FakeKernel,
    port: PortName,
}

impl ExceptionChannel for FakeChannel {
    fn receive(&mut self) -> Result<Incoming, Error> {
        let mut state = self.kernel.lock();
        loop {
            if let Some(msg) = state
                .queues
                .get_mut(&self.port)
                .and_then(|queue| queue.pop_front())
            {
                return Ok(msg);
            }

            self.kernel.inner.cvar.wait(&mut state);
        }
    }

    fn send(&self, reply: &FaultReply) -> Result<(), Error> {
        let mut state = self.kernel.lock();
        state.replies.insert(reply.header.remote_port, *reply);
        self.kernel.inner.cvar.notify_all();
        Ok(())
    }

    fn wake(&self, generation: u64) -> Result<(), Error> {
        if self.kernel.lock().failures.wake {
            return Err(Error::Message(KERN_FAILURE));
        }

        self.kernel.post(self.port, Incoming::Shutdown { generation });
        Ok(())
    }

    fn release(&self, request: &FaultMessage) -> Result<(), Error> {
        self.kernel.lock().ops.push(Op::Release {
            thread: request.thread,
            task: request.task,
        });
        self.kernel.inner.cvar.notify_all();
        Ok(())
    }
}

impl Backend for FakeKernel {
    type Ports = Self;
    type Threads = Self;
    type Channel = FakeChannel;

    const THREAD_STATE_NONE: Flavor = 13;

    fn ports(&self) -> &Self::Ports {
        self
    }

    fn threads(&self) -> &Self::Threads {
        self
    }

    fn channel(&self, port: PortName) -> Self::Channel {
        self.lock().channels_opened += 1;
        FakeChannel {
            kernel: self.clone(),
            port,
        }
    }

    fn is_traced(&self) -> bool {
        self.lock().traced
    }
}

/// Records every context the callback is invoked with
#[derive(Clone, Default)]
pub struct Recorder {
    contexts: Arc<Mutex<Vec<FaultContext>>>,
}

impl Recorder {
    pub fn event(&self) -> Box<dyn fault_handler::FaultEvent> {
        let contexts = self.contexts.clone();
        // SAFETY: nothing is actually suspended by the fake kernel
        unsafe {
            make_fault_event(move |cc: &FaultContext| {
                contexts.lock().push(*cc);
            })
        }
    }

    pub fn contexts(&self) -> Vec<FaultContext> {
        self.contexts.lock().clone()
    }
}

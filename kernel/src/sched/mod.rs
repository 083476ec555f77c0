//! Kernel object and scheduling services.
//!
//! This module provides the services the rest of the crate treats as its
//! scheduler: spawning a schedulable context bound to the thread trampoline,
//! the current-context accessor (the `CURPROC` / `cur_thread` analog), and
//! condition-variable waiting under the single kernel dispatch lock.
//!
//! Every control-block mutation in the crate happens while holding
//! [`Kernel::lock_state`]; waiting on a condition variable atomically
//! releases the lock and reacquires it on wakeup. Condition variables are
//! stored in the control blocks as `Arc<Condvar>` so a waiter can clone one
//! out and then re-resolve its control block by id after every wakeup.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use hashbrown::HashMap;

use crate::error::{KernelError, Result};
use crate::ipc::pipe::{Pipe, PipeId};
use crate::ipc::socket::{Port, Socket, SocketId};
use crate::process::{Process, ProcessId};
use crate::thread::{ThreadId, ThreadRecord};

/// Exit value deposited when a task panics instead of returning.
pub const TASK_PANIC_EXITVAL: i32 = -128;

/// A thread entry point: receives the argument payload, returns an exit value.
pub type Task = Box<dyn FnOnce(Vec<u8>) -> i32 + Send + 'static>;

/// All kernel-resident control blocks, guarded by the dispatch lock.
///
/// Ownership lives in these tables; control blocks refer to each other by
/// id only, so tearing down one side never implicitly frees another.
pub(crate) struct KernelState {
    /// All processes indexed by PID.
    pub processes: BTreeMap<ProcessId, Process>,
    /// All thread control records, kernel-wide.
    pub threads: BTreeMap<ThreadId, ThreadRecord>,
    /// All pipe control blocks.
    pub pipes: BTreeMap<PipeId, Pipe>,
    /// All socket control blocks.
    pub sockets: BTreeMap<SocketId, Socket>,
    /// Port table: at most one listener per port.
    pub ports: HashMap<Port, SocketId>,
}

impl KernelState {
    fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            threads: BTreeMap::new(),
            pipes: BTreeMap::new(),
            sockets: BTreeMap::new(),
            ports: HashMap::new(),
        }
    }

    /// Look up a live process.
    pub fn process(&self, pid: ProcessId) -> Result<&Process> {
        self.processes.get(&pid).ok_or(KernelError::NoSuchProcess)
    }

    /// Look up a live process, mutably.
    pub fn process_mut(&mut self, pid: ProcessId) -> Result<&mut Process> {
        self.processes
            .get_mut(&pid)
            .ok_or(KernelError::NoSuchProcess)
    }
}

/// The kernel: the dispatch lock and everything it protects.
///
/// Created once per simulated machine with [`Kernel::new`] and shared
/// between all of its kernel contexts through an [`Arc`].
pub struct Kernel {
    state: Mutex<KernelState>,
}

impl Kernel {
    /// Create a kernel with an empty state and the root process (PID 1).
    ///
    /// The root process never runs a task of its own; it exists to adopt
    /// orphans and collect exited children, and as the parent of every
    /// process spawned from the host.
    pub fn new() -> Arc<Self> {
        let kernel = Arc::new(Kernel {
            state: Mutex::new(KernelState::new()),
        });
        kernel
            .lock_state()
            .processes
            .insert(ProcessId::ROOT, Process::root());
        log::debug!("[KERN] kernel initialized, root process {}", ProcessId::ROOT);
        kernel
    }

    /// Acquire the dispatch lock.
    ///
    /// A poisoned lock means a panic escaped a critical section; per the
    /// invariant-violation policy we abort rather than continue.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, KernelState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("kernel dispatch lock poisoned"),
        }
    }

    /// Block on `cv`, releasing the dispatch lock while asleep.
    ///
    /// Callers re-evaluate their predicate after every wakeup; this may
    /// return spuriously.
    pub(crate) fn wait<'a>(
        &self,
        cv: &Condvar,
        guard: MutexGuard<'a, KernelState>,
    ) -> MutexGuard<'a, KernelState> {
        match cv.wait(guard) {
            Ok(guard) => guard,
            Err(_) => panic!("kernel dispatch lock poisoned"),
        }
    }

    /// Block on `cv` until woken or `deadline` passes.
    ///
    /// Returns the reacquired guard and whether the deadline expired.
    pub(crate) fn wait_until<'a>(
        &self,
        cv: &Condvar,
        guard: MutexGuard<'a, KernelState>,
        deadline: Instant,
    ) -> (MutexGuard<'a, KernelState>, bool) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match cv.wait_timeout(guard, remaining) {
            Ok((guard, timeout)) => (guard, timeout.timed_out()),
            Err(_) => panic!("kernel dispatch lock poisoned"),
        }
    }
}

// ==================== Current context ====================

/// Identity of the calling kernel context.
#[derive(Clone)]
pub struct Current {
    /// The kernel this context belongs to.
    pub kernel: Arc<Kernel>,
    /// Owning process of the calling thread.
    pub pid: ProcessId,
    /// The calling thread itself.
    pub tid: ThreadId,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
    /// Set once the context has performed its exit bookkeeping, so the
    /// trampoline's implicit exit does not run a second time after an
    /// explicit `thread::exit` call.
    static EXIT_DONE: Cell<bool> = const { Cell::new(false) };
}

/// Identity of the calling kernel context.
///
/// Fails with [`KernelError::NotInKernelContext`] on a host thread that was
/// not spawned through the kernel.
pub fn current() -> Result<Current> {
    CURRENT.with(|c| c.borrow().clone()).ok_or(KernelError::NotInKernelContext)
}

pub(crate) fn exit_done() -> bool {
    EXIT_DONE.with(|f| f.get())
}

pub(crate) fn mark_exit_done() {
    EXIT_DONE.with(|f| f.set(true));
}

// ==================== Context spawn ====================

/// Spawn a schedulable context bound to the thread trampoline.
///
/// The trampoline installs the current-context identity, invokes the task
/// with its argument payload, and then performs the implicit thread exit
/// with the task's return value. A panicking task is converted into an
/// exit with [`TASK_PANIC_EXITVAL`] so its control record is never
/// abandoned in a live state.
pub(crate) fn spawn_context(
    kernel: Arc<Kernel>,
    pid: ProcessId,
    tid: ThreadId,
    task: Task,
    args: Vec<u8>,
) {
    let builder = std::thread::Builder::new().name(format!("nanokern-{tid}"));
    let handle = builder.spawn(move || {
        CURRENT.with(|c| {
            *c.borrow_mut() = Some(Current {
                kernel,
                pid,
                tid,
            });
        });

        let exitval = match panic::catch_unwind(AssertUnwindSafe(|| task(args))) {
            Ok(value) => value,
            Err(_) => {
                log::error!("[KERN] task of thread {tid} panicked");
                TASK_PANIC_EXITVAL
            }
        };

        if !exit_done() {
            crate::thread::exit(exitval);
        }
    });
    // Thread spawn failure is resource exhaustion at the host level; the
    // allocator contract treats it as fatal.
    if let Err(err) = handle {
        panic!("failed to spawn kernel context: {err}");
    }
}

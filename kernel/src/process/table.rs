//! Process table.
//!
//! One [`Process`] record per live or zombie process, indexed by PID in the
//! kernel state. A record carries exactly the state the teardown protocol
//! touches: the live-thread counter, the thread-record list, children and
//! exited-children lists with their notification condition, the stored
//! argument payload and the descriptor table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar};
use std::time::{Duration, Instant};

use crate::sched::{self, Kernel, KernelState, Task};
use crate::thread::{ThreadId, ThreadRecord};
use crate::vfs::{self, FidTable};

/// Process ID type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl ProcessId {
    /// Root process ID (always 1). Adopts orphans, collects zombies.
    pub const ROOT: ProcessId = ProcessId(1);

    /// Generate a new unique process ID.
    pub fn new() -> Self {
        static NEXT_PID: AtomicU64 = AtomicU64::new(2);
        ProcessId(NEXT_PID.fetch_add(1, Ordering::SeqCst))
    }
}

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// At least one live thread.
    Alive,
    /// All threads exited; holds the exit value of the last one. The record
    /// stays in the table until reaped by `wait_process`.
    Zombie(i32),
}

/// A process record.
pub struct Process {
    /// Process ID.
    pub pid: ProcessId,
    /// Parent process ID.
    pub parent: ProcessId,
    /// Process state.
    pub state: ProcessState,
    /// Number of live (not yet exited) threads.
    pub thread_count: u32,
    /// Thread control records of this process, including exited records
    /// that no joiner has reclaimed yet.
    pub threads: Vec<ThreadId>,
    /// Live children.
    pub children: Vec<ProcessId>,
    /// Exited children awaiting a reap.
    pub exited: Vec<ProcessId>,
    /// Signalled whenever a child is deposited in `exited`.
    pub child_exit: Arc<Condvar>,
    /// Stored argument payload, released at teardown.
    pub args: Option<Vec<u8>>,
    /// Open file descriptors.
    pub files: FidTable,
}

impl Process {
    /// Create the root process record.
    pub(crate) fn root() -> Self {
        Self {
            pid: ProcessId::ROOT,
            parent: ProcessId::ROOT,
            state: ProcessState::Alive,
            thread_count: 0,
            threads: Vec::new(),
            children: Vec::new(),
            exited: Vec::new(),
            child_exit: Arc::new(Condvar::new()),
            args: None,
            files: FidTable::new(),
        }
    }

    /// Create a new process record with a single (not yet linked) thread.
    fn new(pid: ProcessId, parent: ProcessId, args: Vec<u8>) -> Self {
        Self {
            pid,
            parent,
            state: ProcessState::Alive,
            thread_count: 0,
            threads: Vec::new(),
            children: Vec::new(),
            exited: Vec::new(),
            child_exit: Arc::new(Condvar::new()),
            args: Some(args),
            files: FidTable::new(),
        }
    }
}

impl Kernel {
    /// Spawn a new process whose main thread runs `task` with a copy of
    /// `args` as its argument payload.
    ///
    /// The process becomes a child of the root process. Its exit value is
    /// the exit value of the last thread to leave it.
    pub fn spawn_process(self: &Arc<Self>, task: Task, args: Vec<u8>) -> ProcessId {
        let pid = ProcessId::new();
        let tid = ThreadId::new();
        {
            let mut st = self.lock_state();
            let mut process = Process::new(pid, ProcessId::ROOT, args.clone());
            process.thread_count = 1;
            process.threads.push(tid);
            st.processes.insert(pid, process);
            st.threads.insert(tid, ThreadRecord::new(pid));
            if let Ok(root) = st.process_mut(ProcessId::ROOT) {
                root.children.push(pid);
            }
        }
        log::debug!("[PROC] spawned process {pid}, main thread {tid}");
        sched::spawn_context(self.clone(), pid, tid, task, args);
        pid
    }

    /// Block until process `pid` becomes a zombie, then reap it and return
    /// its exit value. Returns `None` if the process does not exist (or was
    /// already reaped).
    pub fn wait_process(&self, pid: ProcessId) -> Option<i32> {
        self.wait_process_inner(pid, None)
    }

    /// Like [`Kernel::wait_process`] with a bounded wait. Returns `None`
    /// on timeout; the process is not reaped in that case.
    pub fn wait_process_timeout(&self, pid: ProcessId, timeout: Duration) -> Option<i32> {
        self.wait_process_inner(pid, Some(Instant::now() + timeout))
    }

    fn wait_process_inner(&self, pid: ProcessId, deadline: Option<Instant>) -> Option<i32> {
        let mut st = self.lock_state();
        loop {
            let process = st.processes.get(&pid)?;
            if let ProcessState::Zombie(exitval) = process.state {
                let parent = process.parent;
                st.processes.remove(&pid);
                if let Some(parent) = st.processes.get_mut(&parent) {
                    parent.children.retain(|child| *child != pid);
                    parent.exited.retain(|child| *child != pid);
                }
                log::debug!("[PROC] reaped process {pid} (exit {exitval})");
                return Some(exitval);
            }
            // Re-read the parent each round: the process may be reparented
            // to root while we sleep.
            let cv = st.processes.get(&process.parent)?.child_exit.clone();
            match deadline {
                None => st = self.wait(&cv, st),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    let (guard, _) = self.wait_until(&cv, st, deadline);
                    st = guard;
                }
            }
        }
    }
}

/// Full process teardown, run by the last live thread at exit.
///
/// Reaps every never-joined thread record of the process, reparents live
/// children to root, migrates already-exited children into root's exited
/// list, deposits this process into its parent's exited list, releases the
/// stored argument payload, closes every open descriptor through the normal
/// per-kind close dispatch, and marks the record a zombie.
pub(crate) fn teardown_locked(st: &mut KernelState, pid: ProcessId, exitval: i32) {
    let Some(process) = st.processes.get_mut(&pid) else {
        return;
    };
    process.thread_count = 0;
    process.state = ProcessState::Zombie(exitval);
    let threads = core::mem::take(&mut process.threads);
    let children = core::mem::take(&mut process.children);
    let exited = core::mem::take(&mut process.exited);
    let files = process.files.drain();
    process.args = None;

    // Sweep every thread record that was never joined, including our own.
    for tid in threads {
        st.threads.remove(&tid);
    }

    // Release all open descriptors.
    for (_, object) in files {
        vfs::close_object_locked(st, object);
    }

    if pid == ProcessId::ROOT {
        return;
    }

    // Reparent live children to root and hand over any zombies.
    for child in &children {
        if let Some(child) = st.processes.get_mut(child) {
            child.parent = ProcessId::ROOT;
        }
    }
    let notify_root = !exited.is_empty();
    if let Some(root) = st.processes.get_mut(&ProcessId::ROOT) {
        root.children.extend(children);
        root.exited.extend(exited);
        if notify_root {
            root.child_exit.notify_all();
        }
    }

    // Deposit ourselves into the parent's exited list and wake it.
    let parent = st
        .processes
        .get(&pid)
        .map(|process| process.parent)
        .unwrap_or(ProcessId::ROOT);
    if let Some(parent) = st.processes.get_mut(&parent) {
        parent.exited.push(pid);
        parent.child_exit.notify_all();
    }
    log::debug!("[PROC] process {pid} terminated (exit {exitval})");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_generation_is_unique_and_monotonic() {
        let a = ProcessId::new();
        let b = ProcessId::new();
        assert_ne!(a, b);
        assert!(a.0 < b.0);
        assert_ne!(a, ProcessId::ROOT);
    }

    #[test]
    fn root_record_starts_empty() {
        let root = Process::root();
        assert_eq!(root.state, ProcessState::Alive);
        assert_eq!(root.thread_count, 0);
        assert!(root.children.is_empty());
        assert!(root.exited.is_empty());
    }
}

//! Thread lifecycle manager.
//!
//! One [`ThreadRecord`] per logical thread within a process, owned by the
//! kernel thread table and referenced by id from the owning process's
//! thread list. The record outlives its schedulable context: joiners keep
//! it alive through the joiner counter, and exactly one party reclaims it
//! (the last joiner to wake, the thread itself at exit when detached with
//! no joiner draining, or the owning process's teardown sweep).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar};

use crate::error::{KernelError, Result};
use crate::process::{self, ProcessId};
use crate::sched::{self, KernelState, Task};

/// Thread ID type. Monotonic, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Generate a new unique thread ID.
    pub fn new() -> Self {
        static NEXT_TID: AtomicU64 = AtomicU64::new(1);
        ThreadId(NEXT_TID.fetch_add(1, Ordering::SeqCst))
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A thread control record.
pub(crate) struct ThreadRecord {
    /// Owning process.
    pub owner: ProcessId,
    /// Set by exit; terminal.
    pub exited: bool,
    /// Set by detach; no future joiner can succeed.
    pub detached: bool,
    /// Exit value, valid once `exited` is set.
    pub exit_value: i32,
    /// Number of joiners currently blocked on this record.
    pub joiners: u32,
    /// Signalled on exit and on detach.
    pub exit_cv: Arc<Condvar>,
}

impl ThreadRecord {
    pub(crate) fn new(owner: ProcessId) -> Self {
        Self {
            owner,
            exited: false,
            detached: false,
            exit_value: 0,
            joiners: 0,
            exit_cv: Arc::new(Condvar::new()),
        }
    }
}

/// Reclaim `tid` if no observer can reference it any more.
///
/// Exactly one caller ever observes the terminal condition (exited with a
/// joiner count of zero) under the lock, so the record is freed once.
fn reclaim_if_done(st: &mut KernelState, tid: ThreadId) {
    let Some(record) = st.threads.get(&tid) else {
        return;
    };
    if !record.exited || record.joiners > 0 {
        return;
    }
    let owner = record.owner;
    st.threads.remove(&tid);
    if let Ok(process) = st.process_mut(owner) {
        process.threads.retain(|t| *t != tid);
    }
}

/// Create a new thread in the current process.
///
/// Spawns a schedulable context bound to the trampoline, which invokes
/// `task(args)` and then performs the implicit exit with its return value.
pub fn create(task: Task, args: Vec<u8>) -> Result<ThreadId> {
    let cur = sched::current()?;
    let tid = ThreadId::new();
    {
        let mut st = cur.kernel.lock_state();
        let process = st.process_mut(cur.pid)?;
        process.threads.push(tid);
        process.thread_count += 1;
        st.threads.insert(tid, ThreadRecord::new(cur.pid));
    }
    log::debug!("[THRD] created thread {tid} in process {}", cur.pid);
    sched::spawn_context(cur.kernel.clone(), cur.pid, tid, task, args);
    Ok(tid)
}

/// The id of the calling thread.
pub fn current_thread() -> Result<ThreadId> {
    Ok(sched::current()?.tid)
}

/// Join `tid`, blocking until it exits or becomes detached.
///
/// Returns the target's exit value on success. Fails if the target is the
/// caller itself, is not a thread of the calling process, or became
/// detached before exiting. The last joiner to wake reclaims the record.
pub fn join(tid: ThreadId) -> Result<i32> {
    let cur = sched::current()?;
    if tid == cur.tid {
        return Err(KernelError::JoinSelf);
    }
    let mut st = cur.kernel.lock_state();
    let record = st.threads.get_mut(&tid).ok_or(KernelError::NoSuchThread)?;
    if record.owner != cur.pid {
        return Err(KernelError::NoSuchThread);
    }
    record.joiners += 1;
    let cv = record.exit_cv.clone();

    loop {
        let resolved = match st.threads.get(&tid) {
            // Reclaimed while we were waking: the target was detached and
            // exited, and its own exit path swept the record.
            None => return Err(KernelError::ThreadDetached),
            Some(record) => record.exited || record.detached,
        };
        if resolved {
            break;
        }
        st = cur.kernel.wait(&cv, st);
    }

    let record = st
        .threads
        .get_mut(&tid)
        .unwrap_or_else(|| panic!("thread {tid} vanished while joined"));
    record.joiners -= 1;
    let detached = record.detached;
    let exit_value = record.exit_value;
    reclaim_if_done(&mut st, tid);

    if detached {
        Err(KernelError::ThreadDetached)
    } else {
        Ok(exit_value)
    }
}

/// Detach `tid`: no future join can succeed, and every currently blocked
/// joiner is woken to observe the detach and fail.
pub fn detach(tid: ThreadId) -> Result<()> {
    let cur = sched::current()?;
    let mut st = cur.kernel.lock_state();
    let record = st.threads.get_mut(&tid).ok_or(KernelError::NoSuchThread)?;
    if record.owner != cur.pid {
        return Err(KernelError::NoSuchThread);
    }
    if record.exited {
        return Err(KernelError::AlreadyExited);
    }
    record.detached = true;
    record.exit_cv.notify_all();
    Ok(())
}

/// Terminate the calling thread with `exitval`.
///
/// If this is the last live thread of the process, the full process
/// teardown runs. The schedulable context keeps running until the task
/// returns; a task calling `exit` directly should return immediately
/// afterwards (the trampoline will not exit a second time).
pub fn exit(exitval: i32) {
    let Ok(cur) = sched::current() else {
        return;
    };
    if sched::exit_done() {
        return;
    }
    sched::mark_exit_done();

    let mut st = cur.kernel.lock_state();
    let last = match st.process_mut(cur.pid) {
        Ok(process) => process.thread_count == 1,
        Err(_) => return,
    };

    if last {
        // Last live thread: tear the whole process down.
        process::teardown_locked(&mut st, cur.pid, exitval);
        return;
    }

    if let Ok(process) = st.process_mut(cur.pid) {
        process.thread_count -= 1;
    }
    let Some(record) = st.threads.get_mut(&cur.tid) else {
        return;
    };
    record.exited = true;
    record.exit_value = exitval;
    if record.detached && record.joiners == 0 {
        // Detach already woke and drained any joiner; reclaim in place.
        reclaim_if_done(&mut st, cur.tid);
    } else {
        record.exit_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_generation_is_unique_and_monotonic() {
        let a = ThreadId::new();
        let b = ThreadId::new();
        assert_ne!(a, b);
        assert!(a.0 < b.0);
    }

    #[test]
    fn fresh_record_is_live() {
        let record = ThreadRecord::new(ProcessId::ROOT);
        assert!(!record.exited);
        assert!(!record.detached);
        assert_eq!(record.joiners, 0);
    }

    #[test]
    fn syscalls_require_kernel_context() {
        // The test harness thread is not a kernel context.
        assert_eq!(current_thread(), Err(KernelError::NotInKernelContext));
        assert_eq!(join(ThreadId(7)), Err(KernelError::NotInKernelContext));
        assert_eq!(detach(ThreadId(7)), Err(KernelError::NotInKernelContext));
    }
}

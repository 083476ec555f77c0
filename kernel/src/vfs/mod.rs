//! Descriptor resolution and per-kind stream dispatch.
//!
//! Every open descriptor names a [`FileObject`]: one end of a pipe, or a
//! socket. The [`read`], [`write`] and [`close`] syscalls resolve the
//! caller's descriptor under the kernel lock and dispatch to the object's
//! kind; process teardown funnels through the same per-kind close dispatch
//! via [`close_object_locked`].

mod fd;

pub use fd::{Fid, FidTable, MAX_OPEN_FILES};

use crate::error::{KernelError, Result};
use crate::ipc::{pipe, socket};
use crate::ipc::pipe::PipeId;
use crate::ipc::socket::SocketId;
use crate::sched::{self, KernelState};

/// What an open descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileObject {
    /// The read end of a pipe.
    PipeReader(PipeId),
    /// The write end of a pipe.
    PipeWriter(PipeId),
    /// A socket in any role.
    Socket(SocketId),
}

/// Read from a descriptor into `buf`. Returns the number of bytes read;
/// `Ok(0)` denotes end of stream, never "would block".
pub fn read(fid: Fid, buf: &mut [u8]) -> Result<usize> {
    let cur = sched::current()?;
    let st = cur.kernel.lock_state();
    let object = st.process(cur.pid)?.files.get(fid)?;
    match object {
        FileObject::PipeReader(id) => pipe::read_locked(&cur.kernel, st, id, buf),
        FileObject::PipeWriter(_) => Err(KernelError::InvalidOperation),
        FileObject::Socket(id) => socket::read_locked(&cur.kernel, st, id, buf),
    }
}

/// Write `buf` to a descriptor. Returns the number of bytes accepted,
/// which may be less than `buf.len()`.
pub fn write(fid: Fid, buf: &[u8]) -> Result<usize> {
    let cur = sched::current()?;
    let st = cur.kernel.lock_state();
    let object = st.process(cur.pid)?.files.get(fid)?;
    match object {
        FileObject::PipeReader(_) => Err(KernelError::InvalidOperation),
        FileObject::PipeWriter(id) => pipe::write_locked(&cur.kernel, st, id, buf),
        FileObject::Socket(id) => socket::write_locked(&cur.kernel, st, id, buf),
    }
}

/// Close a descriptor, dispatching the object's close protocol.
pub fn close(fid: Fid) -> Result<()> {
    let cur = sched::current()?;
    let mut st = cur.kernel.lock_state();
    let object = st.process_mut(cur.pid)?.files.remove(fid)?;
    close_object_locked(&mut st, object);
    Ok(())
}

/// Per-kind close dispatch, shared by [`close`] and process teardown.
pub(crate) fn close_object_locked(st: &mut KernelState, object: FileObject) {
    match object {
        FileObject::PipeReader(id) => pipe::close_reader_locked(st, id),
        FileObject::PipeWriter(id) => pipe::close_writer_locked(st, id),
        FileObject::Socket(id) => socket::close_locked(st, id),
    }
}

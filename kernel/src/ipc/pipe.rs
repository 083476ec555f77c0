//! Pipe channel.
//!
//! A bounded circular byte buffer with one reader end and one writer end.
//! Writers block while the buffer is full, readers block while it is empty
//! and a writer remains; both stop early rather than blocking mid-transfer,
//! so partial reads and writes are normal results. Closing one end wakes
//! the opposite side so it re-observes the closure instead of sleeping
//! forever; the control block is freed by whichever end closes last.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, MutexGuard};

use crate::error::{KernelError, Result};
use crate::sched::{self, Kernel, KernelState};
use crate::vfs::FileObject;

/// Capacity of a pipe buffer in bytes.
pub const PIPE_BUFFER_SIZE: usize = 4096;

/// Pipe ID type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipeId(pub u64);

impl PipeId {
    /// Generate a new unique pipe ID.
    pub fn new() -> Self {
        static NEXT_PIPE: AtomicU64 = AtomicU64::new(1);
        PipeId(NEXT_PIPE.fetch_add(1, Ordering::SeqCst))
    }
}

/// A pipe control block.
///
/// Invariant: `0 <= empty_slots <= PIPE_BUFFER_SIZE`; the buffer is empty
/// iff `empty_slots == PIPE_BUFFER_SIZE` and full iff `empty_slots == 0`.
pub(crate) struct Pipe {
    /// Circular byte buffer.
    buffer: Box<[u8]>,
    /// Next slot to write.
    w_pos: usize,
    /// Next slot to read.
    r_pos: usize,
    /// Free slots remaining.
    empty_slots: usize,
    /// Whether the reader end is still open.
    pub reader_open: bool,
    /// Whether the writer end is still open.
    pub writer_open: bool,
    /// Signalled whenever bytes are deposited, and on writer close.
    has_data: Arc<Condvar>,
    /// Signalled whenever bytes are drained, and on reader close.
    has_space: Arc<Condvar>,
}

impl Pipe {
    /// Create a pipe with both ends open and an empty buffer.
    pub(crate) fn new() -> Self {
        Self {
            buffer: vec![0u8; PIPE_BUFFER_SIZE].into_boxed_slice(),
            w_pos: 0,
            r_pos: 0,
            empty_slots: PIPE_BUFFER_SIZE,
            reader_open: true,
            writer_open: true,
            has_data: Arc::new(Condvar::new()),
            has_space: Arc::new(Condvar::new()),
        }
    }

    fn is_empty(&self) -> bool {
        self.empty_slots == PIPE_BUFFER_SIZE
    }

    fn is_full(&self) -> bool {
        self.empty_slots == 0
    }
}

/// Write up to `buf.len()` bytes into the pipe.
///
/// Fails with [`KernelError::BrokenPipe`] when the reader end is absent,
/// including when the reader closes while this writer is blocked on a full
/// buffer, and with [`KernelError::HandleClosed`] when the writer end
/// itself is closed concurrently. Otherwise blocks until at least one slot
/// is free, then deposits
/// bytes until the buffer fills or the input is exhausted, and returns the
/// number written.
pub(crate) fn write_locked<'a>(
    kernel: &'a Kernel,
    mut st: MutexGuard<'a, KernelState>,
    id: PipeId,
    buf: &[u8],
) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    loop {
        let pipe = st.pipes.get(&id).ok_or(KernelError::InvalidHandle)?;
        if !pipe.writer_open {
            return Err(KernelError::HandleClosed);
        }
        if !pipe.reader_open {
            return Err(KernelError::BrokenPipe);
        }
        if !pipe.is_full() {
            break;
        }
        let cv = pipe.has_space.clone();
        st = kernel.wait(&cv, st);
    }

    let pipe = st.pipes.get_mut(&id).ok_or(KernelError::InvalidHandle)?;
    let mut written = 0;
    for &byte in buf {
        if pipe.is_full() {
            break;
        }
        pipe.buffer[pipe.w_pos] = byte;
        pipe.w_pos = (pipe.w_pos + 1) % PIPE_BUFFER_SIZE;
        pipe.empty_slots -= 1;
        written += 1;
    }
    if written > 0 {
        pipe.has_data.notify_all();
    }
    Ok(written)
}

/// Read up to `buf.len()` bytes from the pipe.
///
/// Returns `Ok(0)` exactly when the buffer is empty and the writer end is
/// absent (EOF); it never blocks in that state. Otherwise blocks until at
/// least one byte is available, then drains bytes until the buffer empties
/// or `buf` fills, and returns the number read.
pub(crate) fn read_locked<'a>(
    kernel: &'a Kernel,
    mut st: MutexGuard<'a, KernelState>,
    id: PipeId,
    buf: &mut [u8],
) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    loop {
        let pipe = st.pipes.get(&id).ok_or(KernelError::InvalidHandle)?;
        if !pipe.reader_open {
            return Err(KernelError::HandleClosed);
        }
        if !pipe.is_empty() {
            break;
        }
        if !pipe.writer_open {
            return Ok(0);
        }
        let cv = pipe.has_data.clone();
        st = kernel.wait(&cv, st);
    }

    let pipe = st.pipes.get_mut(&id).ok_or(KernelError::InvalidHandle)?;
    let mut read = 0;
    for slot in buf.iter_mut() {
        if pipe.is_empty() {
            break;
        }
        *slot = pipe.buffer[pipe.r_pos];
        pipe.r_pos = (pipe.r_pos + 1) % PIPE_BUFFER_SIZE;
        pipe.empty_slots += 1;
        read += 1;
    }
    if read > 0 {
        pipe.has_space.notify_all();
    }
    Ok(read)
}

/// Close the reader end.
///
/// Broadcasts both conditions: a writer blocked on a full buffer wakes to
/// re-observe the broken pipe, and a reader of the same end blocked on an
/// empty buffer wakes to observe its own closure. Frees the control block
/// when the writer end is already gone. A second close of an already-freed
/// pipe is a no-op.
pub(crate) fn close_reader_locked(st: &mut KernelState, id: PipeId) {
    let Some(pipe) = st.pipes.get_mut(&id) else {
        return;
    };
    pipe.reader_open = false;
    pipe.has_space.notify_all();
    pipe.has_data.notify_all();
    if !pipe.writer_open {
        st.pipes.remove(&id);
        log::debug!("[PIPE] pipe {} freed", id.0);
    }
}

/// Close the writer end.
///
/// Broadcasts both conditions: a reader blocked on an empty buffer wakes
/// to re-observe EOF, and a writer of the same end blocked on a full
/// buffer wakes to observe its own closure. Frees the control block when
/// the reader end is already gone.
pub(crate) fn close_writer_locked(st: &mut KernelState, id: PipeId) {
    let Some(pipe) = st.pipes.get_mut(&id) else {
        return;
    };
    pipe.writer_open = false;
    pipe.has_data.notify_all();
    pipe.has_space.notify_all();
    if !pipe.reader_open {
        st.pipes.remove(&id);
        log::debug!("[PIPE] pipe {} freed", id.0);
    }
}

/// Create a pipe and return its (read, write) descriptor pair.
///
/// The two descriptor slots are reserved atomically: on exhaustion no
/// partial allocation is left behind.
pub fn pipe() -> Result<(crate::vfs::Fid, crate::vfs::Fid)> {
    let cur = sched::current()?;
    let mut st = cur.kernel.lock_state();
    let id = PipeId::new();
    let process = st.process_mut(cur.pid)?;
    let (read_fid, write_fid) = process.files.reserve_pair(
        FileObject::PipeReader(id),
        FileObject::PipeWriter(id),
    )?;
    st.pipes.insert(id, Pipe::new());
    log::debug!(
        "[PIPE] pipe {} created in process {} (fds {read_fid}, {write_fid})",
        id.0,
        cur.pid
    );
    Ok((read_fid, write_fid))
}

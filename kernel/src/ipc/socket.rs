//! Socket rendezvous layer.
//!
//! Connection-oriented sockets over the pipe channel. A socket starts
//! `Unbound`, becomes a `Listener` through [`listen`] or a `Peer` through
//! the [`connect`]/[`accept`] rendezvous; neither promotion is reversible.
//! A connected pair is two pipes wired in opposite directions, one pipe id
//! held by each side for each direction.
//!
//! Teardown follows the blocked-operation refcount: `refcount` counts the
//! threads currently blocked inside `connect` or `accept` on this socket.
//! Closing a socket with a blocked operation pending decrements the count
//! and wakes the sleeper, which completes the teardown itself once it
//! observes the zero count; closing an idle socket frees it on the spot.
//! At most one party ever removes a socket from the table.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{KernelError, Result};
use crate::ipc::pipe::{self, Pipe, PipeId};
use crate::process::ProcessId;
use crate::sched::{self, Kernel, KernelState};
use crate::vfs::{Fid, FileObject};

/// Highest valid port number. Valid ports are `1..=MAX_PORT`.
pub const MAX_PORT: u16 = 1023;

/// A validated port number in `1..=MAX_PORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port(u16);

impl Port {
    /// Validate `port` into a [`Port`].
    pub fn new(port: u16) -> Result<Self> {
        if port == 0 || port > MAX_PORT {
            return Err(KernelError::InvalidPort);
        }
        Ok(Port(port))
    }

    /// The raw port number.
    pub fn get(self) -> u16 {
        self.0
    }
}

impl core::fmt::Display for Port {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Socket ID type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(pub u64);

impl SocketId {
    /// Generate a new unique socket ID.
    pub fn new() -> Self {
        static NEXT_SOCKET: AtomicU64 = AtomicU64::new(1);
        SocketId(NEXT_SOCKET.fetch_add(1, Ordering::SeqCst))
    }
}

impl core::fmt::Display for SocketId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    /// Which transfer direction(s) a [`shutdown`] closes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShutdownMode: u8 {
        /// Close the read direction.
        const READ = 1 << 0;
        /// Close the write direction.
        const WRITE = 1 << 1;
        /// Close both directions.
        const BOTH = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// A pending rendezvous, created by the connector and queued on the
/// listener. Shared between both sides; the flags are only ever mutated
/// while the kernel lock is held.
pub(crate) struct ConnRequest {
    /// The connecting socket.
    peer: SocketId,
    /// Set by the admitting `accept`.
    admitted: AtomicBool,
    /// Set when the acceptor could not complete the admission.
    refused: AtomicBool,
    /// Signalled when the rendezvous resolves either way.
    connected: Condvar,
}

/// Role-specific socket state. A socket is in exactly one role at a time.
pub(crate) enum SocketRole {
    /// Freshly opened, no protocol state yet.
    Unbound,
    /// Registered on a port, queueing connection requests.
    Listener {
        /// Pending rendezvous, oldest first.
        queue: VecDeque<Arc<ConnRequest>>,
        /// Signalled when a request is enqueued, and on teardown.
        req_available: Arc<Condvar>,
    },
    /// One half of a connected pair.
    Peer {
        /// The other half.
        peer: SocketId,
        /// Inbound pipe; cleared by a read-direction shutdown.
        read_pipe: Option<PipeId>,
        /// Outbound pipe; cleared by a write-direction shutdown.
        write_pipe: Option<PipeId>,
    },
}

/// A socket control block.
pub(crate) struct Socket {
    /// Threads currently blocked inside `connect` or `accept` on this
    /// socket. At most 1 under correct use.
    pub refcount: u32,
    /// Bound port, if any.
    pub port: Option<Port>,
    /// Current role.
    pub role: SocketRole,
}

/// Resolve a descriptor of the given process to a socket id.
fn resolve(st: &KernelState, pid: ProcessId, fid: Fid) -> Result<SocketId> {
    match st.process(pid)?.files.get(fid)? {
        FileObject::Socket(id) => Ok(id),
        _ => Err(KernelError::InvalidOperation),
    }
}

// ==================== Syscalls ====================

/// Open an unbound socket, optionally pre-bound to `port`.
pub fn socket(port: Option<Port>) -> Result<Fid> {
    let cur = sched::current()?;
    let mut st = cur.kernel.lock_state();
    let id = SocketId::new();
    let fid = st
        .process_mut(cur.pid)?
        .files
        .reserve(FileObject::Socket(id))?;
    st.sockets.insert(
        id,
        Socket {
            refcount: 0,
            port,
            role: SocketRole::Unbound,
        },
    );
    log::debug!("[SOCK] socket {id} opened in process {} (fd {fid})", cur.pid);
    Ok(fid)
}

/// Promote an unbound, port-bound socket to the exclusive listener of its
/// port. Irreversible.
pub fn listen(fid: Fid) -> Result<()> {
    let cur = sched::current()?;
    let mut st = cur.kernel.lock_state();
    let id = resolve(&st, cur.pid, fid)?;
    let port = {
        let socket = st.sockets.get(&id).ok_or(KernelError::InvalidHandle)?;
        if !matches!(socket.role, SocketRole::Unbound) {
            return Err(KernelError::NotUnbound);
        }
        socket.port.ok_or(KernelError::NoPortBound)?
    };
    if st.ports.contains_key(&port) {
        return Err(KernelError::PortInUse);
    }
    st.ports.insert(port, id);
    if let Some(socket) = st.sockets.get_mut(&id) {
        socket.role = SocketRole::Listener {
            queue: VecDeque::new(),
            req_available: Arc::new(Condvar::new()),
        };
    }
    log::debug!("[SOCK] socket {id} listening on port {port}");
    Ok(())
}

/// How a blocked `connect` resolved.
enum ConnectOutcome {
    Admitted,
    TimedOut,
    Refused,
    Closed,
}

/// Connect an unbound socket to the listener on `port`.
///
/// Enqueues a rendezvous request and blocks until an `accept` admits it,
/// the wait times out, the listener disappears, or this socket is closed
/// concurrently. Each outcome reports distinctly: `Ok(())`,
/// [`KernelError::ConnectTimedOut`], [`KernelError::ConnectionRefused`],
/// [`KernelError::HandleClosed`]. A request that was not admitted is
/// withdrawn from the listener queue before returning, so a later accept
/// can never admit an abandoned rendezvous.
pub fn connect(fid: Fid, port: Port, timeout: Option<Duration>) -> Result<()> {
    let cur = sched::current()?;
    let mut st = cur.kernel.lock_state();
    let id = resolve(&st, cur.pid, fid)?;
    {
        let socket = st.sockets.get(&id).ok_or(KernelError::InvalidHandle)?;
        if !matches!(socket.role, SocketRole::Unbound) {
            return Err(KernelError::NotUnbound);
        }
    }
    let listener_id = *st.ports.get(&port).ok_or(KernelError::NoListener)?;

    let request = Arc::new(ConnRequest {
        peer: id,
        admitted: AtomicBool::new(false),
        refused: AtomicBool::new(false),
        connected: Condvar::new(),
    });
    {
        let listener = st
            .sockets
            .get_mut(&listener_id)
            .ok_or(KernelError::NoListener)?;
        let SocketRole::Listener { queue, req_available } = &mut listener.role else {
            panic!("port {port} maps to a non-listener socket");
        };
        queue.push_back(request.clone());
        req_available.notify_one();
    }
    st.sockets
        .get_mut(&id)
        .ok_or(KernelError::InvalidHandle)?
        .refcount += 1;
    log::debug!("[SOCK] socket {id} connecting to port {port}");

    let deadline = timeout.map(|t| Instant::now() + t);
    let outcome = loop {
        // Closure wins over admission: a socket closed mid-rendezvous is
        // torn down even if an accept raced it.
        let closed = match st.sockets.get(&id) {
            None => true,
            Some(socket) => socket.refcount == 0,
        };
        if closed {
            break ConnectOutcome::Closed;
        }
        if request.refused.load(Ordering::Relaxed) {
            break ConnectOutcome::Refused;
        }
        if request.admitted.load(Ordering::Relaxed) {
            break ConnectOutcome::Admitted;
        }
        if st.ports.get(&port) != Some(&listener_id) {
            break ConnectOutcome::Refused;
        }
        match deadline {
            None => st = cur.kernel.wait(&request.connected, st),
            Some(deadline) => {
                if Instant::now() >= deadline {
                    break ConnectOutcome::TimedOut;
                }
                let (guard, _) = cur.kernel.wait_until(&request.connected, st, deadline);
                st = guard;
            }
        }
    };

    // Withdraw the request if it is still queued.
    if let Some(listener) = st.sockets.get_mut(&listener_id) {
        if let SocketRole::Listener { queue, .. } = &mut listener.role {
            queue.retain(|queued| !Arc::ptr_eq(queued, &request));
        }
    }

    match outcome {
        ConnectOutcome::Closed => {
            teardown_locked(&mut st, id);
            Err(KernelError::HandleClosed)
        }
        outcome => {
            if let Some(socket) = st.sockets.get_mut(&id) {
                socket.refcount -= 1;
            }
            match outcome {
                ConnectOutcome::Admitted => {
                    log::debug!("[SOCK] socket {id} connected to port {port}");
                    Ok(())
                }
                ConnectOutcome::TimedOut => Err(KernelError::ConnectTimedOut),
                ConnectOutcome::Refused => Err(KernelError::ConnectionRefused),
                ConnectOutcome::Closed => unreachable!(),
            }
        }
    }
}

/// Admit the oldest queued rendezvous on a listener.
///
/// Blocks until a request is available or the listener is closed
/// concurrently. On admission, allocates a fresh peer socket in the calling
/// process, wires two pipes between it and the connector in opposite
/// directions, promotes both sockets to `Peer`, and wakes the connector.
pub fn accept(fid: Fid) -> Result<Fid> {
    let cur = sched::current()?;
    let mut st = cur.kernel.lock_state();
    let id = resolve(&st, cur.pid, fid)?;
    let (cv, port) = {
        let socket = st.sockets.get(&id).ok_or(KernelError::InvalidHandle)?;
        let SocketRole::Listener { req_available, .. } = &socket.role else {
            return Err(KernelError::NotAListener);
        };
        let port = socket.port.ok_or(KernelError::NoPortBound)?;
        (req_available.clone(), port)
    };
    st.sockets
        .get_mut(&id)
        .ok_or(KernelError::InvalidHandle)?
        .refcount += 1;

    let request = loop {
        let socket = st
            .sockets
            .get_mut(&id)
            .ok_or(KernelError::HandleClosed)?;
        if socket.refcount == 0 {
            // Closed while we were blocked; finish the teardown ourselves.
            teardown_locked(&mut st, id);
            return Err(KernelError::HandleClosed);
        }
        let SocketRole::Listener { queue, .. } = &mut socket.role else {
            return Err(KernelError::NotAListener);
        };
        if let Some(request) = queue.pop_front() {
            break request;
        }
        st = cur.kernel.wait(&cv, st);
    };

    // Reserve the descriptor slot before committing anything, so failure
    // leaves no partial allocation behind.
    let peer_id = SocketId::new();
    let reserved = st
        .process_mut(cur.pid)?
        .files
        .reserve(FileObject::Socket(peer_id));
    let peer_fid = match reserved {
        Ok(fid) => fid,
        Err(err) => {
            request.refused.store(true, Ordering::Relaxed);
            request.connected.notify_all();
            if let Some(socket) = st.sockets.get_mut(&id) {
                socket.refcount -= 1;
            }
            return Err(err);
        }
    };

    // Wire the pair: `up` carries connector-to-acceptor bytes, `down` the
    // reverse direction.
    let up = PipeId::new();
    let down = PipeId::new();
    st.pipes.insert(up, Pipe::new());
    st.pipes.insert(down, Pipe::new());
    if let Some(connector) = st.sockets.get_mut(&request.peer) {
        connector.role = SocketRole::Peer {
            peer: peer_id,
            read_pipe: Some(down),
            write_pipe: Some(up),
        };
    }
    st.sockets.insert(
        peer_id,
        Socket {
            refcount: 0,
            port: Some(port),
            role: SocketRole::Peer {
                peer: request.peer,
                read_pipe: Some(up),
                write_pipe: Some(down),
            },
        },
    );
    request.admitted.store(true, Ordering::Relaxed);
    request.connected.notify_all();
    if let Some(socket) = st.sockets.get_mut(&id) {
        socket.refcount -= 1;
    }
    log::debug!(
        "[SOCK] listener {id} admitted socket {} as peer {peer_id} (fd {peer_fid})",
        request.peer
    );
    Ok(peer_fid)
}

/// Close one or both transfer directions of a peer socket.
///
/// Closing an already-absent direction is a no-op. The socket itself
/// survives; only `close` destroys it.
pub fn shutdown(fid: Fid, mode: ShutdownMode) -> Result<()> {
    if mode.is_empty() {
        return Err(KernelError::InvalidShutdownMode);
    }
    let cur = sched::current()?;
    let mut st = cur.kernel.lock_state();
    let id = resolve(&st, cur.pid, fid)?;
    let socket = st.sockets.get_mut(&id).ok_or(KernelError::InvalidHandle)?;
    let SocketRole::Peer { read_pipe, write_pipe, .. } = &mut socket.role else {
        return Err(KernelError::NotAPeer);
    };
    let closing_read = if mode.contains(ShutdownMode::READ) {
        read_pipe.take()
    } else {
        None
    };
    let closing_write = if mode.contains(ShutdownMode::WRITE) {
        write_pipe.take()
    } else {
        None
    };
    if let Some(pipe_id) = closing_read {
        pipe::close_reader_locked(&mut st, pipe_id);
    }
    if let Some(pipe_id) = closing_write {
        pipe::close_writer_locked(&mut st, pipe_id);
    }
    log::debug!("[SOCK] socket {id} shutdown ({mode:?})");
    Ok(())
}

// ==================== Stream I/O ====================

/// Read from a peer socket's inbound pipe.
pub(crate) fn read_locked<'a>(
    kernel: &'a Kernel,
    st: MutexGuard<'a, KernelState>,
    id: SocketId,
    buf: &mut [u8],
) -> Result<usize> {
    let socket = st.sockets.get(&id).ok_or(KernelError::InvalidHandle)?;
    let SocketRole::Peer { read_pipe, .. } = &socket.role else {
        return Err(KernelError::NotAPeer);
    };
    let pipe_id = (*read_pipe).ok_or(KernelError::DirectionClosed)?;
    pipe::read_locked(kernel, st, pipe_id, buf)
}

/// Write to a peer socket's outbound pipe.
pub(crate) fn write_locked<'a>(
    kernel: &'a Kernel,
    st: MutexGuard<'a, KernelState>,
    id: SocketId,
    buf: &[u8],
) -> Result<usize> {
    let socket = st.sockets.get(&id).ok_or(KernelError::InvalidHandle)?;
    let SocketRole::Peer { write_pipe, .. } = &socket.role else {
        return Err(KernelError::NotAPeer);
    };
    let pipe_id = (*write_pipe).ok_or(KernelError::DirectionClosed)?;
    pipe::write_locked(kernel, st, pipe_id, buf)
}

// ==================== Teardown ====================

/// Close a socket descriptor.
///
/// With no blocked operation (`refcount == 0`) the socket is freed on the
/// spot. With one blocked operation, the count drops to zero and the
/// sleeper is woken to finish the teardown itself; for a listener that
/// also deregisters the port and fails every queued connector immediately.
/// Any other count is an invariant violation.
pub(crate) fn close_locked(st: &mut KernelState, id: SocketId) {
    let Some(socket) = st.sockets.get_mut(&id) else {
        return;
    };
    match socket.refcount {
        0 => teardown_locked(st, id),
        1 => {
            socket.refcount = 0;
            let port = socket.port;
            let drained = match &mut socket.role {
                SocketRole::Listener { queue, req_available } => {
                    req_available.notify_all();
                    Some(queue.drain(..).collect::<Vec<_>>())
                }
                _ => None,
            };
            if let Some(requests) = drained {
                if let Some(port) = port {
                    if st.ports.get(&port) == Some(&id) {
                        st.ports.remove(&port);
                    }
                }
                for request in requests {
                    request.connected.notify_all();
                }
            }
            log::debug!("[SOCK] socket {id} closed with a blocked operation pending");
        }
        count => panic!("socket {id} has refcount {count} at close"),
    }
}

/// Remove a socket from the table and release its role-specific state.
///
/// For a listener, deregisters the port, discards the queue and wakes every
/// queued connector so it observes the refusal. For a peer, closes both
/// pipe directions through the normal pipe close paths. Idempotent against
/// the partial work the close path may already have done.
fn teardown_locked(st: &mut KernelState, id: SocketId) {
    let Some(socket) = st.sockets.remove(&id) else {
        return;
    };
    match socket.role {
        SocketRole::Unbound => {}
        SocketRole::Listener { queue, req_available } => {
            if let Some(port) = socket.port {
                if st.ports.get(&port) == Some(&id) {
                    st.ports.remove(&port);
                }
            }
            for request in queue {
                request.connected.notify_all();
            }
            req_available.notify_all();
        }
        SocketRole::Peer { peer, read_pipe, write_pipe } => {
            if let Some(pipe_id) = read_pipe {
                pipe::close_reader_locked(st, pipe_id);
            }
            if let Some(pipe_id) = write_pipe {
                pipe::close_writer_locked(st, pipe_id);
            }
            log::debug!("[SOCK] peer {id} disconnected from {peer}");
        }
    }
    log::debug!("[SOCK] socket {id} freed");
}

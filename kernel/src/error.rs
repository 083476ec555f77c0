//! Kernel error taxonomy.
//!
//! Every fallible operation in the crate reports one of these variants.
//! Invariant violations (impossible reference counts, corrupted queues,
//! a poisoned kernel lock) are **not** represented here: they abort via
//! panic instead of proceeding with undefined state.

/// All errors produced by the kernel core.
///
/// Variants are split into the categories of the error design:
/// - **Invalid argument**: bad handle/id/port, reported synchronously
/// - **Protocol-state violation**: operation on a socket in the wrong role
/// - **Resource exhaustion**: no free descriptor slots
/// - **Peer-gone**: the opposite endpoint has left
/// - **Teardown race**: a handle closed while its owner was blocked on it
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    // ── Invalid argument ─────────────────────────────────────────────
    #[error("calling thread is not a kernel context")]
    NotInKernelContext,

    #[error("no such process")]
    NoSuchProcess,

    #[error("no such thread in the current process")]
    NoSuchThread,

    #[error("a thread cannot join itself")]
    JoinSelf,

    #[error("invalid file descriptor")]
    InvalidHandle,

    #[error("port number out of range")]
    InvalidPort,

    #[error("empty shutdown mode")]
    InvalidShutdownMode,

    #[error("operation not supported by this descriptor")]
    InvalidOperation,

    // ── Protocol-state violation ─────────────────────────────────────
    #[error("join target is detached")]
    ThreadDetached,

    #[error("thread has already exited")]
    AlreadyExited,

    #[error("socket is not unbound")]
    NotUnbound,

    #[error("socket has no bound port")]
    NoPortBound,

    #[error("socket is not a listener")]
    NotAListener,

    #[error("socket is not a connected peer")]
    NotAPeer,

    // ── Resource exhaustion ──────────────────────────────────────────
    #[error("no free descriptor slots")]
    TooManyOpenFiles,

    #[error("port is already occupied by a listener")]
    PortInUse,

    // ── Peer-gone ────────────────────────────────────────────────────
    #[error("write on a pipe with no reader")]
    BrokenPipe,

    #[error("no listener on the target port")]
    NoListener,

    #[error("this transfer direction has been shut down")]
    DirectionClosed,

    // ── Teardown races and rendezvous outcomes ───────────────────────
    #[error("connection attempt timed out")]
    ConnectTimedOut,

    #[error("connection refused: listener torn down before admission")]
    ConnectionRefused,

    #[error("handle was closed while the operation was blocked")]
    HandleClosed,
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, KernelError>;

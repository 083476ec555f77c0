//! nanokern — the concurrency and IPC core of a small hosted kernel.
//!
//! The crate implements the user-facing synchronization machinery of a
//! multi-threaded, multi-process kernel: thread lifecycle (create / join /
//! detach / exit), a bounded pipe channel, and a socket rendezvous layer
//! built from pipe pairs, all behind per-process descriptor tables.
//!
//! It is a *hosted* kernel core: schedulable contexts are OS threads, and
//! the kernel discipline of a single global dispatch lock plus per-object
//! condition variables is realized with a kernel-state mutex and
//! `Condvar`s stored in the control blocks.
//!
//! # Usage
//!
//! A host creates a [`Kernel`], spawns processes into it, and reaps them:
//!
//! ```no_run
//! use nanokern::Kernel;
//!
//! let kernel = Kernel::new();
//! let pid = kernel.spawn_process(
//!     Box::new(|_args| {
//!         // Kernel context: the syscall functions are available here.
//!         let (read_fd, write_fd) = nanokern::ipc::pipe::pipe().unwrap();
//!         nanokern::vfs::write(write_fd, b"hello").unwrap();
//!         let mut buf = [0u8; 5];
//!         nanokern::vfs::read(read_fd, &mut buf).unwrap();
//!         0
//!     }),
//!     Vec::new(),
//! );
//! assert_eq!(kernel.wait_process(pid), Some(0));
//! ```
//!
//! Inside a spawned task, the free functions in [`thread`], [`ipc::pipe`],
//! [`ipc::socket`] and [`vfs`] act on the calling context; on a thread not
//! spawned through a [`Kernel`] they fail with
//! [`KernelError::NotInKernelContext`].

pub mod error;
pub mod ipc;
pub mod process;
pub mod sched;
pub mod thread;
pub mod vfs;

pub use error::{KernelError, Result};
pub use ipc::pipe::{PipeId, PIPE_BUFFER_SIZE};
pub use ipc::socket::{Port, ShutdownMode, SocketId, MAX_PORT};
pub use process::{ProcessId, ProcessState};
pub use sched::{current, Current, Kernel, Task, TASK_PANIC_EXITVAL};
pub use thread::ThreadId;
pub use vfs::{Fid, MAX_OPEN_FILES};

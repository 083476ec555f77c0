//! Process records and lifecycle services.
//!
//! The process table is an external collaborator of the concurrency core:
//! it is modelled here exactly as deep as the thread lifecycle and teardown
//! protocols need it, and no deeper. There is no fork/exec; processes are
//! spawned from the host with [`crate::Kernel::spawn_process`] and reaped
//! with [`crate::Kernel::wait_process`].

mod table;

pub use table::{Process, ProcessId, ProcessState};
pub(crate) use table::teardown_locked;

//! Shared harness for the integration tests: run a task as a kernel
//! process and return its exit value, with a generous timeout so a
//! regression shows up as a test failure instead of a hung run.

use std::time::Duration;

use nanokern::Kernel;

/// Upper bound on any single test process.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawn `task` as a process on a fresh kernel and reap it.
///
/// Panics if the process does not terminate within [`TEST_TIMEOUT`].
pub fn run_process(task: impl FnOnce(Vec<u8>) -> i32 + Send + 'static) -> i32 {
    let kernel = Kernel::new();
    let pid = kernel.spawn_process(Box::new(task), Vec::new());
    kernel
        .wait_process_timeout(pid, TEST_TIMEOUT)
        .expect("test process did not terminate")
}

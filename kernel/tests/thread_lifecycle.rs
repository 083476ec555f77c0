//! Thread create / join / detach / exit behavior, exercised end to end
//! through spawned kernel processes.

mod common;

use std::sync::mpsc;

use nanokern::{thread, Kernel, KernelError, TASK_PANIC_EXITVAL};

use common::{run_process, TEST_TIMEOUT};

#[test]
fn join_returns_the_exit_value() {
    let exit = run_process(|_| {
        let tid = thread::create(Box::new(|_| 42), Vec::new()).unwrap();
        assert_eq!(thread::join(tid), Ok(42));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn join_self_fails() {
    let exit = run_process(|_| {
        let me = thread::current_thread().unwrap();
        assert_eq!(thread::join(me), Err(KernelError::JoinSelf));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn join_of_a_foreign_or_unknown_thread_fails() {
    let exit = run_process(|_| {
        assert_eq!(
            thread::join(nanokern::ThreadId(u64::MAX)),
            Err(KernelError::NoSuchThread)
        );
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn join_on_a_detached_thread_fails() {
    let exit = run_process(|_| {
        let (release, gate) = mpsc::channel::<()>();
        let tid = thread::create(
            Box::new(move |_| {
                gate.recv().ok();
                0
            }),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(thread::detach(tid), Ok(()));
        assert_eq!(thread::join(tid), Err(KernelError::ThreadDetached));
        release.send(()).unwrap();
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn detach_after_exit_fails_and_the_value_survives_for_join() {
    let exit = run_process(|_| {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let (release, gate) = mpsc::channel::<()>();
        let tid = thread::create(
            Box::new(move |_| {
                // Explicit exit: the record is terminal from here on, even
                // though the context keeps running until the gate opens.
                thread::exit(9);
                done_tx.send(()).unwrap();
                gate.recv().ok();
                // Ignored; the exit above already deposited 9.
                77
            }),
            Vec::new(),
        )
        .unwrap();
        done_rx.recv().unwrap();
        assert_eq!(thread::detach(tid), Err(KernelError::AlreadyExited));
        assert_eq!(thread::join(tid), Ok(9));
        release.send(()).unwrap();
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn the_record_is_reclaimed_after_a_successful_join() {
    let exit = run_process(|_| {
        let tid = thread::create(Box::new(|_| 5), Vec::new()).unwrap();
        assert_eq!(thread::join(tid), Ok(5));
        assert_eq!(thread::join(tid), Err(KernelError::NoSuchThread));
        assert_eq!(thread::detach(tid), Err(KernelError::NoSuchThread));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn concurrent_joiners_both_observe_the_exit_value() {
    let exit = run_process(|_| {
        let (release, gate) = mpsc::channel::<()>();
        let target = thread::create(
            Box::new(move |_| {
                gate.recv().ok();
                33
            }),
            Vec::new(),
        )
        .unwrap();

        let mut joiners = Vec::new();
        for _ in 0..2 {
            joiners.push(
                thread::create(
                    Box::new(move |_| match thread::join(target) {
                        Ok(33) => 0,
                        other => panic!("unexpected join outcome: {other:?}"),
                    }),
                    Vec::new(),
                )
                .unwrap(),
            );
        }
        // Let both joiners block on the live target before releasing it;
        // a joiner arriving after the record is reclaimed would otherwise
        // see NoSuchThread instead of the exit value.
        std::thread::sleep(std::time::Duration::from_millis(50));
        release.send(()).unwrap();
        for joiner in joiners {
            assert_eq!(thread::join(joiner), Ok(0));
        }
        // Exactly one joiner reclaimed the target.
        assert_eq!(thread::join(target), Err(KernelError::NoSuchThread));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn concurrent_joiners_fail_together_when_the_target_detaches() {
    let exit = run_process(|_| {
        let (release, gate) = mpsc::channel::<()>();
        let target = thread::create(
            Box::new(move |_| {
                gate.recv().ok();
                0
            }),
            Vec::new(),
        )
        .unwrap();

        let mut joiners = Vec::new();
        for _ in 0..2 {
            joiners.push(
                thread::create(
                    Box::new(move |_| match thread::join(target) {
                        Err(KernelError::ThreadDetached) => 0,
                        other => panic!("unexpected join outcome: {other:?}"),
                    }),
                    Vec::new(),
                )
                .unwrap(),
            );
        }
        // Let both joiners block on the live target before detaching it.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(thread::detach(target), Ok(()));
        for joiner in joiners {
            assert_eq!(thread::join(joiner), Ok(0));
        }
        release.send(()).unwrap();
        // The target's record is reclaimed exactly once, by its own exit
        // or by the last draining joiner.
        assert!(matches!(
            thread::join(target),
            Err(KernelError::ThreadDetached | KernelError::NoSuchThread)
        ));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn a_panicking_thread_exits_with_the_panic_value() {
    let exit = run_process(|_| {
        let tid = thread::create(Box::new(|_| panic!("boom")), Vec::new()).unwrap();
        assert_eq!(thread::join(tid), Ok(TASK_PANIC_EXITVAL));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn a_panicking_main_task_terminates_the_process() {
    let exit = run_process(|_| panic!("boom"));
    assert_eq!(exit, TASK_PANIC_EXITVAL);
}

#[test]
fn the_last_thread_to_exit_carries_the_process_exit_value() {
    let kernel = Kernel::new();
    let (release, gate) = mpsc::channel::<()>();
    let pid = kernel.spawn_process(
        Box::new(move |_| {
            thread::create(
                Box::new(move |_| {
                    gate.recv().ok();
                    21
                }),
                Vec::new(),
            )
            .unwrap();
            // Main returns first; the process lives on until the worker
            // exits and its value becomes the process exit value.
            0
        }),
        Vec::new(),
    );
    release.send(()).unwrap();
    assert_eq!(kernel.wait_process_timeout(pid, TEST_TIMEOUT), Some(21));
}

#[test]
fn process_arguments_reach_the_main_task() {
    let kernel = Kernel::new();
    let pid = kernel.spawn_process(
        Box::new(|args| if args == b"payload" { 0 } else { 1 }),
        b"payload".to_vec(),
    );
    assert_eq!(kernel.wait_process_timeout(pid, TEST_TIMEOUT), Some(0));
}

#[test]
fn syscalls_fail_outside_a_kernel_context() {
    assert_eq!(
        thread::create(Box::new(|_| 0), Vec::new()),
        Err(KernelError::NotInKernelContext)
    );
    assert_eq!(
        nanokern::ipc::pipe::pipe(),
        Err(KernelError::NotInKernelContext)
    );
}

#[test]
fn waiting_on_an_unknown_process_returns_none() {
    let kernel = Kernel::new();
    assert_eq!(kernel.wait_process(nanokern::ProcessId(u64::MAX)), None);
}

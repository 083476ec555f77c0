//! Socket rendezvous: listen/connect/accept, shutdown semantics, the
//! refcounted close protocol, and cross-process teardown.

mod common;

use std::sync::mpsc;
use std::time::Duration;

use nanokern::ipc::socket::{self, Port, ShutdownMode};
use nanokern::{thread, vfs, Kernel, KernelError};

use common::{run_process, TEST_TIMEOUT};

fn port(n: u16) -> Port {
    Port::new(n).unwrap()
}

#[test]
fn rendezvous_delivers_data_both_ways() {
    let exit = run_process(|_| {
        let listener = socket::socket(Some(port(5))).unwrap();
        socket::listen(listener).unwrap();

        let connector = thread::create(
            Box::new(|_| {
                let sock = socket::socket(None).unwrap();
                socket::connect(sock, port(5), None).unwrap();
                assert_eq!(vfs::write(sock, b"hi"), Ok(2));
                let mut buf = [0u8; 2];
                assert_eq!(vfs::read(sock, &mut buf), Ok(2));
                assert_eq!(&buf, b"ok");
                0
            }),
            Vec::new(),
        )
        .unwrap();

        let peer = socket::accept(listener).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(vfs::read(peer, &mut buf), Ok(2));
        assert_eq!(&buf, b"hi");
        assert_eq!(vfs::write(peer, b"ok"), Ok(2));
        assert_eq!(thread::join(connector), Ok(0));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn connect_without_a_listener_fails_immediately() {
    let exit = run_process(|_| {
        let sock = socket::socket(None).unwrap();
        assert_eq!(
            socket::connect(sock, port(7), Some(Duration::from_millis(100))),
            Err(KernelError::NoListener)
        );
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn connect_times_out_when_nobody_accepts() {
    let exit = run_process(|_| {
        let listener = socket::socket(Some(port(8))).unwrap();
        socket::listen(listener).unwrap();
        let sock = socket::socket(None).unwrap();
        assert_eq!(
            socket::connect(sock, port(8), Some(Duration::from_millis(100))),
            Err(KernelError::ConnectTimedOut)
        );
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn closing_the_listener_fails_a_blocked_connector() {
    let exit = run_process(|_| {
        let listener = socket::socket(Some(port(9))).unwrap();
        socket::listen(listener).unwrap();

        let connector = thread::create(
            Box::new(|_| {
                let sock = socket::socket(None).unwrap();
                // No timeout: only the listener teardown can end this wait.
                match socket::connect(sock, port(9), None) {
                    Err(KernelError::ConnectionRefused) => 0,
                    other => panic!("unexpected connect outcome: {other:?}"),
                }
            }),
            Vec::new(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        vfs::close(listener).unwrap();
        assert_eq!(thread::join(connector), Ok(0));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn closing_the_listener_fails_a_blocked_accept() {
    let exit = run_process(|_| {
        let listener = socket::socket(Some(port(10))).unwrap();
        socket::listen(listener).unwrap();

        let acceptor = thread::create(
            Box::new(move |_| match socket::accept(listener) {
                Err(KernelError::HandleClosed) => 0,
                other => panic!("unexpected accept outcome: {other:?}"),
            }),
            Vec::new(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        vfs::close(listener).unwrap();
        assert_eq!(thread::join(acceptor), Ok(0));
        // The port is free again.
        let fresh = socket::socket(Some(port(10))).unwrap();
        assert_eq!(socket::listen(fresh), Ok(()));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn a_port_has_at_most_one_listener() {
    let exit = run_process(|_| {
        let first = socket::socket(Some(port(11))).unwrap();
        let second = socket::socket(Some(port(11))).unwrap();
        assert_eq!(socket::listen(first), Ok(()));
        assert_eq!(socket::listen(second), Err(KernelError::PortInUse));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn listen_requires_an_unbound_socket_with_a_port() {
    let exit = run_process(|_| {
        let portless = socket::socket(None).unwrap();
        assert_eq!(socket::listen(portless), Err(KernelError::NoPortBound));

        let listener = socket::socket(Some(port(12))).unwrap();
        socket::listen(listener).unwrap();
        assert_eq!(socket::listen(listener), Err(KernelError::NotUnbound));
        assert_eq!(socket::accept(portless), Err(KernelError::NotAListener));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn a_timed_out_request_is_never_admitted() {
    let exit = run_process(|_| {
        let listener = socket::socket(Some(port(13))).unwrap();
        socket::listen(listener).unwrap();

        // First connector gives up before anyone accepts.
        let stale = socket::socket(None).unwrap();
        assert_eq!(
            socket::connect(stale, port(13), Some(Duration::from_millis(50))),
            Err(KernelError::ConnectTimedOut)
        );

        // Second connector arrives afterwards; accept must pair with it,
        // not with the abandoned request.
        let connector = thread::create(
            Box::new(|_| {
                let sock = socket::socket(None).unwrap();
                socket::connect(sock, port(13), None).unwrap();
                assert_eq!(vfs::write(sock, b"fresh"), Ok(5));
                0
            }),
            Vec::new(),
        )
        .unwrap();

        let peer = socket::accept(listener).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(vfs::read(peer, &mut buf), Ok(5));
        assert_eq!(&buf, b"fresh");
        assert_eq!(thread::join(connector), Ok(0));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn shutdown_write_delivers_eof_and_keeps_the_reverse_direction() {
    let exit = run_process(|_| {
        let listener = socket::socket(Some(port(14))).unwrap();
        socket::listen(listener).unwrap();

        let connector = thread::create(
            Box::new(|_| {
                let sock = socket::socket(None).unwrap();
                socket::connect(sock, port(14), None).unwrap();
                assert_eq!(vfs::write(sock, b"last"), Ok(4));
                socket::shutdown(sock, ShutdownMode::WRITE).unwrap();
                assert_eq!(vfs::write(sock, b"x"), Err(KernelError::DirectionClosed));
                // The reverse direction still works.
                let mut buf = [0u8; 4];
                assert_eq!(vfs::read(sock, &mut buf), Ok(4));
                assert_eq!(&buf, b"back");
                0
            }),
            Vec::new(),
        )
        .unwrap();

        let peer = socket::accept(listener).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(vfs::read(peer, &mut buf), Ok(4));
        assert_eq!(&buf[..4], b"last");
        // EOF once the shut-down direction drains.
        assert_eq!(vfs::read(peer, &mut buf), Ok(0));
        assert_eq!(vfs::write(peer, b"back"), Ok(4));
        assert_eq!(thread::join(connector), Ok(0));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn shutdown_read_and_both_close_each_direction() {
    let exit = run_process(|_| {
        let listener = socket::socket(Some(port(17))).unwrap();
        socket::listen(listener).unwrap();
        let (read_shut_tx, read_shut_rx) = mpsc::channel::<()>();

        let connector = thread::create(
            Box::new(move |_| {
                let sock = socket::socket(None).unwrap();
                socket::connect(sock, port(17), None).unwrap();
                socket::shutdown(sock, ShutdownMode::READ).unwrap();
                let mut buf = [0u8; 4];
                assert_eq!(vfs::read(sock, &mut buf), Err(KernelError::DirectionClosed));
                read_shut_tx.send(()).unwrap();
                // The write direction survives a read-only shutdown.
                assert_eq!(vfs::write(sock, b"ping"), Ok(4));
                socket::shutdown(sock, ShutdownMode::BOTH).unwrap();
                assert_eq!(vfs::write(sock, b"x"), Err(KernelError::DirectionClosed));
                0
            }),
            Vec::new(),
        )
        .unwrap();

        let peer = socket::accept(listener).unwrap();
        read_shut_rx.recv().unwrap();
        // The connector's read direction is gone, so this side's writes
        // hit a pipe with no reader.
        assert_eq!(vfs::write(peer, b"dead"), Err(KernelError::BrokenPipe));
        let mut buf = [0u8; 16];
        assert_eq!(vfs::read(peer, &mut buf), Ok(4));
        assert_eq!(&buf[..4], b"ping");
        // EOF once the connector closes its remaining direction.
        assert_eq!(vfs::read(peer, &mut buf), Ok(0));
        assert_eq!(thread::join(connector), Ok(0));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn shutdown_requires_a_peer_and_a_real_mode() {
    let exit = run_process(|_| {
        let sock = socket::socket(Some(port(15))).unwrap();
        assert_eq!(
            socket::shutdown(sock, ShutdownMode::empty()),
            Err(KernelError::InvalidShutdownMode)
        );
        assert_eq!(
            socket::shutdown(sock, ShutdownMode::BOTH),
            Err(KernelError::NotAPeer)
        );
        let mut buf = [0u8; 1];
        assert_eq!(vfs::read(sock, &mut buf), Err(KernelError::NotAPeer));
        assert_eq!(vfs::write(sock, b"x"), Err(KernelError::NotAPeer));
        0
    });
    assert_eq!(exit, 0);
}

#[test]
fn process_teardown_closes_peer_sockets() {
    let kernel = Kernel::new();
    let (listening_tx, listening_rx) = mpsc::channel::<()>();

    let server = kernel.spawn_process(
        Box::new(move |_| {
            let listener = socket::socket(Some(port(16))).unwrap();
            socket::listen(listener).unwrap();
            listening_tx.send(()).unwrap();
            let peer = socket::accept(listener).unwrap();
            let mut collected = Vec::new();
            let mut buf = [0u8; 8];
            loop {
                let n = vfs::read(peer, &mut buf).unwrap();
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }
            if collected == b"bye" { 0 } else { 1 }
        }),
        Vec::new(),
    );

    let client = kernel.spawn_process(
        Box::new(move |_| {
            listening_rx.recv().unwrap();
            let sock = socket::socket(None).unwrap();
            socket::connect(sock, port(16), None).unwrap();
            assert_eq!(vfs::write(sock, b"bye"), Ok(3));
            // Exit without closing: teardown must close the socket and
            // deliver EOF to the server.
            0
        }),
        Vec::new(),
    );

    assert_eq!(kernel.wait_process_timeout(client, TEST_TIMEOUT), Some(0));
    assert_eq!(kernel.wait_process_timeout(server, TEST_TIMEOUT), Some(0));
}

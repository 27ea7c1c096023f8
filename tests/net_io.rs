//! Stream I/O: echo paths, timeout synthesis, waiter conflicts, close.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft::net::{TcpListener, TcpServer, TcpStream};
use weft::reactor::Direction;
use weft::runtime::{sleep, Builder, Handle, Runtime};

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

fn runtime(workers: usize) -> Runtime {
    Builder::new()
        .worker_threads(workers)
        .build()
        .expect("runtime")
}

/// A std-thread peer that accepts one connection and runs `serve` on it.
fn silent_peer<F>(serve: F) -> SocketAddr
where
    F: FnOnce(std::net::TcpStream) + Send + 'static,
{
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    std::thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            serve(stream);
        }
    });
    addr
}

#[test]
fn echo_roundtrip_through_runtime_listener() {
    init();
    let rt = runtime(2);
    rt.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = Handle::current().spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.expect("read");
            stream.write_exact(&buf).await.expect("write");
        });

        let client = TcpStream::connect(addr).await.expect("connect");
        client.write_exact(b"hello").await.expect("write");
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"hello");
        server.await.expect("server task");
    });
}

#[test]
fn read_timeout_is_synthesized_and_fd_survives() {
    init();
    // The peer stays silent for 200 ms, then speaks. A 50 ms read
    // timeout must fire in the 50–150 ms window and leave the stream
    // usable for the next read.
    let addr = silent_peer(|mut stream| {
        std::thread::sleep(Duration::from_millis(200));
        let _ = stream.write_all(b"late");
        std::thread::sleep(Duration::from_millis(200));
    });

    let rt = runtime(1);
    rt.block_on(async {
        let stream = TcpStream::connect(addr).await.expect("connect");
        stream.set_read_timeout(Some(Duration::from_millis(50)));

        let started = Instant::now();
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.expect_err("must time out");
        let elapsed = started.elapsed();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert!(
            elapsed >= Duration::from_millis(45) && elapsed <= Duration::from_millis(150),
            "timeout fired at {elapsed:?}"
        );

        // Same fd, longer deadline: the late bytes arrive.
        stream.set_read_timeout(Some(Duration::from_secs(2)));
        stream.read_exact(&mut buf).await.expect("fd still usable");
        assert_eq!(&buf, b"late");
    });
}

#[test]
fn second_reader_conflicts_then_cancel_wakes_first() {
    init();
    let addr = silent_peer(|_stream| {
        std::thread::sleep(Duration::from_millis(500));
    });

    let rt = runtime(2);
    rt.block_on(async {
        let stream = TcpStream::connect(addr).await.expect("connect");

        let reader = stream.clone();
        let first = Handle::current().spawn(async move {
            let mut buf = [0u8; 1];
            reader.read(&mut buf).await
        });
        // Let the first reader arm its waiter.
        sleep(Duration::from_millis(50)).await;

        let mut buf = [0u8; 1];
        let second = stream.read(&mut buf).await.expect_err("second waiter");
        assert_eq!(second.kind(), std::io::ErrorKind::AlreadyExists);

        assert!(stream.cancel_pending(Direction::Read), "waiter present");
        let woken = first.await.expect("reader task");
        let err = woken.expect_err("cancelled read errors");
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);

        // The slot is free again.
        stream.set_read_timeout(Some(Duration::from_millis(30)));
        let again = stream.read(&mut buf).await.expect_err("times out");
        assert_eq!(again.kind(), std::io::ErrorKind::TimedOut);
    });
}

#[test]
fn close_is_idempotent_and_fails_later_ops() {
    init();
    let addr = silent_peer(|mut stream| {
        let mut buf = [0u8; 1];
        let _ = stream.read(&mut buf);
    });

    let rt = runtime(1);
    rt.block_on(async {
        let stream = TcpStream::connect(addr).await.expect("connect");
        stream.close();
        stream.close();
        assert!(stream.is_closed());
        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.expect_err("closed stream");
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    });
}

#[test]
fn write_timeout_applies_to_full_pipes() {
    init();
    // Peer never reads; client floods until the kernel buffers fill, at
    // which point the 50 ms send deadline fires.
    let addr = silent_peer(|stream| {
        std::thread::sleep(Duration::from_millis(2000));
        drop(stream);
    });

    let rt = runtime(1);
    rt.block_on(async {
        let stream = TcpStream::connect(addr).await.expect("connect");
        stream.set_write_timeout(Some(Duration::from_millis(50)));
        let chunk = vec![0u8; 256 * 1024];
        let started = Instant::now();
        let mut result = Ok(());
        for _ in 0..64 {
            result = stream.write_exact(&chunk).await;
            if result.is_err() {
                break;
            }
        }
        let err = result.expect_err("pipe must fill and time out");
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2), "timed out promptly");
    });
}

#[test]
fn user_nonblocking_surfaces_wouldblock() {
    init();
    let addr = silent_peer(|_stream| {
        std::thread::sleep(Duration::from_millis(300));
    });

    let rt = runtime(1);
    rt.block_on(async {
        let stream = TcpStream::connect(addr).await.expect("connect");
        stream.set_user_nonblocking(true);
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.expect_err("nothing buffered");
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
        assert!(stream.user_nonblocking());
    });
}

#[test]
fn acceptor_stamps_recv_timeout_and_stops() {
    init();
    let rt = runtime(2);
    rt.block_on(async {
        let handle = Handle::current();
        let server = TcpServer::new("echo", handle.clone(), handle.clone());
        let addr = server
            .bind("127.0.0.1:0".parse().unwrap())
            .expect("bind");
        server.set_recv_timeout(Some(Duration::from_millis(40)));
        server.set_handler(Arc::new(|io: &Handle, stream: TcpStream| {
            io.spawn(async move {
                // The stamped timeout fires against a silent client.
                let mut buf = [0u8; 1];
                let err = stream.read(&mut buf).await.expect_err("stamped timeout");
                assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
                stream.write_exact(b"t").await.expect("report back");
            });
        }));
        server.start().expect("start");

        let client = TcpStream::connect(addr).await.expect("connect");
        client.set_read_timeout(Some(Duration::from_secs(2)));
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.expect("handler replied");
        assert_eq!(&buf, b"t");

        server.stop();
        server.stop();
    });
}

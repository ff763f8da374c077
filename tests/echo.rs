//! End-to-end transfer scenarios over loopback TCP.

use corio::net::SocketService;
use corio::test_utils::init_test_logging;
use corio::{async_run, combinator, Acceptor, Endpoint, IoContext, Socket};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn single_context_echo() {
    init_test_logging();
    let ctx = IoContext::new().expect("context");
    let ex = ctx.executor();

    let acceptor = Acceptor::new(&ctx);
    acceptor.listen(Endpoint::loopback(0), 128).expect("listen");
    let port = acceptor.local_endpoint().expect("bound").port();
    assert_ne!(port, 0);

    // Accept-then-echo coroutine.
    async_run(&ex, async move {
        let peer = acceptor.accept().await.expect("accept");
        let mut buf = [0u8; 64];
        let n = peer.read_some(&mut buf).await.expect("server read");
        let written = peer.write_some(&buf[..n]).await.expect("server write");
        assert_eq!(written, n);
        peer.close();
        acceptor.close();
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let client = Socket::new(&ctx);
    async_run(&ex, async move {
        client.open().expect("open");
        client
            .connect(Endpoint::loopback(port))
            .await
            .expect("connect");

        let n = client.write_some(b"hello".as_slice()).await.expect("write");
        assert_eq!(n, 5);

        let mut buf = [0u8; 5];
        let n = combinator::read(&client, &mut buf).await.expect("read");
        assert_eq!(n, 5);
        sink.lock().extend_from_slice(&buf);
        client.close();
    });

    ctx.run();
    assert_eq!(received.lock().as_slice(), b"hello");

    // Both sides closed and dropped: no leaked impls.
    let sockets = ctx.find_service::<SocketService>().expect("socket service");
    assert_eq!(sockets.live_impls(), 0);
}

#[test]
fn large_write_loop_round_trips() {
    init_test_logging();
    const TOTAL: usize = 1_048_576;
    const CHUNK: usize = 65_536;

    let ctx = IoContext::new().expect("context");
    let ex = ctx.executor();

    let acceptor = Acceptor::new(&ctx);
    acceptor.listen(Endpoint::loopback(0), 16).expect("listen");
    let port = acceptor.local_endpoint().expect("bound").port();

    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let received = Arc::new(Mutex::new(Vec::with_capacity(TOTAL)));
    let sink = received.clone();

    // Reader side: drain until the payload is complete.
    async_run(&ex, async move {
        let peer = acceptor.accept().await.expect("accept");
        let mut buf = vec![0u8; CHUNK];
        let mut total = 0usize;
        while total < TOTAL {
            let n = peer.read_some(&mut buf).await.expect("peer read");
            assert!(n > 0);
            sink.lock().extend_from_slice(&buf[..n]);
            total += n;
        }
        peer.close();
        acceptor.close();
    });

    // Writer side: chunked writes, retrying short transfers.
    let client = Socket::new(&ctx);
    async_run(&ex, async move {
        client.open().expect("open");
        client
            .connect(Endpoint::loopback(port))
            .await
            .expect("connect");

        let mut sent = 0usize;
        while sent < TOTAL {
            let end = (sent + CHUNK).min(TOTAL);
            let n = combinator::write_all(&client, &payload[sent..end])
                .await
                .expect("write_all");
            assert_eq!(n, end - sent);
            sent += n;
        }
        client.close();
    });

    ctx.run();

    let received = received.lock();
    assert_eq!(received.len(), TOTAL);
    assert_eq!(*received, expected);
}

#[test]
fn serve_spawns_one_handler_per_connection() {
    init_test_logging();
    const CLIENTS: usize = 4;

    let ctx = IoContext::new().expect("context");
    let ex = ctx.executor();

    let acceptor = Arc::new(Acceptor::new(&ctx));
    acceptor.listen(Endpoint::loopback(0), 16).expect("listen");
    let port = acceptor.local_endpoint().expect("bound").port();

    let served = Arc::new(AtomicUsize::new(0));

    let server_ex = ex.clone();
    let server_acceptor = acceptor.clone();
    let tally = served.clone();
    async_run(&ex, async move {
        combinator::serve(&server_ex, &server_acceptor, move |peer| {
            let tally = tally.clone();
            async move {
                let mut buf = [0u8; 8];
                let n = peer.read_some(&mut buf).await.expect("handler read");
                peer.write_some(&buf[..n]).await.expect("handler write");
                tally.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .expect("serve");
    });

    let done = Arc::new(AtomicUsize::new(0));
    for id in 0..CLIENTS {
        let done = done.clone();
        let stop_acceptor = acceptor.clone();
        let client = Socket::new(&ctx);
        async_run(&ex, async move {
            client.open().expect("open");
            client
                .connect(Endpoint::loopback(port))
                .await
                .expect("connect");
            let msg = [id as u8; 4];
            client.write_some(msg.as_slice()).await.expect("write");
            let mut buf = [0u8; 4];
            combinator::read(&client, &mut buf).await.expect("read");
            assert_eq!(buf, msg);
            client.close();
            if done.fetch_add(1, Ordering::SeqCst) + 1 == CLIENTS {
                // Last client shuts the serve loop down.
                stop_acceptor.cancel();
            }
        });
    }

    ctx.run();
    assert_eq!(served.load(Ordering::SeqCst), CLIENTS);
}

//! Scheduler semantics: run family, work counting, frame pool
//! balance, boundary behaviors.

use corio::test_utils::init_test_logging;
use corio::{
    async_run, async_run_in, Endpoint, ErrorKind, FramePool, IoContext, Socket, Timer,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn run_executes_all_posted_tasks_then_returns() {
    init_test_logging();
    let ctx = IoContext::new().expect("context");
    let ex = ctx.executor();

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let c = count.clone();
        async_run(&ex, async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    let handled = ctx.run();
    assert_eq!(count.load(Ordering::SeqCst), 10);
    assert_eq!(handled, 10);
    // Nothing left: an immediate re-run returns zero.
    assert_eq!(ctx.run(), 0);
}

#[test]
fn work_guard_keeps_idle_context_alive() {
    init_test_logging();
    let ctx = Arc::new(IoContext::new().expect("context"));
    ctx.on_work_started();

    let runner = ctx.clone();
    let handle = std::thread::spawn(move || runner.run());

    // The context has no handlers, only the explicit work guard;
    // releasing it lets run() return.
    std::thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());
    ctx.on_work_finished();
    let handled = handle.join().expect("run thread");
    assert_eq!(handled, 0);
}

#[test]
fn two_threads_service_one_context() {
    init_test_logging();
    const TASKS: usize = 64;
    let ctx = IoContext::new().expect("context");
    let ex = ctx.executor();

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..TASKS {
        let c = count.clone();
        async_run(&ex, async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    std::thread::scope(|s| {
        let a = s.spawn(|| ctx.run());
        let b = s.spawn(|| ctx.run());
        let _ = a.join().expect("runner a");
        let _ = b.join().expect("runner b");
    });

    assert_eq!(count.load(Ordering::SeqCst), TASKS);
}

#[test]
fn stop_propagates_to_all_runners() {
    init_test_logging();
    let ctx = Arc::new(IoContext::new().expect("context"));
    ctx.on_work_started();

    let runners: Vec<_> = (0..3)
        .map(|_| {
            let runner = ctx.clone();
            std::thread::spawn(move || runner.run())
        })
        .collect();

    std::thread::sleep(Duration::from_millis(30));
    ctx.stop();
    for handle in runners {
        handle.join().expect("runner thread");
    }
    assert!(ctx.stopped());
    ctx.on_work_finished();
}

#[test]
fn poll_runs_ready_handlers_without_blocking() {
    init_test_logging();
    let ctx = IoContext::new().expect("context");
    let ex = ctx.executor();

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let c = count.clone();
        async_run(&ex, async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    let start = Instant::now();
    let handled = ctx.poll();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(handled, 3);
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn poll_one_runs_exactly_one() {
    init_test_logging();
    let ctx = IoContext::new().expect("context");
    let ex = ctx.executor();

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let c = count.clone();
        async_run(&ex, async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert_eq!(ctx.poll_one(), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.poll(), 1);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn frame_pool_balances_and_reuses() {
    init_test_logging();
    const GENERATIONS: usize = 5;
    const TASKS_PER_GENERATION: usize = 8;

    let pool = Arc::new(FramePool::new());
    let ctx = IoContext::new().expect("context");
    let ex = ctx.executor();

    for _ in 0..GENERATIONS {
        for _ in 0..TASKS_PER_GENERATION {
            let pool_ref: Arc<dyn corio::FrameAllocator> = pool.clone();
            async_run_in(
                &ex,
                async move {
                    std::hint::black_box(0u64);
                },
                pool_ref,
            );
        }
        ctx.run();
        ctx.restart();
    }

    let stats = pool.stats();
    assert_eq!(
        stats.allocations,
        (GENERATIONS * TASKS_PER_GENERATION) as u64
    );
    assert_eq!(stats.allocations, stats.deallocations);
    assert_eq!(stats.bytes_allocated, stats.bytes_freed);
    // Later generations recycle the first generation's blocks.
    assert!(stats.reuses > 0, "expected frame reuse, got {stats:?}");
}

#[test]
fn connect_to_unbound_port_is_refused() {
    init_test_logging();
    let ctx = IoContext::new().expect("context");
    let ex = ctx.executor();

    // Bind an ephemeral port, then free it: nothing listens there.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
        probe.local_addr().expect("probe addr").port()
    };

    let outcome = Arc::new(Mutex::new(None));
    let result = outcome.clone();
    let client = Socket::new(&ctx);
    async_run(&ex, async move {
        client.open().expect("open");
        *result.lock() = Some(client.connect(Endpoint::loopback(port)).await);
    });

    ctx.run();
    let err = outcome
        .lock()
        .take()
        .expect("connect resolved")
        .expect_err("refused");
    assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
}

#[test]
fn zero_length_read_is_ok_not_eof() {
    init_test_logging();
    let ctx = IoContext::new().expect("context");
    let ex = ctx.executor();

    let acceptor = corio::Acceptor::new(&ctx);
    acceptor.listen(Endpoint::loopback(0), 16).expect("listen");
    let port = acceptor.local_endpoint().expect("bound").port();

    async_run(&ex, async move {
        let _peer = acceptor.accept().await.expect("accept");
        acceptor.close();
    });

    let outcome = Arc::new(Mutex::new(None));
    let result = outcome.clone();
    let client = Socket::new(&ctx);
    async_run(&ex, async move {
        client.open().expect("open");
        client
            .connect(Endpoint::loopback(port))
            .await
            .expect("connect");
        let mut empty = [0u8; 0];
        *result.lock() = Some(client.read_some(&mut empty).await);
    });

    ctx.run();
    let n = outcome
        .lock()
        .take()
        .expect("read resolved")
        .expect("zero-length read succeeds");
    assert_eq!(n, 0);
}

#[test]
fn past_deadline_timer_fires_on_next_iteration() {
    init_test_logging();
    let ctx = IoContext::new().expect("context");
    let ex = ctx.executor();

    let timer = Arc::new(Timer::new(&ctx));
    timer.expires_at(Instant::now() - Duration::from_secs(1));

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let t = timer.clone();
    async_run(&ex, async move {
        t.wait().await.expect("past deadline");
        f.fetch_add(1, Ordering::SeqCst);
    });

    let start = Instant::now();
    ctx.run();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_millis(200));
}

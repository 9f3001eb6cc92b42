//! edrt End-to-End Smoke Test
//!
//! Exercises the runtime on real descriptors:
//!   Part A: AsyncWriter: FIFO across coalescing splits, stop/free order
//!   Part B: AsyncReader + EventHandler: chunks marshaled to the loop
//!   Part C: WorkerPool: completions drained on the main thread, backpressure
//!   Part D: PauseGuard + futures
//!   Part E: Listener + network log sink on loopback sockets
//!   Part F: Runtime context teardown
//!
//! Run: ./target/release/smoke

use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use edrt::{
    AsyncReader, AsyncWriter, Backpressure, EventHandler, Key, PauseGuard, PoolConfig,
    ReaderConfig, RtError, Runtime, RuntimeConfig, WorkerPool, WriterConfig,
};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";
const TIMEOUT: Duration = Duration::from_secs(5);

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn pipe() -> Option<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // Safety: fds has room for both descriptors.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return None;
    }
    // Safety: pipe() handed us both descriptors.
    Some(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn read_all(fd: OwnedFd) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = std::fs::File::from(fd).read_to_end(&mut out);
    out
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while !done() {
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

// ── Part A ──

fn test_writer(t: &mut TestRunner) {
    t.section("Part A: AsyncWriter");

    let Some((r, w)) = pipe() else {
        t.fail("pipe()", "pipe failed");
        return;
    };
    let config = WriterConfig { buffer_size: 7, ..WriterConfig::default() };
    let writer = match AsyncWriter::from_owned(w, config) {
        Ok(w) => w,
        Err(e) => {
            t.fail("create writer", &e.to_string());
            return;
        }
    };
    t.pass("create writer on pipe");

    // Reader side drains concurrently so large payloads never fill the pipe.
    let drain = thread::spawn(move || read_all(r));

    let mut expected = Vec::new();
    for i in 0..500 {
        let chunk = format!("chunk-{}|", i);
        expected.extend_from_slice(chunk.as_bytes());
        let _ = writer.write(chunk.as_bytes());
    }
    let _ = writer.printf(format_args!("tail {}\n", 42));
    expected.extend_from_slice(b"tail 42\n");

    let writer = match writer.free() {
        Err(w) => {
            t.pass("free before stop is refused");
            w
        }
        Ok(()) => {
            t.fail("free before stop is refused", "free succeeded");
            return;
        }
    };

    writer.stop();
    let stats = writer.stats();
    t.check("stop twice is harmless", { writer.stop(); writer.is_stopped() }, "not stopped");
    t.check(
        "write after stop",
        writer.write(b"late") == Err(RtError::Stopped),
        "accepted",
    );
    t.check("free after stop", writer.free().is_ok(), "refused");

    let got = drain.join().unwrap_or_default();
    t.check("FIFO across splits", got == expected, &format!("{} vs {} bytes", got.len(), expected.len()));
    t.check(
        "stats count every byte",
        stats.bytes_written == expected.len() as u64,
        &format!("{:?}", stats),
    );
}

// ── Part B ──

fn test_reader(t: &mut TestRunner) {
    t.section("Part B: AsyncReader + EventHandler");

    let handler = EventHandler::new();
    let Some((r, w)) = pipe() else {
        t.fail("pipe()", "pipe failed");
        return;
    };
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let reader = AsyncReader::create(handler.submitter(), r, ReaderConfig::default(), move |h, bytes| {
        let bytes = bytes.to_vec();
        let s = Arc::clone(&s);
        let stop = h.clone();
        let _ = h.submit(move || {
            s.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(&bytes);
            if bytes.contains(&b'\n') {
                stop.stop(11);
            }
        });
    });
    let reader = match reader {
        Ok(r) => r,
        Err(e) => {
            t.fail("create reader", &e.to_string());
            return;
        }
    };
    t.pass("create reader on pipe");

    let mut w = std::fs::File::from(w);
    let _ = w.write_all(b"typed\n");
    t.check("loop returns stop status", handler.start(false) == Ok(11), "wrong status");
    t.check(
        "bytes reached handler thread",
        *seen.lock().unwrap_or_else(|e| e.into_inner()) == b"typed\n",
        "mismatch",
    );

    reader.stop();
    t.check("reader stats", reader.stats().bytes_read == 6, &format!("{:?}", reader.stats()));
    t.check("reader free after stop", reader.free().is_ok(), "refused");

    let spawned = handler.start(true) == Ok(0);
    handler.stop(4);
    t.check("spawned loop joins with status", spawned && handler.join() == Some(4), "no status");
}

// ── Part C ──

fn test_pool(t: &mut TestRunner) {
    t.section("Part C: WorkerPool + CallbackQueue");

    let config = PoolConfig { num_workers: 4, queue_size: 64, policy: Backpressure::Reject };
    let pool = match WorkerPool::new(config, None) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            t.fail("create pool", &e.to_string());
            return;
        }
    };
    t.pass("create pool (4 workers)");

    let markers = Arc::new(Mutex::new(Vec::new()));
    let main = thread::current().id();
    let off_main = Arc::new(AtomicUsize::new(0));
    for i in 0..40usize {
        let m = Arc::clone(&markers);
        let off = Arc::clone(&off_main);
        let _ = pool.enqueue(
            move || i,
            move |v| {
                if thread::current().id() != main {
                    off.fetch_add(1, Ordering::SeqCst);
                }
                m.lock().unwrap_or_else(|e| e.into_inner()).push(v);
            },
        );
    }
    let mut drained = 0;
    let complete = wait_for(|| {
        drained += pool.drain_callbacks().unwrap_or(0);
        drained >= 40
    });
    let mut got = markers.lock().unwrap_or_else(|e| e.into_inner()).clone();
    got.sort_unstable();
    t.check("every marker drained once", complete && got == (0..40).collect::<Vec<_>>(), "missing markers");
    t.check("callbacks ran on main thread", off_main.load(Ordering::SeqCst) == 0, "ran elsewhere");

    let p = Arc::clone(&pool);
    let refused = thread::spawn(move || p.drain_callbacks()).join().ok();
    t.check("drain off main thread refused", refused == Some(Err(RtError::NotMainThread)), "allowed");

    // Saturate: one blocked task plus a full queue.
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel();
    let small = match WorkerPool::new(PoolConfig { num_workers: 1, queue_size: 2, policy: Backpressure::Reject }, None) {
        Ok(p) => p,
        Err(e) => {
            t.fail("create small pool", &e.to_string());
            return;
        }
    };
    let _ = small.execute(move || {
        let _ = started_tx.send(());
        let _ = release_rx.recv();
    });
    let _ = started_rx.recv_timeout(TIMEOUT);
    let _ = small.execute(|| {});
    let _ = small.execute(|| {});
    t.check("full queue rejects", small.execute(|| {}) == Err(RtError::QueueFull), "accepted");
    t.check("queue never overruns", small.queued() <= 2, "overrun");
    let _ = release_tx.send(());
    small.shutdown();
}

// ── Part D ──

fn test_pause(t: &mut TestRunner) {
    t.section("Part D: PauseGuard + futures");

    let pool = match WorkerPool::new(PoolConfig::default(), None) {
        Ok(p) => p,
        Err(e) => {
            t.fail("create pool", &e.to_string());
            return;
        }
    };

    let ran = Arc::new(AtomicUsize::new(0));
    {
        let _outer = PauseGuard::new(&pool);
        {
            let _inner = PauseGuard::new(&pool);
        }
        t.check("nested guard keeps pause", pool.is_paused(), "resumed early");
        let r = Arc::clone(&ran);
        let _ = pool.execute(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(20));
        t.check("paused pool starts nothing", ran.load(Ordering::SeqCst) == 0, "task ran");
    }
    t.check("outermost guard resumes", !pool.is_paused(), "still paused");
    t.check("held task runs after resume", wait_for(|| ran.load(Ordering::SeqCst) == 1), "never ran");

    let off_main_paused = thread::scope(|s| {
        s.spawn(|| {
            let _g = PauseGuard::new(&pool);
            pool.is_paused()
        })
        .join()
        .unwrap_or(true)
    });
    t.check("guard off main thread is a no-op", !off_main_paused, "paused");

    let value = edrt::submit(|| (1..=10).product::<u64>()).and_then(|f| f.get());
    t.check("thread future", value == Ok(3_628_800), &format!("{:?}", value));
    let pooled = pool.submit(|| "pooled").and_then(|f| f.get());
    t.check("pool future", pooled == Ok("pooled"), &format!("{:?}", pooled));
}

// ── Part E ──

fn test_sockets(t: &mut TestRunner) {
    t.section("Part E: Listener + netlog");

    let path = std::env::temp_dir().join(format!("edrt-smoke-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    match UnixListener::bind(&path) {
        Ok(sock) => {
            let handler = EventHandler::new();
            let (tx, rx) = mpsc::channel();
            let key = handler.register_listener(OwnedFd::from(sock), move |_, conn| {
                let _ = tx.send(conn);
            });
            t.check("register listener", key.is_ok(), "failed");
            let client = UnixStream::connect(&path);
            let accepted = rx.recv_timeout(TIMEOUT);
            t.check("connection accepted", client.is_ok() && accepted.is_ok(), "no connection");
            handler.stop_sources();
            t.check("listener stopped", handler.source_count() == 0, "still registered");
        }
        Err(e) => t.fail("bind unix socket", &e.to_string()),
    }
    let _ = std::fs::remove_file(&path);

    match TcpListener::bind("127.0.0.1:0").and_then(|l| Ok((l.local_addr()?.port(), l))) {
        Ok((port, server)) => {
            let writer = edrt::connect_netlog("127.0.0.1", port, WriterConfig::default());
            let accepted = server.accept();
            match (writer, accepted) {
                (Ok(writer), Ok((mut conn, _))) => {
                    let _ = writer.write(b"[INFO] smoke\n");
                    writer.stop();
                    let _ = writer.free();
                    let mut got = String::new();
                    let _ = conn.read_to_string(&mut got);
                    t.check("netlog delivers raw text", got == "[INFO] smoke\n", &got);
                }
                _ => t.fail("netlog connect", "connect or accept failed"),
            }
        }
        Err(e) => t.fail("bind tcp", &e.to_string()),
    }
}

// ── Part F ──

fn test_runtime(t: &mut TestRunner) {
    t.section("Part F: Runtime context");

    let (Some((out_r, out_w)), Some((in_r, in_w))) = (pipe(), pipe()) else {
        t.fail("pipe()", "pipe failed");
        return;
    };
    let rt = match Runtime::with_output(RuntimeConfig::new().num_workers(2), out_w.as_raw_fd()) {
        Ok(rt) => rt,
        Err(e) => {
            t.fail("create runtime", &e.to_string());
            return;
        }
    };
    t.pass("create runtime");

    let stop = rt.submitter();
    let pool_stop = rt.submitter();
    let attached = rt.attach_input(
        in_r,
        |bytes: &[u8]| bytes.first().map(|&b| Key::new(b as u32, false)),
        move |key| {
            if key.code == 'x' as u32 {
                stop.stop(0);
            }
        },
    );
    t.check("attach input", attached.is_ok(), "failed");

    let echoed = Arc::new(Mutex::new(None));
    let e = Arc::clone(&echoed);
    let _ = rt.pool().enqueue(|| "from pool", move |s| {
        *e.lock().unwrap_or_else(|e| e.into_inner()) = Some(s);
        pool_stop.stop(7);
    });
    t.check("pool completion ends loop", rt.run() == Ok(7), "wrong status");
    t.check(
        "completion ran via handler",
        *echoed.lock().unwrap_or_else(|e| e.into_inner()) == Some("from pool"),
        "missing",
    );

    let _ = std::fs::File::from(in_w).write_all(b"x");
    t.check("key ends loop", rt.run() == Ok(0), "wrong status");

    let _ = rt.stdout().write(b"goodbye\n");
    rt.shutdown();
    drop(out_w);
    t.check("shutdown flushes terminal writer", read_all(out_r) == b"goodbye\n", "lost output");
    t.check(
        "handler closed after shutdown",
        rt.submitter().submit(|| {}) == Err(RtError::Stopped),
        "still open",
    );
}

fn main() {
    println!("=== edrt End-to-End Smoke Test ===");
    edrt::init_logging();

    let mut t = TestRunner::new();

    test_writer(&mut t);
    test_reader(&mut t);
    test_pool(&mut t);
    test_pause(&mut t);
    test_sockets(&mut t);
    test_runtime(&mut t);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}

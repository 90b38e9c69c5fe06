//! crates/sink/src/supervisor.rs
//!
//! Startup, accept/dispatch fan-out and ordered shutdown.
//!
//! The supervisor runs on the caller's thread: it raises the process to
//! real-time priority where permitted, pre-allocates the buffer pool into
//! the clean queue, starts the writer pool, then sits in a non-blocking
//! accept loop spawning one [`NetRx`] per connection and reaping the ones
//! that finished. On the termination flag it tears the pipeline down in
//! dependency order so no received byte is lost.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use buffer::{Buffer, BufferQueue};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};
use worker::WorkerHandle;

use crate::config::SinkConfig;
use crate::error::{SinkError, SinkResult};
use crate::netrx::NetRx;
use crate::writer::FileWriter;

/// Listen backlog for the accept socket.
const LISTEN_BACKLOG: i32 = 64;

/// Receive-buffer depth forced on every accepted connection.
const RECV_BUFFER_BYTES: usize = 256 * 1024;

/// Accept-loop idle period between polls.
const ACCEPT_IDLE: Duration = Duration::from_millis(10);

/// How long shutdown waits for the writers to drain the dirty queue.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Binds the listening socket and runs the sink until `shutdown` is set.
pub fn run(config: &SinkConfig, shutdown: &Arc<AtomicBool>) -> SinkResult<()> {
    let listener = bind_listener(config.port)?;
    run_with(listener, config, shutdown)
}

/// Runs the sink on an already-bound, non-blocking listener.
pub fn run_with(
    listener: TcpListener,
    config: &SinkConfig,
    shutdown: &Arc<AtomicBool>,
) -> SinkResult<()> {
    // Minimize latency where privileges allow; continue regardless.
    setup_rt_sched();

    let buff_size = config.buff_size_bytes();
    if buff_size % 1024 != 0 {
        return Err(SinkError::Config(format!(
            "buffer size {buff_size} is not a multiple of 1 KiB"
        )));
    }

    let clean = Arc::new(BufferQueue::with_capacity(config.buff_count));
    let dirty = Arc::new(BufferQueue::with_capacity(config.buff_count));

    // Pre-allocate the pool; any failure here is fatal to startup.
    for index in 0..config.buff_count {
        let name = format!("io-buffer-{index}");
        let buf = Buffer::alloc(buff_size, config.buffer_options(), &name)
            .map_err(|source| SinkError::BufferAlloc { index, source })?;
        info!(index, capacity = buff_size, "pre-allocated buffer");
        clean.push(buf).expect("clean queue sized for the pool");
    }

    let mut writers = Vec::with_capacity(config.writer_threads);
    for index in 0..config.writer_threads {
        let writer = FileWriter::new(
            config.output_dir.clone(),
            Arc::clone(&dirty),
            Arc::clone(&clean),
            config.write_options(),
        );
        let handle = writer.spawn(index).map_err(|source| SinkError::Spawn {
            name: format!("writer-{index}"),
            source,
        })?;
        writers.push(handle);
    }

    let mut receivers: Vec<WorkerHandle> = Vec::new();
    let mut next_stream = 0usize;

    info!(port = config.port, "waiting for connections");

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                // Not every platform hands out a blocking socket from a
                // non-blocking listener; the receive loop needs one.
                if let Err(err) = stream.set_nonblocking(false) {
                    warn!(%peer, %err, "dropping connection: cannot configure socket");
                    continue;
                }
                force_recv_buffer(&stream);

                let stream_name = format!("stream-{next_stream}");
                next_stream += 1;
                info!(stream = %stream_name, %peer, "new connection");

                let rx = NetRx::new(
                    stream,
                    stream_name.clone(),
                    Arc::clone(&clean),
                    Arc::clone(&dirty),
                );
                match rx.spawn() {
                    Ok(handle) => receivers.push(handle),
                    Err(err) => {
                        warn!(stream = %stream_name, %err, "dropping connection: spawn failed");
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Reap receivers whose stream ended.
                receivers.retain(WorkerHandle::is_running);
                thread::sleep(ACCEPT_IDLE);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(SinkError::Accept(err)),
        }
    }

    info!("shutting down");

    // Receivers first: each flushes its partial buffer to the dirty queue.
    receivers.clear();

    // Let the writers push every outstanding buffer back to the clean
    // queue before stopping them; bail out early if they all died.
    let deadline = Instant::now() + DRAIN_DEADLINE;
    while clean.len() < config.buff_count
        && writers.iter().any(WorkerHandle::is_running)
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(1));
    }
    if clean.len() < config.buff_count {
        warn!(
            recovered = clean.len(),
            pool = config.buff_count,
            "shutdown drain incomplete"
        );
    }
    writers.clear();

    // Release the pool.
    let mut freed = 0usize;
    while let Some(buf) = clean.pop() {
        drop(buf);
        freed += 1;
    }
    info!(freed, "released buffer pool");

    Ok(())
}

fn bind_listener(port: u16) -> SinkResult<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(SinkError::Socket)?;
    let _ = socket.set_reuse_address(true);
    let _ = socket.set_reuse_port(true);
    socket.set_nonblocking(true).map_err(SinkError::Socket)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .map_err(|source| SinkError::Bind { addr, source })?;
    socket.listen(LISTEN_BACKLOG).map_err(SinkError::Listen)?;
    Ok(socket.into())
}

/// Best-effort `SCHED_FIFO` priority 90 plus a locked address space; both
/// need privileges the sink may not have.
fn setup_rt_sched() {
    let param = libc::sched_param { sched_priority: 90 };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } < 0 {
        warn!(
            err = %io::Error::last_os_error(),
            "failed to set scheduling policy and priority"
        );
    }

    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } < 0 {
        warn!(err = %io::Error::last_os_error(), "failed to lock process memory");
    }
}

/// Forces the connection's receive-buffer depth past the unprivileged cap;
/// needs CAP_NET_ADMIN, so a refusal is only worth a warning.
fn force_recv_buffer(stream: &std::net::TcpStream) {
    let depth = RECV_BUFFER_BYTES as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUFFORCE,
            (&raw const depth).cast::<libc::c_void>(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        warn!(
            err = %io::Error::last_os_error(),
            "failed to force socket receive-buffer depth"
        );
    }
}

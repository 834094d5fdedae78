//! §4.7 I/O loop: one task per registration, multiplexing the host fd, the
//! controller fd, and the notification HTTP socket on a single readiness
//! primitive, with a timeout derived from the rule store's nearest
//! deadline (§4.5).
//!
//! Grounded on `original_source/zwint/zwint.c`'s `zwint_threadFunction`
//! (`poll()` over `{mon_fds[1], new_commport_fd, http_fd}` plus a timeout
//! computed from `monitors->timeout`); `tokio::select!` over
//! `AsyncFd`-wrapped raw fds and a `tokio::time::sleep_until` deadline is
//! the direct async-native equivalent, in the same style as
//! `services/forwarder/src/local_fanout.rs`'s accept/serve tokio tasks.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{read, write};
use tokio::io::unix::AsyncFd;
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{debug, trace, warn};

use crate::config::Limits;
use crate::dispatch::{Dispatcher, Endpoint};
use crate::engine::Shared;
use crate::notify::{Event as NotifyEvent, Notification};
use crate::splice::SplicedEndpoints;

/// Thin `AsRawFd` wrapper so a raw fd can be driven through `AsyncFd`.
struct RawIo(RawFd);

impl AsRawFd for RawIo {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = fcntl(borrowed, FcntlArg::F_GETFL).map_err(io_err)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(borrowed, FcntlArg::F_SETFL(flags)).map_err(io_err)?;
    Ok(())
}

fn io_err(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// Monotonic milliseconds, the unit rule deadlines are expressed in (§3,
/// §4.5). Anchored to an arbitrary `Instant` chosen at registration time
/// rather than the process epoch, since only relative ordering matters.
pub fn now_ms(epoch: Instant) -> u64 {
    Instant::now().saturating_duration_since(epoch).as_millis() as u64
}

/// Run the multiplexed I/O loop for one registration until the
/// registration refcount drops to zero. Takes ownership of the spliced
/// endpoints; the caller is responsible for running `Splicer::restore`
/// once this returns.
pub async fn run(shared: Shared, endpoints: SplicedEndpoints, limits: Limits, epoch: Instant) {
    let host_fd = endpoints.host_fd;
    let controller_fd = endpoints.controller_fd;
    if let Err(e) = set_nonblocking(host_fd).and_then(|()| set_nonblocking(controller_fd)) {
        warn!(error = %e, "failed to set endpoints non-blocking; I/O loop exiting");
        return;
    }

    let host_async = match AsyncFd::new(RawIo(host_fd)) {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "AsyncFd registration failed for host endpoint");
            return;
        }
    };
    let controller_async = match AsyncFd::new(RawIo(controller_fd)) {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "AsyncFd registration failed for controller endpoint");
            return;
        }
    };

    let mut dispatcher = Dispatcher::new();
    let mut read_buf = vec![0u8; limits.read_chunk_bytes];

    debug!("I/O loop started");
    loop {
        let still_registered = {
            let mut state = shared.lock().await;
            if state.registered == 0 {
                false
            } else {
                handle_expired_rules(&mut state, now_ms(epoch));
                true
            }
        };
        if !still_registered {
            break;
        }

        let timeout_at = {
            let state = shared.lock().await;
            state.rules.next_deadline().map(|deadline_ms| {
                let now = now_ms(epoch);
                let remaining = deadline_ms.saturating_sub(now).max(1);
                TokioInstant::now() + Duration::from_millis(remaining)
            })
        };

        let notify_has_socket = shared.lock().await.queue.is_active();

        tokio::select! {
            biased;

            guard = host_async.readable() => {
                match guard {
                    Ok(mut g) => {
                        match read_into(host_fd, &mut read_buf) {
                            Ok(0) => { g.clear_ready(); }
                            Ok(n) => {
                                g.clear_ready();
                                let mut state = shared.lock().await;
                                let writes = dispatcher.feed(true, &read_buf[..n], &mut state.rules, &mut state.queue, &limits);
                                apply_writes(&host_async, &controller_async, writes).await;
                                state.queue.pump().await;
                            }
                            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => { g.clear_ready(); }
                            Err(e) => {
                                warn!(error = %e, "host endpoint read error");
                                g.clear_ready();
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "host endpoint poll error"),
                }
            }

            guard = controller_async.readable() => {
                match guard {
                    Ok(mut g) => {
                        match read_into(controller_fd, &mut read_buf) {
                            Ok(0) => { g.clear_ready(); }
                            Ok(n) => {
                                g.clear_ready();
                                let mut state = shared.lock().await;
                                let writes = dispatcher.feed(false, &read_buf[..n], &mut state.rules, &mut state.queue, &limits);
                                apply_writes(&host_async, &controller_async, writes).await;
                                state.queue.pump().await;
                            }
                            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => { g.clear_ready(); }
                            Err(e) => {
                                warn!(error = %e, "controller endpoint read error");
                                g.clear_ready();
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "controller endpoint poll error"),
                }
            }

            // Holds the lock only while waiting for the notification
            // socket's readiness; `tokio::select!` drops this future (and
            // with it the guard) the instant any other branch wins, so the
            // wait never blocks host/controller dispatch from acquiring
            // the lock in practice.
            () = async {
                let state = shared.lock().await;
                match state.queue.socket() {
                    Some(sock) => { let _ = sock.readable().await; }
                    None => std::future::pending::<()>().await,
                }
            }, if notify_has_socket => {
                let mut state = shared.lock().await;
                state.queue.on_readable().await;
                state.queue.pump().await;
            }

            () = sleep_or_pending(timeout_at) => {
                let mut state = shared.lock().await;
                handle_expired_rules(&mut state, now_ms(epoch));
            }
        }
    }
    debug!("I/O loop exiting, registration refcount at zero");
}

async fn sleep_or_pending(at: Option<TokioInstant>) {
    match at {
        Some(instant) => sleep_until(instant).await,
        None => std::future::pending().await,
    }
}

fn read_into(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    match read(borrowed, buf) {
        Ok(n) => Ok(n),
        Err(nix::Error::EAGAIN) => Err(std::io::Error::from(std::io::ErrorKind::WouldBlock)),
        Err(e) => Err(io_err(e)),
    }
}

/// Write `buf` in full to `io`'s fd. On `EAGAIN` this awaits the fd's own
/// writable readiness instead of spinning, so a stalled peer parks this
/// task rather than pinning a worker thread at 100% CPU.
async fn write_all_raw(io: &AsyncFd<RawIo>, mut buf: &[u8]) {
    let fd = io.as_raw_fd();
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    while !buf.is_empty() {
        match write(borrowed, buf) {
            Ok(0) => break,
            Ok(n) => buf = &buf[n..],
            Err(nix::Error::EINTR) => continue,
            Err(nix::Error::EAGAIN) => match io.writable().await {
                Ok(mut g) => g.clear_ready(),
                Err(e) => {
                    warn!(error = %e, fd, "endpoint poll error while writing");
                    break;
                }
            },
            Err(e) => {
                warn!(error = %e, fd, "endpoint write error");
                break;
            }
        }
    }
}

async fn apply_writes(host_async: &AsyncFd<RawIo>, controller_async: &AsyncFd<RawIo>, writes: Vec<(Endpoint, Vec<u8>)>) {
    for (endpoint, bytes) in writes {
        trace!(?endpoint, len = bytes.len(), "writing frame/passthrough");
        let io = match endpoint {
            Endpoint::Host => host_async,
            Endpoint::Controller => controller_async,
        };
        write_all_raw(io, &bytes).await;
    }
}

/// §4.5: drain every rule past its deadline, emitting one `Timeout`
/// notification each, in deadline order.
fn handle_expired_rules(state: &mut crate::engine::EngineState, now_ms: u64) {
    for rule in state.rules.drain_expired(now_ms) {
        debug!(key = %rule.key, "rule timed out");
        state.queue.enqueue(&Notification {
            device_num: rule.device_num,
            key: rule.key.clone(),
            event: NotifyEvent::Timeout,
            silent: rule.is_silent(),
            captures: None,
            message: None,
        });
    }
}

//! One live shell session: a PTY-backed child process bridged to a
//! WebSocket connection for the whole lifetime of the session.
//!
//! The session owns exactly one process handle and one connection handle.
//! Bytes flow both ways through a single select loop, so ordering holds
//! within each direction while the two directions interleave freely.

use std::env;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::protocol::{ControlMessage, WindowSize};
use crate::route::{escape_single_quotes, Route};

/// Dimensions used until the client's first resize arrives.
pub const INITIAL_SIZE: WindowSize = WindowSize { cols: 80, rows: 30 };

const PTY_READ_BUF: usize = 65536;
const INPUT_QUEUE: usize = 256;
const IDLE_POLL: Duration = Duration::from_secs(1);

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

// ── Spawning ────────────────────────────────────────────────────────

/// Argument list for the remote-shell command: `[host]`, or
/// `[host, "-t", ...]` to change directory and re-exec a login shell.
pub fn shell_args(route: &Route) -> Vec<String> {
    match &route.initial_dir {
        None => vec![route.host.clone()],
        Some(dir) => vec![
            route.host.clone(),
            "-t".to_string(),
            format!("cd '{}' ; exec $SHELL -l", escape_single_quotes(dir)),
        ],
    }
}

struct PtyChild {
    master: OwnedFd,
    pid: Pid,
}

/// Fork a child on a fresh PTY and exec `command` with `args`. The
/// `env_overrides` entries are set in the child only; the parent
/// environment is never mutated, so concurrent sessions cannot race on it.
fn spawn_shell(
    command: &str,
    args: &[String],
    size: WindowSize,
    env_overrides: &[(&str, &str)],
) -> io::Result<PtyChild> {
    let mut winsize = libc::winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let mut master_fd: libc::c_int = -1;
    let pid = unsafe {
        libc::forkpty(
            &mut master_fd as *mut libc::c_int,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut winsize as *mut libc::winsize,
        )
    };

    if pid < 0 {
        return Err(io::Error::last_os_error());
    }

    if pid == 0 {
        // Child process: set up the environment and exec.
        for (key, value) in env_overrides {
            env::set_var(key, value);
        }

        let c_command = std::ffi::CString::new(command).unwrap_or_else(|_| {
            eprintln!("shell-host: invalid command name");
            process::exit(127);
        });
        let c_args: Vec<std::ffi::CString> = std::iter::once(c_command.clone())
            .chain(args.iter().map(|a| {
                std::ffi::CString::new(a.as_str()).unwrap_or_else(|_| {
                    eprintln!("shell-host: invalid argument");
                    process::exit(127);
                })
            }))
            .collect();

        let c_argv: Vec<*const libc::c_char> = c_args
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        unsafe {
            libc::execvp(c_command.as_ptr(), c_argv.as_ptr());
        }
        // If execvp returns, it failed
        let err = io::Error::last_os_error();
        eprintln!("shell-host: exec failed: {}", err);
        process::exit(127);
    }

    // SAFETY: master_fd is a fresh descriptor returned by forkpty
    let master = unsafe { OwnedFd::from_raw_fd(master_fd) };
    Ok(PtyChild {
        master,
        pid: Pid::from_raw(pid),
    })
}

/// Update the PTY window size. Zero dimensions are clamped to 1.
fn resize_pty(master_fd: RawFd, size: WindowSize) {
    let ws = libc::winsize {
        ws_row: size.rows.max(1),
        ws_col: size.cols.max(1),
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        libc::ioctl(master_fd, libc::TIOCSWINSZ, &ws);
    }
}

/// Ask the child to terminate. Safe to call after it is already gone.
fn terminate(pid: Pid) {
    match signal::kill(pid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pid = pid.as_raw(), %err, "failed to signal shell process"),
    }
}

/// Reap the child and map its status to a conventional exit code.
async fn reap(pid: Pid) -> i32 {
    let status = tokio::task::spawn_blocking(move || waitpid(pid, None)).await;
    match status {
        Ok(Ok(WaitStatus::Exited(_, code))) => code,
        Ok(Ok(WaitStatus::Signaled(_, sig, _))) => 128 + sig as i32,
        _ => -1,
    }
}

// ── Session lifecycle ───────────────────────────────────────────────

enum SessionEnd {
    ConnectionClosed,
    ProcessExited,
    IdleTimeout,
}

/// Drive one session from upgrade to full teardown. Every failure is
/// handled here; nothing escapes to other sessions or the accept loop.
pub async fn run(socket: WebSocket, route: Route, settings: Arc<Settings>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let args = shell_args(&route);
    let env_overrides = [
        ("TERM", settings.term.as_str()),
        ("LANG", settings.lang.as_str()),
    ];

    let child = match spawn_shell(&settings.ssh_command, &args, INITIAL_SIZE, &env_overrides) {
        Ok(child) => child,
        Err(err) => {
            warn!(command = %settings.ssh_command, %err, "failed to spawn shell");
            close_connection(&mut ws_tx, close_code::ERROR, "failed to start shell").await;
            return;
        }
    };
    info!(host = %route.host, pid = child.pid.as_raw(), "session opened");

    let idle_timeout =
        (settings.idle_timeout_secs > 0).then(|| Duration::from_secs(settings.idle_timeout_secs));

    match bridge(&mut ws_tx, &mut ws_rx, &child, idle_timeout).await {
        SessionEnd::ConnectionClosed => {
            terminate(child.pid);
            let code = reap(child.pid).await;
            info!(pid = child.pid.as_raw(), code, "connection closed, shell terminated");
        }
        SessionEnd::IdleTimeout => {
            terminate(child.pid);
            let code = reap(child.pid).await;
            info!(pid = child.pid.as_raw(), code, "idle timeout, session ended");
            close_connection(&mut ws_tx, close_code::NORMAL, "session idle timeout").await;
        }
        SessionEnd::ProcessExited => {
            let code = reap(child.pid).await;
            info!(pid = child.pid.as_raw(), code, "shell exited, closing connection");
            close_connection(&mut ws_tx, close_code::NORMAL, "session terminated").await;
        }
    }
    // The master fd drops here; no relay can outlive the session.
}

async fn close_connection(ws_tx: &mut WsSender, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(err) = ws_tx.send(Message::Close(Some(frame))).await {
        debug!(%err, "close frame not delivered");
    }
}

/// Relay bytes both ways until one side goes away.
async fn bridge(
    ws_tx: &mut WsSender,
    ws_rx: &mut WsReceiver,
    child: &PtyChild,
    idle_timeout: Option<Duration>,
) -> SessionEnd {
    let master_fd = child.master.as_raw_fd();

    // Make the PTY master non-blocking so reads are driven by readiness.
    unsafe {
        let flags = libc::fcntl(master_fd, libc::F_GETFL);
        libc::fcntl(master_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
    let async_fd = match AsyncFd::new(unsafe { BorrowedFd::borrow_raw(master_fd) }) {
        Ok(fd) => fd,
        Err(err) => {
            warn!(%err, "failed to register PTY with the reactor");
            return SessionEnd::ProcessExited;
        }
    };

    // Input is written from its own task so the relay loop never blocks on
    // the PTY; the queue keeps keystrokes in arrival order.
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
    let writer_fd = master_fd;
    let writer = tokio::spawn(async move {
        while let Some(data) = input_rx.recv().await {
            let n = unsafe {
                libc::write(writer_fd, data.as_ptr() as *const libc::c_void, data.len())
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    break;
                }
            }
        }
    });

    let mut buf = vec![0u8; PTY_READ_BUF];
    let mut last_activity = Instant::now();
    let mut idle_check = time::interval(IDLE_POLL);

    let end = loop {
        tokio::select! {
            // process -> connection
            ready = async_fd.readable() => {
                let mut guard = match ready {
                    Ok(guard) => guard,
                    Err(_) => break SessionEnd::ProcessExited,
                };
                // SAFETY: reading from the PTY master fd
                let n = unsafe {
                    libc::read(master_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n <= 0 {
                    if n < 0 {
                        let err = io::Error::last_os_error();
                        if err.kind() == io::ErrorKind::WouldBlock {
                            guard.clear_ready();
                            continue;
                        }
                    }
                    // EOF or EIO: the child side of the PTY is gone
                    break SessionEnd::ProcessExited;
                }
                last_activity = Instant::now();
                if let Err(err) = ws_tx.send(Message::Binary(buf[..n as usize].to_vec())).await {
                    // Not fatal: the process side stays authoritative for
                    // liveness, and a dead connection surfaces on recv.
                    warn!(%err, "send error");
                }
                guard.clear_ready();
            }

            // connection -> process
            frame = ws_rx.next() => {
                match frame {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                        break SessionEnd::ConnectionClosed;
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        apply_control(&text, &input_tx, master_fd).await;
                    }
                    Some(Ok(Message::Binary(raw))) => {
                        last_activity = Instant::now();
                        match std::str::from_utf8(&raw) {
                            Ok(text) => apply_control(text, &input_tx, master_fd).await,
                            Err(_) => warn!("discarding non-UTF-8 control frame"),
                        }
                    }
                    Some(Ok(_)) => {} // ping/pong handled by the stack
                }
            }

            _ = idle_check.tick(), if idle_timeout.is_some() => {
                if let Some(limit) = idle_timeout {
                    if last_activity.elapsed() >= limit {
                        break SessionEnd::IdleTimeout;
                    }
                }
            }
        }
    };

    writer.abort();
    end
}

/// Decode one inbound frame and apply it. Decode problems are per-message:
/// logged and skipped, never fatal to the session.
async fn apply_control(raw: &str, input_tx: &mpsc::Sender<Vec<u8>>, master_fd: RawFd) {
    match ControlMessage::decode(raw) {
        Ok(ControlMessage::Input { input }) => {
            if input_tx.send(input.into_bytes()).await.is_err() {
                warn!("input dropped: PTY writer is gone");
            }
        }
        Ok(ControlMessage::Resize { resize }) => resize_pty(master_fd, resize),
        Ok(ControlMessage::Unrecognized(_)) => {
            debug!("ignoring unrecognized control message");
        }
        Err(err) => warn!(%err, "undecodable control message"),
    }
}

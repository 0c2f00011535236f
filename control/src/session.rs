//! Client side of a run session: start a guest command and proxy its
//! console until it exits or the user detaches.
//!
//! A session moves through three states. After the request is sent it waits
//! for exactly one start reply; once acknowledged it streams frames from the
//! socket to local output and local input to the socket; an exit-code frame,
//! a closed socket, the `~.` escape or a termination signal ends it.

use crate::endpoint::{self, Connection};
use crate::error::{ControlError, INTERRUPTED_EXIT_CODE, NO_EXIT_CODE};
use crate::protocol::{Greeting, MAX_CHUNK, RunRequest, StreamFrame, decode_start_reply};
use crate::terminal::{RawTerminal, is_tty, signals};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::AsFd;
use std::path::Path;

/// How often blocked waits wake up to look for pending signals.
const POLL_INTERVAL_MS: u16 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest reported its exit status.
    Exited(i32),
    /// The supervisor closed the stream without an exit status.
    Closed,
    /// The user typed the escape sequence; the guest command keeps running.
    Detached,
    /// A termination signal arrived.
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Exited(code) => *code,
            RunOutcome::Closed | RunOutcome::Detached => NO_EXIT_CODE,
            RunOutcome::Interrupted => INTERRUPTED_EXIT_CODE,
        }
    }
}

/// Run `request` on the instance listening at `path`, proxying the local
/// standard streams. Raw mode, if requested, is held only while streaming.
pub fn run(path: &Path, request: &RunRequest) -> Result<RunOutcome, ControlError> {
    let _signals = signals::TerminationGuard::install()?;

    let conn = endpoint::connect(path)?;
    let session = match RunSession::start(conn, request) {
        Ok(session) => session,
        Err(ControlError::Interrupted) => return Ok(RunOutcome::Interrupted),
        Err(e) => return Err(e),
    };

    let stdin = File::from(std::io::stdin().as_fd().try_clone_to_owned()?);
    let _raw = if request.terminal && is_tty(&stdin) {
        Some(RawTerminal::acquire(stdin.as_fd())?)
    } else {
        None
    };

    session.proxy(Some(stdin), &mut std::io::stdout())
}

/// A session that has been acknowledged by the supervisor.
pub struct RunSession {
    conn: Connection,
    terminal: bool,
}

impl RunSession {
    /// Send the greeting and request, then wait for the start reply.
    pub fn start(mut conn: Connection, request: &RunRequest) -> Result<RunSession, ControlError> {
        conn.write_line(Greeting::Run.line())
            .map_err(|e| ControlError::transport("write greeting", e))?;
        conn.send(request)?;

        wait_readable(&conn)?;
        let line = conn
            .read_line()
            .map_err(|e| ControlError::transport("read start reply", e))?
            .ok_or_else(|| {
                ControlError::transport("read start reply", "connection closed before acknowledgement")
            })?;

        if let Some(message) = decode_start_reply(&line)? {
            return Err(ControlError::Remote(format!(
                "failed to start {:?}: {}",
                request.command, message
            )));
        }

        tracing::debug!(command = ?request.command, terminal = request.terminal, "Run session started");
        Ok(RunSession {
            conn,
            terminal: request.terminal,
        })
    }

    /// Proxy until the session terminates.
    ///
    /// `input` is forwarded as data frames until it reaches end of file;
    /// `output` receives every data frame in the order it was read.
    pub fn proxy<I, O>(mut self, mut input: Option<I>, output: &mut O) -> Result<RunOutcome, ControlError>
    where
        I: Read + AsFd,
        O: Write,
    {
        let mut escape = EscapeScanner::default();
        let mut buf = [0u8; MAX_CHUNK];

        loop {
            if let Some(signal) = signals::take_pending() {
                tracing::debug!(signal = ?signal, "Run session interrupted");
                return Ok(RunOutcome::Interrupted);
            }

            let (remote_ready, input_ready) = if self.conn.has_buffered() {
                (true, false)
            } else {
                let mut fds = vec![PollFd::new(self.conn.as_fd(), PollFlags::POLLIN)];
                if let Some(input) = input.as_ref() {
                    fds.push(PollFd::new(input.as_fd(), PollFlags::POLLIN));
                }

                match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(ControlError::transport("poll", e)),
                }

                let readable = |fd: &PollFd| {
                    fd.revents()
                        .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
                        .unwrap_or(false)
                };
                (readable(&fds[0]), fds.get(1).map(readable).unwrap_or(false))
            };

            if remote_ready {
                match self.next_frame()? {
                    Some(StreamFrame::Data(bytes)) => {
                        output.write_all(&bytes)?;
                        output.flush()?;
                    }
                    Some(StreamFrame::ExitCode(code)) => {
                        tracing::debug!(exit_code = code, "Guest command exited");
                        return Ok(RunOutcome::Exited(code));
                    }
                    Some(StreamFrame::Ack) | None => {
                        tracing::debug!("Supervisor closed the run stream");
                        return Ok(RunOutcome::Closed);
                    }
                }
            }

            if input_ready && let Some(reader) = input.as_mut() {
                let n = match reader.read(&mut buf) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "Local input failed, treating as end of file");
                        0
                    }
                };

                if n == 0 {
                    // Forward end of input once, then only the socket is watched.
                    input = None;
                    if !self.forward(&[]) {
                        return Ok(RunOutcome::Closed);
                    }
                    continue;
                }

                let chunk = &buf[..n];
                if self.terminal
                    && let Scan::Detach { keep } = escape.scan(chunk)
                {
                    if keep > 0 {
                        self.forward(&chunk[..keep]);
                    }
                    tracing::debug!("Escape sequence typed, detaching");
                    return Ok(RunOutcome::Detached);
                }

                if !self.forward(chunk) {
                    return Ok(RunOutcome::Closed);
                }
            }
        }
    }

    /// Read one frame. Socket failures after the start acknowledgement end
    /// the session like a close; malformed frames are protocol errors.
    fn next_frame(&mut self) -> Result<Option<StreamFrame>, ControlError> {
        match self.conn.read_line() {
            Ok(Some(line)) => StreamFrame::decode(&line).map(Some),
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::debug!(error = %e, "Run stream read failed");
                Ok(None)
            }
        }
    }

    fn forward(&mut self, data: &[u8]) -> bool {
        let line = StreamFrame::Data(data.to_vec()).encode();
        match self.conn.write_line(&line) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Run stream write failed");
                false
            }
        }
    }
}

/// Block until the connection is readable, waking periodically to observe
/// termination signals.
fn wait_readable(conn: &Connection) -> Result<(), ControlError> {
    loop {
        if conn.has_buffered() {
            return Ok(());
        }
        if signals::take_pending().is_some() {
            return Err(ControlError::Interrupted);
        }

        let mut fds = [PollFd::new(conn.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) => continue,
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ControlError::transport("poll", e)),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    Forward,
    /// Detach after forwarding the first `keep` bytes of the chunk.
    Detach { keep: usize },
}

/// Recognises `~.` in terminal input. A lone `~` toggles the armed state,
/// any other byte disarms it.
#[derive(Debug, Default)]
struct EscapeScanner {
    armed: bool,
}

impl EscapeScanner {
    fn scan(&mut self, chunk: &[u8]) -> Scan {
        for (i, &byte) in chunk.iter().enumerate() {
            match byte {
                b'~' => self.armed = !self.armed,
                b'.' if self.armed => {
                    let keep = if i > 0 && chunk[i - 1] == b'~' { i - 1 } else { i };
                    return Scan::Detach { keep };
                }
                _ => self.armed = false,
            }
        }
        Scan::Forward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::test_support::{exclusive, same, snapshot};
    use nix::pty::{Winsize, openpty};
    use nix::sys::signal::{Signal, raise};
    use nix::sys::termios::Termios;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    fn echo_request(terminal: bool) -> RunRequest {
        RunRequest {
            command: vec!["/bin/echo".to_string(), "hi".to_string()],
            cwd: "/".to_string(),
            terminal,
            ..Default::default()
        }
    }

    /// A scripted supervisor: checks the greeting and request, then writes
    /// `replies` line by line. Returns every line the client sent afterwards.
    fn supervisor(replies: Vec<String>) -> (Connection, thread::JoinHandle<Vec<String>>) {
        let (a, b) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let mut conn = Connection::new(b).unwrap();
            assert_eq!(conn.read_line().unwrap().as_deref(), Some("NOVM RUN"));
            let request = conn.read_line().unwrap().unwrap();
            let _: RunRequest = serde_json::from_str(&request).unwrap();
            for reply in replies {
                conn.write_line(&reply).unwrap();
            }
            // Hang up once the client signals end of input.
            let mut received = Vec::new();
            while let Ok(Some(line)) = conn.read_line() {
                let eof = line == "\"\"";
                received.push(line);
                if eof {
                    break;
                }
            }
            received
        });
        (Connection::new(a).unwrap(), handle)
    }

    #[test]
    fn test_output_then_exit_code() {
        let _lock = exclusive();
        let (conn, _handle) = supervisor(vec![
            "null".to_string(),
            "\"aGk=\"".to_string(),
            "\"Cg==\"".to_string(),
            "0".to_string(),
            "null".to_string(),
        ]);

        let session = RunSession::start(conn, &echo_request(false)).unwrap();
        let mut out = Vec::new();
        let outcome = session.proxy(None::<UnixStream>, &mut out).unwrap();

        assert_eq!(outcome, RunOutcome::Exited(0));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(out, b"hi\n");
    }

    #[test]
    fn test_exit_code_frame_ends_session() {
        let _lock = exclusive();
        let (conn, _handle) = supervisor(vec![
            "null".to_string(),
            "3".to_string(),
            "\"bGF0ZQ==\"".to_string(),
        ]);
        let session = RunSession::start(conn, &echo_request(false)).unwrap();
        let mut out = Vec::new();
        let outcome = session.proxy(None::<UnixStream>, &mut out).unwrap();
        assert_eq!(outcome, RunOutcome::Exited(3));
        assert_eq!(outcome.exit_code(), 3);
        // Data after the exit code is never read.
        assert!(out.is_empty());
    }

    #[test]
    fn test_close_without_exit_code_uses_default() {
        let _lock = exclusive();
        let (conn, handle) = supervisor(vec!["null".to_string(), "\"b2s=\"".to_string()]);
        let session = RunSession::start(conn, &echo_request(false)).unwrap();

        let mut out = Vec::new();
        let (local_in, remote_in) = UnixStream::pair().unwrap();
        drop(remote_in);
        let outcome = session.proxy(Some(local_in), &mut out).unwrap();

        // End of input was forwarded, then the stream closed.
        assert_eq!(outcome, RunOutcome::Closed);
        assert_eq!(outcome.exit_code(), NO_EXIT_CODE);
        assert_eq!(out, b"ok");
        assert_eq!(handle.join().unwrap(), vec!["\"\"".to_string()]);
    }

    #[test]
    fn test_explicit_ack_after_start_is_remote_close() {
        let _lock = exclusive();
        let (conn, _handle) = supervisor(vec!["null".to_string(), "null".to_string()]);
        let session = RunSession::start(conn, &echo_request(false)).unwrap();
        let outcome = session.proxy(None::<UnixStream>, &mut Vec::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Closed);
    }

    #[test]
    fn test_start_error_is_remote_error() {
        let _lock = exclusive();
        let (conn, _handle) = supervisor(vec!["\"no such file or directory\"".to_string()]);
        let err = RunSession::start(conn, &echo_request(false)).err().unwrap();
        match err {
            ControlError::Remote(message) => {
                assert!(message.contains("/bin/echo"), "{message}");
                assert!(message.contains("no such file"), "{message}");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_hangup_before_start_is_transport_error() {
        let _lock = exclusive();
        let (a, b) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let mut conn = Connection::new(b).unwrap();
            let _ = conn.read_line();
            let _ = conn.read_line();
        });
        let err = RunSession::start(Connection::new(a).unwrap(), &echo_request(false))
            .err()
            .unwrap();
        handle.join().unwrap();
        assert!(matches!(err, ControlError::Transport(_)), "{err:?}");
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let _lock = exclusive();
        let (conn, _handle) = supervisor(vec!["null".to_string(), "{\"data\": 1}".to_string()]);
        let session = RunSession::start(conn, &echo_request(false)).unwrap();
        let err = session.proxy(None::<UnixStream>, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, ControlError::Protocol(_)), "{err:?}");
    }

    #[test]
    fn test_input_forwarded_as_base64_then_eof() {
        let _lock = exclusive();
        let (a, b) = UnixStream::pair().unwrap();
        let (local_in, mut remote_in) = UnixStream::pair().unwrap();

        let server = thread::spawn(move || {
            let mut conn = Connection::new(b).unwrap();
            conn.read_line().unwrap();
            conn.read_line().unwrap();
            conn.write_line("null").unwrap();
            let first = conn.read_line().unwrap().unwrap();
            let eof = conn.read_line().unwrap().unwrap();
            conn.write_line("0").unwrap();
            (first, eof)
        });

        remote_in.write_all(b"input").unwrap();
        drop(remote_in);

        let session = RunSession::start(Connection::new(a).unwrap(), &echo_request(false)).unwrap();
        let outcome = session.proxy(Some(local_in), &mut Vec::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Exited(0));

        let (first, eof) = server.join().unwrap();
        assert_eq!(StreamFrame::decode(&first).unwrap(), StreamFrame::Data(b"input".to_vec()));
        assert_eq!(eof, "\"\"");
    }

    #[test]
    fn test_escape_detaches_without_forwarding() {
        let _lock = exclusive();
        let (a, b) = UnixStream::pair().unwrap();
        let (local_in, mut remote_in) = UnixStream::pair().unwrap();

        let server = thread::spawn(move || {
            let mut conn = Connection::new(b).unwrap();
            conn.read_line().unwrap();
            conn.read_line().unwrap();
            conn.write_line("null").unwrap();
            let mut received = Vec::new();
            while let Ok(Some(line)) = conn.read_line() {
                received.push(line);
            }
            received
        });

        remote_in.write_all(b"ls~.rm -rf /").unwrap();

        let session = RunSession::start(Connection::new(a).unwrap(), &echo_request(true)).unwrap();
        let outcome = session.proxy(Some(local_in), &mut Vec::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Detached);

        // Only the bytes before the escape were sent; no end-of-input or
        // termination frame followed.
        let received = server.join().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(StreamFrame::decode(&received[0]).unwrap(), StreamFrame::Data(b"ls".to_vec()));
    }

    #[test]
    fn test_escape_ignored_without_terminal() {
        let _lock = exclusive();
        let (a, b) = UnixStream::pair().unwrap();
        let (local_in, mut remote_in) = UnixStream::pair().unwrap();

        let server = thread::spawn(move || {
            let mut conn = Connection::new(b).unwrap();
            conn.read_line().unwrap();
            conn.read_line().unwrap();
            conn.write_line("null").unwrap();
            let data = conn.read_line().unwrap().unwrap();
            conn.write_line("7").unwrap();
            data
        });

        remote_in.write_all(b"~.").unwrap();

        let session = RunSession::start(Connection::new(a).unwrap(), &echo_request(false)).unwrap();
        let outcome = session.proxy(Some(local_in), &mut Vec::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Exited(7));
        assert_eq!(
            StreamFrame::decode(&server.join().unwrap()).unwrap(),
            StreamFrame::Data(b"~.".to_vec())
        );
    }

    #[test]
    fn test_escape_scanner_across_chunks() {
        let mut scanner = EscapeScanner::default();
        assert_eq!(scanner.scan(b"echo ~"), Scan::Forward);
        assert_eq!(scanner.scan(b"."), Scan::Detach { keep: 0 });

        let mut scanner = EscapeScanner::default();
        assert_eq!(scanner.scan(b"~~."), Scan::Forward);
        assert_eq!(scanner.scan(b"a~b."), Scan::Forward);
        assert_eq!(scanner.scan(b"x~."), Scan::Detach { keep: 1 });
    }

    /// Raise `signal` from another thread once `delay` has passed.
    fn raise_later(signal: Signal, delay: Duration) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            thread::sleep(delay);
            raise(signal).unwrap();
        })
    }

    /// A supervisor that reads the request, optionally acknowledges it and
    /// then stays silent with the connection open.
    fn silent_supervisor(ack: bool) -> (Connection, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(b.try_clone().unwrap()).unwrap();
        thread::spawn(move || {
            conn.read_line().unwrap();
            conn.read_line().unwrap();
            if ack {
                conn.write_line("null").unwrap();
            }
        });
        // The returned end keeps the socket open after the thread finishes.
        (Connection::new(a).unwrap(), b)
    }

    #[test]
    fn test_signal_before_start_reply_interrupts() {
        let _lock = exclusive();
        let _signals = signals::TerminationGuard::install().unwrap();
        let (conn, _peer) = silent_supervisor(false);

        let raiser = raise_later(Signal::SIGTERM, Duration::from_millis(200));
        let err = RunSession::start(conn, &echo_request(false)).err().unwrap();
        raiser.join().unwrap();

        assert!(matches!(err, ControlError::Interrupted), "{err:?}");
        assert_eq!(err.exit_code(), INTERRUPTED_EXIT_CODE);
        assert_eq!(INTERRUPTED_EXIT_CODE, 130);
    }

    #[test]
    fn test_signal_while_streaming_interrupts() {
        let _lock = exclusive();
        let _signals = signals::TerminationGuard::install().unwrap();
        let (conn, _peer) = silent_supervisor(true);
        let session = RunSession::start(conn, &echo_request(false)).unwrap();

        let raiser = raise_later(Signal::SIGINT, Duration::from_millis(200));
        let outcome = session.proxy(None::<UnixStream>, &mut Vec::new()).unwrap();
        raiser.join().unwrap();

        assert_eq!(outcome, RunOutcome::Interrupted);
        assert_eq!(outcome.exit_code(), 130);
    }

    #[test]
    fn test_terminal_restored_after_interrupted_session() {
        let _lock = exclusive();
        let pty = openpty(None::<&Winsize>, None::<&Termios>).unwrap();
        let tty = pty.slave.as_fd();
        let before = snapshot(tty);

        let _signals = signals::TerminationGuard::install().unwrap();
        let (conn, _peer) = silent_supervisor(true);
        let session = RunSession::start(conn, &echo_request(true)).unwrap();

        let outcome = {
            let _raw = RawTerminal::acquire(tty).unwrap();
            assert!(!same(&before, &snapshot(tty)));
            let raiser = raise_later(Signal::SIGTERM, Duration::from_millis(200));
            let outcome = session.proxy(None::<UnixStream>, &mut Vec::new()).unwrap();
            raiser.join().unwrap();
            outcome
        };

        assert_eq!(outcome, RunOutcome::Interrupted);
        assert!(same(&before, &snapshot(tty)));
    }
}

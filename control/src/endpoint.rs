//! Unix-domain-socket endpoints for the control channel.
//!
//! A supervisor binds exactly one listening socket per instance; clients
//! connect to it by path. Only the binding side ever unlinks the path.

use crate::error::ControlError;
use crate::watch;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind as bind_socket, listen, socket,
};
use serde::Serialize;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

/// Large enough that bursts of CLI invocations are never refused.
pub const LISTEN_BACKLOG: i32 = 1024;

/// The listening side of an endpoint. Unlinks its path on drop.
#[derive(Debug)]
pub struct Listener {
    listener: UnixListener,
    path: PathBuf,
}

/// Bind a fresh listening socket at `path`, replacing any stale socket file.
pub fn bind(path: &Path) -> Result<Listener, ControlError> {
    if let Some(dir) = path.parent() {
        ensure_dir(dir)?;
    }

    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed stale control socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ControlError::transport(&format!("remove {}", path.display()), e)),
    }

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| ControlError::transport("socket", e))?;

    let addr = UnixAddr::new(path).map_err(|e| ControlError::transport("socket address", e))?;
    bind_socket(fd.as_raw_fd(), &addr)
        .map_err(|e| ControlError::transport(&format!("bind {}", path.display()), e))?;

    let backlog = Backlog::new(LISTEN_BACKLOG).map_err(|e| ControlError::transport("backlog", e))?;
    listen(&fd, backlog)
        .map_err(|e| ControlError::transport(&format!("listen {}", path.display()), e))?;

    let listener = UnixListener::from(fd);
    inherit_on_exec(listener.as_raw_fd())?;

    tracing::debug!(path = %path.display(), "Control endpoint bound");

    Ok(Listener {
        listener,
        path: path.to_path_buf(),
    })
}

/// Connect to a listening endpoint.
pub fn connect(path: &Path) -> Result<Connection, ControlError> {
    let stream = UnixStream::connect(path)
        .map_err(|e| ControlError::transport(&format!("connect {}", path.display()), e))?;
    inherit_on_exec(stream.as_raw_fd())?;
    tracing::debug!(path = %path.display(), "Connected to control endpoint");
    Connection::new(stream)
}

/// Create the socket directory. A directory that already exists, even one
/// created concurrently by another process, is fine.
fn ensure_dir(dir: &Path) -> Result<(), ControlError> {
    match std::fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(ControlError::transport(&format!("create {}", dir.display()), e)),
    }
}

/// Clear close-on-exec so the descriptor survives into the supervisor image.
pub fn inherit_on_exec(fd: RawFd) -> Result<(), ControlError> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags - FdFlag::FD_CLOEXEC))?;
    Ok(())
}

impl Listener {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn accept(&self) -> Result<Connection, ControlError> {
        let (stream, _) = self
            .listener
            .accept()
            .map_err(|e| ControlError::transport("accept", e))?;
        Connection::new(stream)
    }

    /// Arrange for the socket file to be removed once this process exits,
    /// even if its image is replaced by `exec` before then.
    pub fn unlink_on_exit(&self) -> Result<(), ControlError> {
        watch::remove_on_exit(&[self.path.as_path()])
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove control socket");
        }
    }
}

/// A connected, line-oriented byte channel.
#[derive(Debug)]
pub struct Connection {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Result<Self, ControlError> {
        let writer = stream
            .try_clone()
            .map_err(|e| ControlError::transport("clone stream", e))?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Write one line and flush it.
    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.writer.write_all(&buf)?;
        self.writer.flush()
    }

    /// Encode `value` as a single JSON line.
    pub fn send<T: Serialize>(&mut self, value: &T) -> Result<(), ControlError> {
        let line = serde_json::to_string(value)?;
        self.write_line(&line)
            .map_err(|e| ControlError::transport("write", e))
    }

    /// Read one line without its terminator. `None` means the peer closed.
    pub fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Whether a complete or partial line is already buffered, in which case
    /// waiting for socket readiness would stall.
    pub fn has_buffered(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// A second handle on the same socket for writing from another thread.
    /// The clone does not share this connection's read buffer.
    pub fn try_clone(&self) -> Result<Connection, ControlError> {
        let stream = self
            .writer
            .try_clone()
            .map_err(|e| ControlError::transport("clone stream", e))?;
        Connection::new(stream)
    }

    pub fn shutdown_write(&self) -> std::io::Result<()> {
        self.writer.shutdown(std::net::Shutdown::Write)
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.get_ref().as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use tempfile::TempDir;

    fn cloexec(fd: RawFd) -> bool {
        let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
        flags.contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn test_bind_creates_directory_and_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/control/1.ctrl");

        let listener = bind(&path).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_socket());
        assert_eq!(listener.path(), path.as_path());
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("2.ctrl");

        // Leave a stale socket file behind without running Drop.
        let stale = UnixListener::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        let listener = bind(&path).unwrap();
        let _client = connect(&path).unwrap();
        let _server = listener.accept().unwrap();
    }

    #[test]
    fn test_bind_fails_when_directory_is_a_file() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("control");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = bind(&blocker.join("3.ctrl")).unwrap_err();
        assert!(matches!(err, ControlError::Transport(_)), "{err:?}");
    }

    #[test]
    fn test_connect_without_listener_is_transport_error() {
        let dir = TempDir::new().unwrap();
        let err = connect(&dir.path().join("missing.ctrl")).unwrap_err();
        assert!(matches!(err, ControlError::Transport(_)), "{err:?}");
    }

    #[test]
    fn test_descriptors_survive_exec() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("4.ctrl");
        let listener = bind(&path).unwrap();
        let client = connect(&path).unwrap();

        assert!(!cloexec(listener.as_raw_fd()));
        assert!(!cloexec(client.as_fd().as_raw_fd()));
    }

    #[test]
    fn test_inherit_on_exec_clears_only_cloexec() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        assert!(cloexec(fd));

        inherit_on_exec(fd).unwrap();
        assert!(!cloexec(fd));
        // Idempotent on an already inheritable descriptor.
        inherit_on_exec(fd).unwrap();
        assert!(!cloexec(fd));
    }

    #[test]
    fn test_drop_unlinks_only_for_owner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("5.ctrl");
        let listener = bind(&path).unwrap();

        let client = connect(&path).unwrap();
        drop(client);
        assert!(path.exists());

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_connection_lines() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut left = Connection::new(a).unwrap();
        let mut right = Connection::new(b).unwrap();

        left.write_line("NOVM RPC").unwrap();
        left.send(&serde_json::json!({"k": 1})).unwrap();

        assert_eq!(right.read_line().unwrap().as_deref(), Some("NOVM RPC"));
        assert_eq!(right.read_line().unwrap().as_deref(), Some(r#"{"k":1}"#));

        left.shutdown_write().unwrap();
        assert_eq!(right.read_line().unwrap(), None);
    }
}

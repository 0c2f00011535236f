//! Supervisor side of the control socket.
//!
//! Each accepted connection reads its greeting line and is then served
//! either as an RPC connection or as a single run session. The actual
//! behaviour is supplied by a [`ControlHandler`].

use crate::endpoint::{Connection, Listener};
use crate::error::ControlError;
use crate::protocol::{Greeting, MAX_CHUNK, RpcRequest, RpcResponse, RunRequest, StreamFrame};
use nix::fcntl::OFlag;
use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};
use std::thread;

/// A started guest process as seen by the run-session pump.
pub struct GuestProcess {
    /// Standard input; dropped when the client signals end of input.
    pub input: Option<Box<dyn Write + Send>>,
    /// Merged stdout and stderr.
    pub output: Box<dyn Read + Send>,
    /// Blocks until the process exits and yields its status.
    pub wait: Box<dyn FnOnce() -> i32 + Send>,
}

pub trait ControlHandler: Send {
    /// Handle an RPC call. `method` is the full wire name, e.g. `Rpc.Vcpu`.
    fn call(&mut self, method: &str, params: Value) -> Result<Value, String>;

    /// Start a guest command for a run session.
    fn start(&mut self, request: &RunRequest) -> Result<GuestProcess, String>;
}

impl Listener {
    /// Accept connections forever, serving each on its own thread with a
    /// handler produced by `factory`.
    pub fn serve<F, H>(&self, factory: F) -> Result<(), ControlError>
    where
        F: Fn() -> H,
        H: ControlHandler + 'static,
    {
        loop {
            let conn = self.accept()?;
            let mut handler = factory();
            thread::spawn(move || {
                if let Err(e) = serve_connection(conn, &mut handler) {
                    tracing::debug!(error = %e, "Control connection ended with error");
                }
            });
        }
    }
}

/// Serve one connection until the peer hangs up.
pub fn serve_connection(
    mut conn: Connection,
    handler: &mut dyn ControlHandler,
) -> Result<(), ControlError> {
    let header = match conn.read_line()? {
        Some(header) => header,
        None => return Ok(()),
    };

    match Greeting::parse(&header) {
        Some(Greeting::Rpc) => serve_rpc(conn, handler),
        Some(Greeting::Run) => serve_run(conn, handler),
        None => {
            tracing::warn!(header = %header, "Rejected control connection");
            let _ = conn.write_line("invalid header");
            Err(ControlError::Protocol(format!("invalid header {:?}", header)))
        }
    }
}

fn serve_rpc(mut conn: Connection, handler: &mut dyn ControlHandler) -> Result<(), ControlError> {
    while let Some(line) = conn.read_line()? {
        let request: RpcRequest = serde_json::from_str(&line)
            .map_err(|e| ControlError::Protocol(format!("malformed request {:?}: {}", line, e)))?;

        let params = request.params.into_iter().next().unwrap_or(Value::Null);
        let response = match handler.call(&request.method, params) {
            Ok(result) => RpcResponse {
                id: request.id,
                result: Some(result),
                error: None,
            },
            Err(error) => {
                tracing::debug!(method = %request.method, error = %error, "RPC failed");
                RpcResponse {
                    id: request.id,
                    result: None,
                    error: Some(error),
                }
            }
        };
        conn.send(&response)?;
    }
    Ok(())
}

fn serve_run(mut conn: Connection, handler: &mut dyn ControlHandler) -> Result<(), ControlError> {
    let line = conn
        .read_line()?
        .ok_or_else(|| ControlError::Protocol("connection closed before run request".to_string()))?;

    let request: RunRequest = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(e) => {
            conn.send(&e.to_string())?;
            return Ok(());
        }
    };

    let process = match handler.start(&request) {
        Ok(process) => process,
        Err(error) => {
            tracing::debug!(command = ?request.command, error = %error, "Guest command failed to start");
            conn.send(&error)?;
            return Ok(());
        }
    };

    conn.write_line(&StreamFrame::Ack.encode())?;

    let GuestProcess {
        input,
        mut output,
        wait,
    } = process;

    // Client input arrives on the original connection so nothing it already
    // buffered is lost; frames go out through a clone.
    let mut writer = conn.try_clone()?;
    thread::spawn(move || pump_input(conn, input));

    let mut buf = [0u8; MAX_CHUNK];
    loop {
        let n = match output.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "Guest output failed");
                break;
            }
        };
        if writer
            .write_line(&StreamFrame::Data(buf[..n].to_vec()).encode())
            .is_err()
        {
            break;
        }
    }

    let code = wait();
    tracing::debug!(command = ?request.command, exit_code = code, "Guest command exited");
    let _ = writer.write_line(&StreamFrame::ExitCode(code).encode());
    let _ = writer.write_line(&StreamFrame::Ack.encode());
    let _ = writer.shutdown_write();
    Ok(())
}

fn pump_input(mut conn: Connection, mut input: Option<Box<dyn Write + Send>>) {
    while let Ok(Some(line)) = conn.read_line() {
        match StreamFrame::decode(&line) {
            Ok(StreamFrame::Data(data)) if data.is_empty() => {
                input = None;
            }
            Ok(StreamFrame::Data(data)) => {
                if let Some(stdin) = input.as_mut()
                    && (stdin.write_all(&data).is_err() || stdin.flush().is_err())
                {
                    input = None;
                }
            }
            Ok(other) => tracing::debug!(frame = ?other, "Ignoring unexpected client frame"),
            Err(e) => {
                tracing::debug!(error = %e, "Malformed client frame");
                break;
            }
        }
    }
}

/// Runs commands as host processes. Useful for exercising the control
/// protocol without a virtual machine.
#[derive(Debug, Default)]
pub struct LocalGuest;

impl ControlHandler for LocalGuest {
    fn call(&mut self, method: &str, _params: Value) -> Result<Value, String> {
        Err(format!("rpc: can't find method {}", method))
    }

    fn start(&mut self, request: &RunRequest) -> Result<GuestProcess, String> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| "invalid argument".to_string())?;

        let (read_end, write_end) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| e.to_string())?;
        let stderr_end = write_end.try_clone().map_err(|e| e.to_string())?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(&request.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end));
        if !request.cwd.is_empty() {
            command.current_dir(&request.cwd);
        }

        let mut child = command.spawn().map_err(|e| e.to_string())?;
        // Release our copies of the write ends so output reaches EOF.
        drop(command);

        let input = child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as Box<dyn Write + Send>);

        Ok(GuestProcess {
            input,
            output: Box::new(std::fs::File::from(read_end)),
            wait: Box::new(move || match child.wait() {
                Ok(status) => status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
                Err(_) => 1,
            }),
        })
    }
}

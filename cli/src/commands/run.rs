use super::Target;
use clap::Args;
use novm_control::{ControlConfig, ControlError, RunRequest};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub target: Target,

    /// Allocate a terminal; `~.` detaches
    #[arg(long, short)]
    pub terminal: bool,

    /// Working directory inside the guest
    #[arg(long, default_value = "/")]
    pub cwd: String,

    /// Extra environment for the command (KEY=VAL)
    #[arg(long, short)]
    pub env: Vec<String>,

    /// Command and arguments
    #[arg(required = true, last = true)]
    pub command: Vec<String>,
}

pub fn run(config: &ControlConfig, args: RunArgs) -> Result<i32, ControlError> {
    let path = args.target.control_path(config)?;
    let request = request(args.command, &args.env, args.cwd, args.terminal);
    session(&path, &request)
}

/// Build a request carrying this process's environment plus `extra`.
pub fn request(command: Vec<String>, extra: &[String], cwd: String, terminal: bool) -> RunRequest {
    let mut environment = environment(std::env::vars_os());
    for entry in extra {
        match entry.split_once('=') {
            Some((key, value)) => environment.insert(key.to_string(), value.to_string()),
            None => environment.insert(entry.to_string(), String::new()),
        };
    }
    RunRequest {
        command,
        environment,
        cwd,
        terminal,
    }
}

/// The UTF-8 part of an environment; other entries cannot be encoded in a
/// request and are left out.
fn environment<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (key, _) => {
                tracing::debug!(key = ?key, "Skipping non-UTF-8 environment entry");
                None
            }
        })
        .collect()
}

pub fn session(path: &Path, request: &RunRequest) -> Result<i32, ControlError> {
    let outcome = novm_control::run(path, request)?;
    tracing::debug!(outcome = ?outcome, "Run session finished");
    Ok(outcome.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::ffi::OsStringExt;

    #[test]
    fn test_environment_skips_non_utf8_entries() {
        let vars = vec![
            (OsString::from("PATH"), OsString::from("/usr/bin")),
            (OsString::from("BROKEN"), OsString::from_vec(vec![0x66, 0xff, 0x6f])),
            (OsString::from_vec(vec![0xfe]), OsString::from("x")),
        ];
        let env = environment(vars);
        assert_eq!(env.len(), 1);
        assert_eq!(env["PATH"], "/usr/bin");
    }

    #[test]
    fn test_extra_entries_override_environment() {
        let request = request(
            vec!["env".to_string()],
            &["NOVM_TEST_EXTRA=1".to_string(), "EMPTY".to_string()],
            "/".to_string(),
            false,
        );
        assert_eq!(request.environment["NOVM_TEST_EXTRA"], "1");
        assert_eq!(request.environment["EMPTY"], "");
    }
}

//! Control-plane configuration.
//!
//! Every value is resolved with the same precedence: an explicit argument
//! wins over an environment override, which wins over the built-in default.

use std::path::{Path, PathBuf};

pub const ENV_ROOT: &str = "NOVM_ROOT";
pub const ENV_CONTROL: &str = "NOVM_CONTROL";
pub const ENV_INSTANCES: &str = "NOVM_INSTANCES";
pub const ENV_KERNELS: &str = "NOVM_KERNELS";
pub const ENV_VMM: &str = "NOVM_VMM";

const CONTROL_SUFFIX: &str = "ctrl";

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub root: Option<PathBuf>,
    pub control_dir: Option<PathBuf>,
    pub instances_dir: Option<PathBuf>,
    pub kernels_dir: Option<PathBuf>,
    pub vmm_binary: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    pub root: PathBuf,
    pub control_dir: PathBuf,
    pub instances_dir: PathBuf,
    pub kernels_dir: PathBuf,
    pub vmm_binary: PathBuf,
}

impl ControlConfig {
    /// Resolve against the process environment.
    pub fn resolve(overrides: ConfigOverrides) -> Self {
        Self::resolve_with(overrides, |key| std::env::var_os(key).map(PathBuf::from))
    }

    /// Resolve against an arbitrary environment lookup.
    pub fn resolve_with<F>(overrides: ConfigOverrides, env: F) -> Self
    where
        F: Fn(&str) -> Option<PathBuf>,
    {
        let root = overrides
            .root
            .or_else(|| env(ENV_ROOT))
            .unwrap_or_else(|| default_root(env("HOME")));

        let control_dir = overrides
            .control_dir
            .or_else(|| env(ENV_CONTROL))
            .unwrap_or_else(|| root.join("control"));

        let instances_dir = overrides
            .instances_dir
            .or_else(|| env(ENV_INSTANCES))
            .unwrap_or_else(|| root.join("instances"));

        let kernels_dir = overrides
            .kernels_dir
            .or_else(|| env(ENV_KERNELS))
            .unwrap_or_else(|| root.join("kernels"));

        let vmm_binary = overrides
            .vmm_binary
            .or_else(|| env(ENV_VMM))
            .unwrap_or_else(default_vmm_binary);

        Self {
            root,
            control_dir,
            instances_dir,
            kernels_dir,
            vmm_binary,
        }
    }

    /// Control socket path for the supervisor with the given pid.
    pub fn control_path(&self, pid: i32) -> PathBuf {
        control_path_in(&self.control_dir, pid)
    }

    /// Log file for a detached supervisor.
    pub fn log_path(&self, pid: i32) -> PathBuf {
        self.instances_dir.join(format!("{}.log", pid))
    }
}

pub fn control_path_in(dir: &Path, pid: i32) -> PathBuf {
    dir.join(format!("{}.{}", pid, CONTROL_SUFFIX))
}

fn default_root(home: Option<PathBuf>) -> PathBuf {
    home.unwrap_or_else(std::env::temp_dir).join(".novm")
}

fn default_vmm_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("novmm")))
        .unwrap_or_else(|| PathBuf::from("novmm"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<PathBuf> {
        let map: HashMap<String, PathBuf> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), PathBuf::from(v)))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_derive_from_home() {
        let config = ControlConfig::resolve_with(
            ConfigOverrides::default(),
            env_of(&[("HOME", "/home/alice")]),
        );
        assert_eq!(config.root, PathBuf::from("/home/alice/.novm"));
        assert_eq!(config.control_dir, PathBuf::from("/home/alice/.novm/control"));
        assert_eq!(
            config.instances_dir,
            PathBuf::from("/home/alice/.novm/instances")
        );
        assert_eq!(config.control_path(77), PathBuf::from("/home/alice/.novm/control/77.ctrl"));
    }

    #[test]
    fn test_env_overrides_default() {
        let config = ControlConfig::resolve_with(
            ConfigOverrides::default(),
            env_of(&[(ENV_ROOT, "/srv/novm"), (ENV_CONTROL, "/run/novm")]),
        );
        assert_eq!(config.root, PathBuf::from("/srv/novm"));
        assert_eq!(config.control_dir, PathBuf::from("/run/novm"));
        assert_eq!(config.kernels_dir, PathBuf::from("/srv/novm/kernels"));
    }

    #[test]
    fn test_explicit_overrides_env() {
        let config = ControlConfig::resolve_with(
            ConfigOverrides {
                root: Some(PathBuf::from("/explicit")),
                vmm_binary: Some(PathBuf::from("/opt/novmm")),
                ..Default::default()
            },
            env_of(&[(ENV_ROOT, "/srv/novm"), (ENV_VMM, "/usr/libexec/novmm")]),
        );
        assert_eq!(config.root, PathBuf::from("/explicit"));
        assert_eq!(config.instances_dir, PathBuf::from("/explicit/instances"));
        assert_eq!(config.vmm_binary, PathBuf::from("/opt/novmm"));
    }
}

pub mod instances;
pub mod launch;
pub mod rpc;
pub mod run;

pub use instances::ListArgs;
pub use launch::LaunchArgs;
pub use rpc::RpcArgs;
pub use run::RunArgs;

use clap::Args;
use novm_control::{ControlConfig, ControlError, DirRegistry};
use std::path::PathBuf;

/// Selects the instance a command talks to.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    /// Supervisor pid of the instance
    #[arg(long, conflicts_with = "name")]
    pub id: Option<i32>,

    /// Name given to the instance at launch
    #[arg(long)]
    pub name: Option<String>,
}

impl Target {
    /// Control socket of the selected instance. Without `--id` or `--name`
    /// the single running instance is used.
    pub fn control_path(&self, config: &ControlConfig) -> Result<PathBuf, ControlError> {
        if let Some(id) = self.id {
            return Ok(config.control_path(id));
        }

        let registry = DirRegistry::new(&config.instances_dir);
        let pid = match &self.name {
            Some(name) => registry
                .find_by_name(name)?
                .ok_or_else(|| ControlError::Config(format!("no instance named {}", name)))?
                .pid,
            None => {
                let running: Vec<_> = registry.list()?.into_iter().filter(|i| i.alive).collect();
                match running.as_slice() {
                    [only] => only.pid,
                    [] => return Err(ControlError::Config("no running instances".to_string())),
                    _ => {
                        return Err(ControlError::Config(
                            "several instances are running; pass --id or --name".to_string(),
                        ));
                    }
                }
            }
        };
        Ok(config.control_path(pid))
    }
}

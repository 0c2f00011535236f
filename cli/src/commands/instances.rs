use clap::Args;
use novm_control::{ControlConfig, ControlError, DirRegistry};

#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// Also show the devices of each instance
    #[arg(long)]
    pub devices: bool,
}

pub fn list(config: &ControlConfig, args: ListArgs) -> Result<(), ControlError> {
    let registry = DirRegistry::new(&config.instances_dir);
    let instances = registry.list()?;

    if instances.is_empty() {
        println!("No instances found");
        return Ok(());
    }

    println!(
        "{:<10} {:<20} {:<6} {:<10} {:<20} {:<8}",
        "PID", "NAME", "CPUS", "MEMORY", "KERNEL", "STATUS"
    );
    for info in instances {
        println!(
            "{:<10} {:<20} {:<6} {:<10} {:<20} {:<8}",
            info.pid,
            info.metadata.name.as_deref().unwrap_or("-"),
            info.metadata.cpus,
            format!("{}MB", info.metadata.memory),
            info.metadata.kernel,
            if info.alive { "running" } else { "dead" },
        );
        if args.devices {
            for device in &info.metadata.devices {
                println!("    {:<20} {}", device.driver, device.info);
            }
        }
    }
    Ok(())
}

pub fn clean(config: &ControlConfig) -> Result<(), ControlError> {
    let registry = DirRegistry::new(&config.instances_dir);
    for pid in registry.clean()? {
        println!("{}", pid);
    }
    Ok(())
}

use clap::Args;
use novm_control::{
    ControlConfig, ControlError, DirRegistry, MachineBuilder, MachineSpec, SpawnOptions, spawn,
};

#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Name for the instance
    #[arg(long)]
    pub name: Option<String>,

    /// Kernel id (defaults to the newest installed kernel)
    #[arg(long)]
    pub kernel: Option<String>,

    /// Number of virtual CPUs
    #[arg(long, default_value_t = 1)]
    pub cpus: u32,

    /// Guest memory in megabytes
    #[arg(long, default_value_t = 1024)]
    pub memory: u64,

    /// Boot the guest's own init instead of the agent
    #[arg(long)]
    pub init: bool,

    /// Network interface (mac=…,tapname=…,bridge=…,mtu=…)
    #[arg(long)]
    pub nic: Vec<String>,

    /// Block device (file=…,dev=…)
    #[arg(long)]
    pub disk: Vec<String>,

    /// Read-only mapping (HOST or HOST=>GUEST)
    #[arg(long)]
    pub read: Vec<String>,

    /// Writable mapping (HOST or HOST=>GUEST)
    #[arg(long)]
    pub write: Vec<String>,

    /// Use MMIO virtio devices instead of PCI
    #[arg(long)]
    pub nopci: bool,

    /// Enable the COM1 serial console
    #[arg(long)]
    pub com1: bool,

    /// Enable the COM2 serial console
    #[arg(long)]
    pub com2: bool,

    /// Extra kernel command line
    #[arg(long, default_value = "")]
    pub cmdline: String,

    /// Extra supervisor flag, without the leading dash
    #[arg(long)]
    pub vmmopt: Vec<String>,

    /// Start every device with debugging output
    #[arg(long)]
    pub debug_devices: bool,

    /// Run the supervisor in this process instead of detaching
    #[arg(long)]
    pub nofork: bool,

    /// Allocate a terminal for the trailing command
    #[arg(long, short)]
    pub terminal: bool,

    /// Command to run once the instance is up; the instance stops with it
    #[arg(last = true)]
    pub command: Vec<String>,
}

impl LaunchArgs {
    fn spec(&self) -> MachineSpec {
        MachineSpec {
            name: self.name.clone(),
            kernel: self.kernel.clone(),
            cpus: self.cpus,
            memory: self.memory,
            init: self.init,
            nics: self.nic.clone(),
            disks: self.disk.clone(),
            read: self.read.clone(),
            write: self.write.clone(),
            pci: !self.nopci,
            com1: self.com1,
            com2: self.com2,
            cmdline: self.cmdline.clone(),
            vmmopts: self.vmmopt.clone(),
            debug: self.debug_devices,
        }
    }
}

pub fn launch(config: &ControlConfig, args: LaunchArgs) -> Result<i32, ControlError> {
    if args.nofork && !args.command.is_empty() {
        return Err(ControlError::Config(
            "a command cannot be run with --nofork".to_string(),
        ));
    }

    let registry = DirRegistry::new(&config.instances_dir);
    let mut builder = MachineBuilder::new(config, args.spec());
    let options = SpawnOptions {
        detach: !args.nofork,
        exit_with_caller: !args.command.is_empty(),
    };

    let pid = spawn(config, &registry, &mut builder, options)?;

    if args.command.is_empty() {
        println!("{}", pid);
        return Ok(0);
    }

    let request = super::run::request(args.command, &[], "/".to_string(), args.terminal);
    super::run::session(&config.control_path(pid.as_raw()), &request)
}

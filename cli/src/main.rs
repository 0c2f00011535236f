mod commands;

use clap::{Args, Parser, Subcommand};
use commands::{LaunchArgs, ListArgs, RpcArgs, RunArgs};
use novm_control::config::{ENV_CONTROL, ENV_INSTANCES, ENV_KERNELS, ENV_ROOT, ENV_VMM};
use novm_control::{ConfigOverrides, ControlConfig, ControlError};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "novm")]
#[command(about = "novm - launch and control lightweight virtual machines")]
struct Cli {
    /// Log transport and protocol details to stderr
    #[arg(long, global = true)]
    debug: bool,

    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PathArgs {
    /// State directory
    #[arg(long, global = true, env = ENV_ROOT)]
    root: Option<PathBuf>,

    /// Directory holding control sockets
    #[arg(long, global = true, env = ENV_CONTROL)]
    control_dir: Option<PathBuf>,

    /// Directory holding instance metadata
    #[arg(long, global = true, env = ENV_INSTANCES)]
    instances_dir: Option<PathBuf>,

    /// Directory holding installed kernels
    #[arg(long, global = true, env = ENV_KERNELS)]
    kernels_dir: Option<PathBuf>,

    /// Supervisor binary
    #[arg(long, global = true, env = ENV_VMM)]
    vmm: Option<PathBuf>,
}

impl From<PathArgs> for ConfigOverrides {
    fn from(args: PathArgs) -> Self {
        ConfigOverrides {
            root: args.root,
            control_dir: args.control_dir,
            instances_dir: args.instances_dir,
            kernels_dir: args.kernels_dir,
            vmm_binary: args.vmm,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a control call to a running instance
    Rpc(RpcArgs),
    /// Run a command inside a running instance
    Run(RunArgs),
    /// Start a new instance
    Launch(LaunchArgs),
    /// List known instances
    #[command(visible_alias = "ls")]
    List(ListArgs),
    /// Remove entries of instances that are no longer running
    Clean,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    // Environment overrides are already folded in by clap.
    let config = ControlConfig::resolve_with(cli.paths.into(), |key| match key {
        "HOME" => std::env::var_os(key).map(PathBuf::from),
        _ => None,
    });

    let result = match cli.command {
        Commands::Rpc(args) => commands::rpc::call(&config, args).map(|()| 0),
        Commands::Run(args) => commands::run::run(&config, args),
        Commands::Launch(args) => commands::launch::launch(&config, args),
        Commands::List(args) => commands::instances::list(&config, args).map(|()| 0),
        Commands::Clean => commands::instances::clean(&config).map(|()| 0),
    };

    match result {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            report(&e, cli.debug);
            std::process::exit(e.exit_code());
        }
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Application errors get one line; lower-level failures point at `--debug`
/// unless it is already on, in which case the detail was logged.
fn report(err: &ControlError, debug: bool) {
    if err.is_user_facing() || debug {
        eprintln!("novm: {}", err);
        if debug {
            tracing::debug!(error = ?err, "Command failed");
        }
    } else {
        eprintln!("novm: {} (rerun with --debug for details)", err);
    }
}

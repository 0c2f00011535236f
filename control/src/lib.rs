//! Control channel between the `novm` command line and running supervisors.

pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod machine;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod terminal;
pub mod watch;

pub use config::{ConfigOverrides, ControlConfig};
pub use endpoint::{Connection, Listener, bind, connect};
pub use error::{ControlError, FailureKind, INTERRUPTED_EXIT_CODE, NO_EXIT_CODE};
pub use machine::{MachineBuilder, MachineSpec};
pub use protocol::{RunRequest, StreamFrame};
pub use registry::{DeviceInfo, DirRegistry, InstanceInfo, InstanceMetadata, InstanceRegistry};
pub use rpc::RpcClient;
pub use server::{ControlHandler, GuestProcess, LocalGuest, serve_connection};
pub use session::{RunOutcome, RunSession, run};
pub use supervisor::{ArgsBuilder, FailureRecord, Launch, SpawnOptions, spawn};

//! Turns a machine description into supervisor arguments.
//!
//! Runs in the launcher child: devices open their host resources here and
//! the initial state is written to an unlinked file passed by descriptor.

use crate::config::ControlConfig;
use crate::device::{
    Device, DiskOptions, NicOptions, Placement, UartPort, kernel_cmdline, read_mappings,
    write_mappings,
};
use crate::endpoint::inherit_on_exec;
use crate::error::ControlError;
use crate::registry::{DeviceInfo, DirRegistry, InstanceMetadata};
use crate::supervisor::{ArgsBuilder, Launch};
use serde_json::json;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

/// The files a kernel directory provides.
const KERNEL_FILES: [(&str, &str); 4] = [
    ("-vmlinux", "vmlinux"),
    ("-sysmap", "sysmap"),
    ("-initrd", "initrd"),
    ("-setup", "setup"),
];

#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub name: Option<String>,
    /// Kernel id under the kernels directory; the newest when unset.
    pub kernel: Option<String>,
    pub cpus: u32,
    /// Guest memory in megabytes.
    pub memory: u64,
    /// Boot a real init instead of the in-guest agent.
    pub init: bool,
    pub nics: Vec<String>,
    pub disks: Vec<String>,
    pub read: Vec<String>,
    pub write: Vec<String>,
    pub pci: bool,
    pub com1: bool,
    pub com2: bool,
    pub cmdline: String,
    pub vmmopts: Vec<String>,
    pub debug: bool,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            name: None,
            kernel: None,
            cpus: 1,
            memory: 1024,
            init: false,
            nics: Vec::new(),
            disks: Vec::new(),
            read: Vec::new(),
            write: Vec::new(),
            pci: true,
            com1: false,
            com2: false,
            cmdline: String::new(),
            vmmopts: Vec::new(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    pub id: String,
    pub dir: PathBuf,
}

impl Kernel {
    /// Resolve `id`, or the most recently installed kernel.
    pub fn find(kernels_dir: &Path, id: Option<&str>) -> Result<Kernel, ControlError> {
        match id {
            Some(id) => {
                let dir = kernels_dir.join(id);
                if dir.is_dir() {
                    Ok(Kernel {
                        id: id.to_string(),
                        dir,
                    })
                } else {
                    Err(ControlError::Config(format!("kernel not found: {}", id)))
                }
            }
            None => Self::newest(kernels_dir)?
                .ok_or_else(|| ControlError::Config("no kernels available".to_string())),
        }
    }

    fn newest(kernels_dir: &Path) -> Result<Option<Kernel>, ControlError> {
        let entries = match std::fs::read_dir(kernels_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest = None;
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_dir() {
                continue;
            }
            let modified = meta.modified()?;
            if newest.as_ref().is_none_or(|(when, _)| modified > *when) {
                newest = Some((modified, entry));
            }
        }

        Ok(newest.map(|(_, entry)| Kernel {
            id: entry.file_name().to_string_lossy().into_owned(),
            dir: entry.path(),
        }))
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// The kernel release string, used to mount its modules.
    pub fn release(&self) -> Result<String, ControlError> {
        let path = self.file("release");
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| ControlError::Config(format!("read {}: {}", path.display(), e)))
    }
}

/// [`ArgsBuilder`] for a full virtual machine.
pub struct MachineBuilder {
    spec: MachineSpec,
    kernels_dir: PathBuf,
    agent: PathBuf,
    instances: DirRegistry,
}

impl MachineBuilder {
    pub fn new(config: &ControlConfig, spec: MachineSpec) -> Self {
        Self {
            spec,
            kernels_dir: config.kernels_dir.clone(),
            agent: config.vmm_binary.with_file_name("noguest"),
            instances: DirRegistry::new(&config.instances_dir),
        }
    }

    fn devices(&self, kernel: &Kernel, pid: i32) -> Result<Vec<Device>, ControlError> {
        let spec = &self.spec;
        let pci = spec.pci;
        let mut devices = vec![Device::Bios, Device::Acpi, Device::Apic, Device::Pit];

        if spec.com1 {
            devices.push(Device::Uart(UartPort::Com1));
        }
        if spec.com2 {
            devices.push(Device::Uart(UartPort::Com2));
        }
        if pci {
            devices.push(Device::PciBus);
            devices.push(Device::PciHostBridge);
        }

        let memory = spec
            .memory
            .checked_mul(1024 * 1024)
            .ok_or_else(|| ControlError::Config(format!("memory size too large: {}MB", spec.memory)))?;
        devices.push(Device::user_memory(memory)?);

        // The agent inside the guest talks over the console.
        devices.push(Device::Console {
            placement: Placement::new(0, pci),
        });

        let mut index = 1;
        for nic in &spec.nics {
            devices.push(Device::network_interface(
                index,
                Placement::new(index, pci),
                NicOptions::parse(nic)?,
            )?);
            index += 1;
        }
        for (position, disk) in spec.disks.iter().enumerate() {
            devices.push(Device::block_disk(
                position as u32,
                Placement::new(index, pci),
                DiskOptions::parse(disk)?,
            )?);
            index += 1;
        }

        let mut read = spec.read.clone();
        let modules = kernel.file("modules");
        if modules.exists() {
            read.push(format!(
                "{}=>/lib/modules/{}",
                modules.display(),
                kernel.release()?
            ));
        }

        let writable = self.instances.instance_dir(pid).join("writable");
        std::fs::create_dir_all(&writable)?;
        let mut write = write_mappings(&spec.write);
        write
            .entry("/".to_string())
            .or_insert_with(|| writable.display().to_string());

        devices.push(Device::filesystem_share(
            Placement::new(index, pci),
            "root",
            read_mappings(&read),
            write,
        ));
        index += 1;

        devices.push(Device::filesystem_share(
            Placement::new(index, pci),
            "init",
            read_mappings(&[format!("{}=>/init", self.agent.display())]),
            Default::default(),
        ));

        Ok(devices)
    }
}

impl ArgsBuilder for MachineBuilder {
    fn build(&mut self, pid: i32) -> Result<Launch, ControlError> {
        let kernel = Kernel::find(&self.kernels_dir, self.spec.kernel.as_deref())?;

        let mut args = Vec::new();
        if self.spec.init {
            args.push("-init".to_string());
        }
        for (flag, file) in KERNEL_FILES {
            args.push(flag.to_string());
            args.push(kernel.file(file).display().to_string());
        }

        let devices = self.devices(&kernel, pid)?;
        let state = json!({
            "vcpus": (0..self.spec.cpus).map(|_| json!({})).collect::<Vec<_>>(),
            "devices": devices.iter().map(|d| d.spec(self.spec.debug)).collect::<Vec<_>>(),
        });

        let mut state_file = tempfile::tempfile()?;
        serde_json::to_writer(&mut state_file, &state)?;
        state_file.flush()?;
        state_file.seek(SeekFrom::Start(0))?;
        inherit_on_exec(state_file.as_raw_fd())?;
        args.push(format!("-statefd={}", state_file.as_raw_fd()));

        args.push(format!("-cmdline={}", kernel_cmdline(&devices, &self.spec.cmdline)));
        args.extend(self.spec.vmmopts.iter().map(|opt| format!("-{}", opt)));

        tracing::debug!(pid, kernel = %kernel.id, devices = devices.len(), "Built machine state");

        let described: Vec<DeviceInfo> = devices
            .iter()
            .filter_map(|d| {
                d.describe().map(|info| DeviceInfo {
                    driver: d.driver(),
                    info,
                })
            })
            .collect();

        let mut inherited: Vec<OwnedFd> = vec![OwnedFd::from(state_file)];
        inherited.extend(devices.into_iter().filter_map(Device::into_fd));

        Ok(Launch {
            args,
            metadata: InstanceMetadata {
                name: self.spec.name.clone(),
                cpus: self.spec.cpus,
                memory: self.spec.memory,
                kernel: kernel.id,
                devices: described,
            },
            inherited,
        })
    }
}

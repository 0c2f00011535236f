//! Device descriptors handed to the supervisor in its initial state.
//!
//! Every device the supervisor knows about is one variant of [`Device`].
//! Devices backed by host resources (disks, tap interfaces, guest memory)
//! open those resources on construction and keep the descriptors open so
//! they are inherited across `exec`.

use crate::endpoint::inherit_on_exec;
use crate::error::ControlError;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::Command;
use uuid::Uuid;

/// First guest-physical address used for virtio MMIO windows.
pub const MMIO_BASE: u64 = 0xe000_0000;
/// Size of one virtio MMIO window.
pub const MMIO_STRIDE: u64 = 4096;
/// First interrupt line assigned to virtio MMIO devices.
pub const MMIO_IRQ_BASE: u32 = 32;

const OUI: &str = "28:48:46";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// How a virtio device is attached to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Pci,
    Mmio { index: u32 },
}

impl Placement {
    pub fn new(index: u32, pci: bool) -> Self {
        if pci {
            Placement::Pci
        } else {
            Placement::Mmio { index }
        }
    }

    fn driver(self, kind: &str) -> String {
        match self {
            Placement::Pci => format!("virtio-pci-{}", kind),
            Placement::Mmio { .. } => format!("virtio-mmio-{}", kind),
        }
    }

    fn address(index: u32) -> u64 {
        MMIO_BASE + index as u64 * MMIO_STRIDE
    }

    fn cmdline(self) -> Option<String> {
        match self {
            Placement::Pci => None,
            Placement::Mmio { index } => Some(format!(
                "virtio-mmio.{}@0x{:x}:{}:{}",
                index,
                Self::address(index),
                MMIO_IRQ_BASE + index,
                index
            )),
        }
    }

    /// Merge the MMIO window into a device's data mapping.
    fn decorate(self, mut data: Value) -> Value {
        if let (Placement::Mmio { index }, Value::Object(map)) = (self, &mut data) {
            map.insert("address".to_string(), json!(Self::address(index)));
            map.insert("interrupt".to_string(), json!(MMIO_IRQ_BASE + index));
        }
        data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartPort {
    Com1,
    Com2,
}

impl UartPort {
    fn base(self) -> u16 {
        match self {
            UartPort::Com1 => 0x3f8,
            UartPort::Com2 => 0x2f8,
        }
    }

    fn interrupt(self) -> u32 {
        match self {
            UartPort::Com1 => 4,
            UartPort::Com2 => 3,
        }
    }
}

/// Options for a tap-backed network interface, as given on the command line
/// (`mac=…,tapname=…,bridge=…,mtu=…`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NicOptions {
    pub mac: Option<String>,
    pub tapname: Option<String>,
    pub bridge: Option<String>,
    pub mtu: Option<u32>,
}

impl NicOptions {
    pub fn parse(spec: &str) -> Result<Self, ControlError> {
        let mut options = NicOptions::default();
        for (key, value) in parse_options(spec)? {
            match key.as_str() {
                "mac" => options.mac = Some(value),
                "tapname" => options.tapname = Some(value),
                "bridge" => options.bridge = Some(value),
                "mtu" => {
                    options.mtu = Some(value.parse().map_err(|_| {
                        ControlError::Config(format!("invalid mtu {:?}", value))
                    })?)
                }
                other => {
                    return Err(ControlError::Config(format!(
                        "unknown nic option {:?}",
                        other
                    )));
                }
            }
        }
        Ok(options)
    }
}

/// Options for a block device (`file=…,dev=…`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskOptions {
    pub file: Option<PathBuf>,
    pub dev: Option<String>,
}

impl DiskOptions {
    pub fn parse(spec: &str) -> Result<Self, ControlError> {
        let mut options = DiskOptions::default();
        for (key, value) in parse_options(spec)? {
            match key.as_str() {
                "file" | "filename" => options.file = Some(PathBuf::from(value)),
                "dev" => options.dev = Some(value),
                other => {
                    return Err(ControlError::Config(format!(
                        "unknown disk option {:?}",
                        other
                    )));
                }
            }
        }
        Ok(options)
    }
}

fn parse_options(spec: &str) -> Result<Vec<(String, String)>, ControlError> {
    spec.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| ControlError::Config(format!("expected key=value, got {:?}", part)))
        })
        .collect()
}

/// Guest path to host paths, as consumed by the 9p server.
pub type ReadMap = BTreeMap<String, Vec<String>>;
/// Guest path to the host directory receiving writes.
pub type WriteMap = BTreeMap<String, String>;

/// Parse `host` or `host=>guest` mappings; bare paths are mounted at `/`.
pub fn read_mappings<S: AsRef<str>>(specs: &[S]) -> ReadMap {
    let mut map = ReadMap::new();
    for spec in specs {
        let (host, guest) = split_mapping(spec.as_ref());
        map.entry(guest.to_string())
            .or_default()
            .push(host.to_string());
    }
    map
}

/// Like [`read_mappings`], but a guest path has a single writable backing
/// directory. Later mappings replace earlier ones.
pub fn write_mappings<S: AsRef<str>>(specs: &[S]) -> WriteMap {
    specs
        .iter()
        .map(|spec| {
            let (host, guest) = split_mapping(spec.as_ref());
            (guest.to_string(), host.to_string())
        })
        .collect()
}

fn split_mapping(spec: &str) -> (&str, &str) {
    spec.split_once("=>").unwrap_or((spec, "/"))
}

/// Everything a device contributes to the initial machine state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSpec {
    pub driver: String,
    pub name: String,
    pub debug: bool,
    pub data: Value,
}

#[derive(Debug)]
pub enum Device {
    Bios,
    Acpi,
    Apic,
    Pit,
    Uart(UartPort),
    Console {
        placement: Placement,
    },
    BlockDisk {
        placement: Placement,
        dev: String,
        filename: PathBuf,
        file: File,
    },
    NetworkInterface {
        placement: Placement,
        mac: String,
        tapname: String,
        bridge: Option<String>,
        mtu: Option<u32>,
        tap: File,
    },
    FilesystemShare {
        placement: Placement,
        tag: String,
        read: ReadMap,
        write: WriteMap,
    },
    UserMemory {
        size: u64,
        file: File,
    },
    PciBus,
    PciHostBridge,
}

impl Device {
    /// Open `options.file` (default `/dev/null`) read-write. Unnamed disks
    /// are called `vda`, `vdb`, … by position.
    pub fn block_disk(
        index: u32,
        placement: Placement,
        options: DiskOptions,
    ) -> Result<Device, ControlError> {
        let filename = options.file.unwrap_or_else(|| PathBuf::from("/dev/null"));
        let dev = match options.dev {
            Some(dev) => dev,
            None => disk_name(index)?,
        };
        let file = File::options()
            .read(true)
            .write(true)
            .open(&filename)
            .map_err(|e| ControlError::Config(format!("open {}: {}", filename.display(), e)))?;
        inherit_on_exec(file.as_raw_fd())?;

        Ok(Device::BlockDisk {
            placement,
            dev,
            filename,
            file,
        })
    }

    /// Create a tap interface and bring it up.
    pub fn network_interface(
        index: u32,
        placement: Placement,
        options: NicOptions,
    ) -> Result<Device, ControlError> {
        let mac = options.mac.unwrap_or_else(random_mac);
        let tapname = options
            .tapname
            .unwrap_or_else(|| format!("novm{}-{}", std::process::id(), index));

        let tap = open_tap(&tapname)?;
        if let Some(mtu) = options.mtu {
            ip_link(&["set", "dev", &tapname, "mtu", &mtu.to_string()])?;
        }
        if let Some(bridge) = &options.bridge {
            let status = Command::new("brctl").args(["addif", bridge, &tapname]).status();
            if !matches!(status, Ok(s) if s.success()) {
                tracing::warn!(bridge = %bridge, tap = %tapname, "Failed to enslave tap device");
            }
        }
        ip_link(&["set", "up", "dev", &tapname])?;

        Ok(Device::NetworkInterface {
            placement,
            mac,
            tapname,
            bridge: options.bridge,
            mtu: options.mtu,
            tap,
        })
    }

    pub fn filesystem_share(placement: Placement, tag: &str, read: ReadMap, write: WriteMap) -> Device {
        Device::FilesystemShare {
            placement,
            tag: tag.to_string(),
            read,
            write,
        }
    }

    /// Back guest memory with an unlinked temporary file of `size` bytes.
    pub fn user_memory(size: u64) -> Result<Device, ControlError> {
        let file = tempfile::tempfile()?;
        file.set_len(size)?;
        inherit_on_exec(file.as_raw_fd())?;
        Ok(Device::UserMemory { size, file })
    }

    pub fn driver(&self) -> String {
        match self {
            Device::Bios => "bios".to_string(),
            Device::Acpi => "acpi".to_string(),
            Device::Apic => "apic".to_string(),
            Device::Pit => "pit".to_string(),
            Device::Uart(_) => "uart".to_string(),
            Device::Console { placement } => placement.driver("console"),
            Device::BlockDisk { placement, .. } => placement.driver("block"),
            Device::NetworkInterface { placement, .. } => placement.driver("net"),
            Device::FilesystemShare { placement, .. } => placement.driver("fs"),
            Device::UserMemory { .. } => "user-memory".to_string(),
            Device::PciBus => "pci-bus".to_string(),
            Device::PciHostBridge => "pci-hostbridge".to_string(),
        }
    }

    /// What a user sees about this device when listing an instance.
    pub fn describe(&self) -> Option<Value> {
        match self {
            Device::BlockDisk { dev, filename, .. } => Some(json!({
                "dev": dev,
                "filename": filename,
            })),
            Device::NetworkInterface {
                mac,
                tapname,
                bridge,
                mtu,
                ..
            } => Some(json!({
                "mac": mac,
                "tapname": tapname,
                "bridge": bridge,
                "mtu": mtu,
            })),
            Device::FilesystemShare { tag, read, write, .. } => Some(json!({
                "tag": tag,
                "read": read,
                "write": write,
            })),
            Device::UserMemory { size, .. } => Some(json!(size)),
            Device::Uart(port) => Some(json!({ "base": port.base() })),
            _ => None,
        }
    }

    /// Kernel command-line parameter needed for the guest to find the device.
    pub fn cmdline_fragment(&self) -> Option<String> {
        match self {
            Device::Bios => Some("intel_pstate=disable".to_string()),
            Device::Uart(port) => Some(format!("console=uart,io,0x{:x}", port.base())),
            Device::Console { placement }
            | Device::BlockDisk { placement, .. }
            | Device::NetworkInterface { placement, .. }
            | Device::FilesystemShare { placement, .. } => placement.cmdline(),
            _ => None,
        }
    }

    /// Driver-specific data as the supervisor decodes it.
    pub fn wire_data(&self) -> Value {
        match self {
            Device::Uart(port) => json!({
                "base": port.base(),
                "interrupt": port.interrupt(),
            }),
            Device::Console { placement } => placement.decorate(json!({})),
            Device::BlockDisk {
                placement,
                dev,
                file,
                ..
            } => placement.decorate(json!({
                "dev": dev,
                "fd": file.as_raw_fd(),
            })),
            Device::NetworkInterface {
                placement, mac, tap, ..
            } => placement.decorate(json!({
                "mac": mac,
                "fd": tap.as_raw_fd(),
            })),
            Device::FilesystemShare {
                placement,
                tag,
                read,
                write,
            } => placement.decorate(json!({
                "tag": tag,
                "read": read,
                "write": write,
            })),
            Device::UserMemory { file, .. } => json!({ "fd": file.as_raw_fd() }),
            _ => Value::Null,
        }
    }

    /// The host descriptor backing this device, if any.
    pub fn into_fd(self) -> Option<OwnedFd> {
        match self {
            Device::BlockDisk { file, .. }
            | Device::NetworkInterface { tap: file, .. }
            | Device::UserMemory { file, .. } => Some(OwnedFd::from(file)),
            _ => None,
        }
    }

    pub fn spec(&self, debug: bool) -> DeviceSpec {
        let driver = self.driver();
        let name = match self {
            Device::FilesystemShare { tag, .. } => format!("{}-{}", driver, tag),
            _ => driver.clone(),
        };
        DeviceSpec {
            driver,
            name,
            debug,
            data: self.wire_data(),
        }
    }
}

/// Join the command-line fragments of `devices`, followed by `extra`.
pub fn kernel_cmdline(devices: &[Device], extra: &str) -> String {
    let mut parts: Vec<String> = devices.iter().filter_map(Device::cmdline_fragment).collect();
    if !extra.is_empty() {
        parts.push(extra.to_string());
    }
    parts.join(" ")
}

fn disk_name(index: u32) -> Result<String, ControlError> {
    u8::try_from(index)
        .ok()
        .filter(|i| *i < 26)
        .map(|i| format!("vd{}", (b'a' + i) as char))
        .ok_or_else(|| ControlError::Config(format!("no default name for disk {}", index)))
}

fn random_mac() -> String {
    let bytes = Uuid::new_v4();
    let suffix: Vec<String> = bytes.as_bytes()[..3]
        .iter()
        .map(|b| format!("{:02x}", 1 + b % 254))
        .collect();
    format!("{}:{}", OUI, suffix.join(":"))
}

fn open_tap(name: &str) -> Result<File, ControlError> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(ControlError::Config(format!("tap name too long: {}", name)));
    }
    let tap = File::options()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(|e| ControlError::Config(format!("open /dev/net/tun: {}", e)))?;

    // struct ifreq: a 16 byte name followed by the flags union.
    let mut ifr = [0u8; 40];
    ifr[..name.len()].copy_from_slice(name.as_bytes());
    ifr[libc::IFNAMSIZ..libc::IFNAMSIZ + 2].copy_from_slice(&(IFF_TAP | IFF_NO_PI).to_ne_bytes());

    if unsafe { libc::ioctl(tap.as_raw_fd(), TUNSETIFF as _, ifr.as_mut_ptr()) } < 0 {
        return Err(ControlError::Config(format!(
            "create tap {}: {}",
            name,
            std::io::Error::last_os_error()
        )));
    }
    inherit_on_exec(tap.as_raw_fd())?;
    Ok(tap)
}

fn ip_link(args: &[&str]) -> Result<(), ControlError> {
    let status = Command::new("ip")
        .arg("link")
        .args(args)
        .status()
        .map_err(|e| ControlError::Config(format!("run ip link: {}", e)))?;
    if !status.success() {
        return Err(ControlError::Config(format!(
            "ip link {} failed: {}",
            args.join(" "),
            status
        )));
    }
    Ok(())
}

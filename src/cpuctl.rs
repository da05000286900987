//! # cpuctl Backend
//!
//! FreeBSD offers MSR and CPUID access through the `cpuctl(4)` driver,
//! one `/dev/cpuctlN` node per logical CPU, and PCI configuration
//! space through `pci(4)` on `/dev/pci`. Both are driven with ioctl
//! requests that carry the address and receive or supply the value.

use std::io;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use fs_err::{File, OpenOptions};
use libc::{c_int, c_ulong};

use crate::access::{pci_address, HardwareAccess, Transfer};
use crate::cpuid::{CpuidQuery, CpuidResult};
use crate::error::{Error, Resource, Result};

const IOC_INOUT: c_ulong = 0x4000_0000 | 0x8000_0000;
const IOCPARM_MASK: c_ulong = 0x1fff;

/// `_IOWR(group, num, type)` from `<sys/ioccom.h>`.
const fn iowr(group: u8, num: u8, len: usize) -> c_ulong {
    IOC_INOUT | ((len as c_ulong & IOCPARM_MASK) << 16) | ((group as c_ulong) << 8) | num as c_ulong
}

/// `cpuctl_msr_args_t`
#[repr(C)]
#[derive(Debug, Default)]
struct MsrArgs {
    msr: c_int,
    data: u64,
}

/// `cpuctl_cpuid_args_t`
#[repr(C)]
#[derive(Debug, Default)]
struct CpuidArgs {
    level: c_int,
    data: [u32; 4],
}

/// `cpuctl_cpuid_count_args_t`
#[repr(C)]
#[derive(Debug, Default)]
struct CpuidCountArgs {
    level: c_int,
    level_type: c_int,
    data: [u32; 4],
}

/// `struct pcisel`
#[repr(C)]
#[derive(Debug, Default)]
struct PciSel {
    domain: u32,
    bus: u8,
    dev: u8,
    func: u8,
}

/// `struct pci_io`
#[repr(C)]
#[derive(Debug, Default)]
struct PciIo {
    sel: PciSel,
    reg: c_int,
    width: c_int,
    data: u32,
}

const CPUCTL_RDMSR: c_ulong = iowr(b'c', 0x1, size_of::<MsrArgs>());
const CPUCTL_WRMSR: c_ulong = iowr(b'c', 0x2, size_of::<MsrArgs>());
const CPUCTL_CPUID: c_ulong = iowr(b'c', 0x3, size_of::<CpuidArgs>());
const CPUCTL_CPUID_COUNT: c_ulong = iowr(b'c', 0x7, size_of::<CpuidCountArgs>());
const PCIOCREAD: c_ulong = iowr(b'p', 0x2, size_of::<PciIo>());
const PCIOCWRITE: c_ulong = iowr(b'p', 0x3, size_of::<PciIo>());

/// Access through FreeBSD `cpuctl(4)` and `pci(4)` ioctls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpuctl {
    /// Prefix of the per-CPU nodes. The CPU id is appended directly.
    cpuctl_prefix: String,
    pci_device: PathBuf,
}

impl Default for Cpuctl {
    fn default() -> Self {
        Self {
            cpuctl_prefix: "/dev/cpuctl".to_owned(),
            pci_device: PathBuf::from("/dev/pci"),
        }
    }
}

/// Issue one ioctl request on `file`.
fn ioctl<T>(file: &File, request: c_ulong, args: &mut T) -> io::Result<()> {
    // SAFETY: `args` is a live `repr(C)` argument block whose size is
    // encoded in `request`, and the descriptor stays open for the call.
    let ret = unsafe { libc::ioctl(file.file().as_raw_fd(), request, args as *mut T) };

    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Cpuctl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `prefix` instead of `/dev/cpuctl` for the per-CPU nodes.
    pub fn with_cpuctl_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cpuctl_prefix = prefix.into();
        self
    }

    /// Use `path` instead of `/dev/pci`.
    pub fn with_pci_device(mut self, path: impl Into<PathBuf>) -> Self {
        self.pci_device = path.into();
        self
    }

    pub fn cpuctl_path(&self, cpu: u32) -> PathBuf {
        PathBuf::from(format!("{}{}", self.cpuctl_prefix, cpu))
    }

    pub fn pci_path(&self) -> &Path {
        &self.pci_device
    }

    fn open(resource: Resource, path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::ResourceUnavailable {
                resource,
                path: path.to_owned(),
                source,
            })
    }

    /// Open `path`, issue `request` and close again. A refused request
    /// fails the operation.
    fn request<T>(resource: Resource, path: &Path, name: &'static str, request: c_ulong, args: &mut T) -> Result<()> {
        let file = Self::open(resource, path)?;

        ioctl(&file, request, args).map_err(|source| Error::RequestFailed {
            resource,
            request: name,
            path: path.to_owned(),
            source,
        })
    }

    fn pci_io(device: u32, function: u32, reg: u32) -> Result<PciIo> {
        let (dev, func, reg) = pci_address(device, function, reg)?;

        Ok(PciIo {
            sel: PciSel {
                domain: 0,
                bus: 0,
                dev,
                func,
            },
            reg: reg.into(),
            width: size_of::<u32>() as c_int,
            data: 0,
        })
    }
}

/// Reinterpret a 32-bit register selector as the `int` the kernel
/// expects. Indices such as `0xC001_0015` become negative here and the
/// driver casts them back to `u_int`.
fn selector(index: u32) -> c_int {
    c_int::from_ne_bytes(index.to_ne_bytes())
}

impl HardwareAccess for Cpuctl {
    fn read_pci(&self, device: u32, function: u32, reg: u32) -> Result<u32> {
        let mut io = Self::pci_io(device, function, reg)?;
        Self::request(Resource::Pci, &self.pci_device, "PCIOCREAD", PCIOCREAD, &mut io)?;

        debug!("pci 0:{:x}.{:x}+{:#x}: {:#010x}", device, function, reg, io.data);
        Ok(io.data)
    }

    fn write_pci(&self, device: u32, function: u32, reg: u32, value: u32) -> Result<Transfer> {
        let mut io = Self::pci_io(device, function, reg)?;
        io.data = value;

        debug!("pci 0:{:x}.{:x}+{:#x} <- {:#010x}", device, function, reg, value);
        Self::request(Resource::Pci, &self.pci_device, "PCIOCWRITE", PCIOCWRITE, &mut io)?;

        Ok(Transfer::Complete)
    }

    fn read_msr_on(&self, cpu: u32, index: u32) -> Result<u64> {
        let mut args = MsrArgs {
            msr: selector(index),
            data: 0,
        };
        Self::request(Resource::Msr, &self.cpuctl_path(cpu), "CPUCTL_RDMSR", CPUCTL_RDMSR, &mut args)?;

        debug!("rdmsr {:#x} on cpu {}: {:#018x}", index, cpu, args.data);
        Ok(args.data)
    }

    fn write_msr_on(&self, cpu: u32, index: u32, value: u64) -> Result<Transfer> {
        let path = self.cpuctl_path(cpu);
        let file = Self::open(Resource::Msr, &path)?;
        let mut args = MsrArgs {
            msr: selector(index),
            data: value,
        };

        debug!("wrmsr {:#x} on cpu {}: {:#018x}", index, cpu, value);
        match ioctl(&file, CPUCTL_WRMSR, &mut args) {
            Ok(()) => Ok(Transfer::Complete),
            Err(e) => {
                warn!("ioctl(CPUCTL_WRMSR) on {}: {}", path.display(), e);
                Ok(Transfer::Incomplete {
                    transferred: 0,
                    expected: size_of::<u64>(),
                })
            }
        }
    }

    fn cpuid_on(&self, cpu: u32, query: CpuidQuery) -> Result<CpuidResult> {
        let path = self.cpuctl_path(cpu);

        let data = if query.subleaf == 0 {
            let mut args = CpuidArgs {
                level: selector(query.leaf),
                ..CpuidArgs::default()
            };
            Self::request(Resource::Cpuid, &path, "CPUCTL_CPUID", CPUCTL_CPUID, &mut args)?;
            args.data
        } else {
            let mut args = CpuidCountArgs {
                level: selector(query.leaf),
                level_type: selector(query.subleaf),
                ..CpuidCountArgs::default()
            };
            Self::request(Resource::Cpuid, &path, "CPUCTL_CPUID_COUNT", CPUCTL_CPUID_COUNT, &mut args)?;
            args.data
        };

        let result = CpuidResult::from(data);
        debug!(
            "cpuid {:#x}/{:#x} on cpu {}: {:08x}-{:08x}-{:08x}-{:08x}",
            query.leaf, query.subleaf, cpu, result.eax, result.ebx, result.ecx, result.edx
        );
        Ok(result)
    }

    fn probe_msr(&self, cpu: u32) -> Result<()> {
        Self::open(Resource::Msr, &self.cpuctl_path(cpu)).map(drop)
    }
}

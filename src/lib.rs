//! # hwaccess
//!
//! Read and write x86 Model-Specific Registers, execute CPUID and
//! access PCI configuration space from user space, through the device
//! interfaces the host kernel provides:
//!
//! - Linux: `/dev/cpu/N/msr`, `/dev/cpu/N/cpuid` and
//!   `/proc/bus/pci` ([DeviceFiles]),
//! - FreeBSD: `cpuctl(4)` and `pci(4)` ioctls (`Cpuctl`).
//!
//! All backends implement [HardwareAccess]. Code that decides which
//! registers to touch should depend on that trait only, so it can run
//! against [native] hardware, a [SimulatedHost] or a replayed
//! [AidaCpuidDump].
//!
//! Register values are passed through unchanged and never cached.
//! PCI addresses are checked against the limits of bus 0 before any
//! device is opened. Concurrent broadcast writes to the same MSR are
//! not serialized.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod access;
pub mod cpuid;
pub mod error;
pub mod replay;
pub mod simulated;
pub mod topology;

#[cfg(target_os = "freebsd")]
pub mod cpuctl;
#[cfg(unix)]
pub mod devfs;

pub use access::{BroadcastReport, HardwareAccess, Transfer};
pub use cpuid::{CpuidQuery, CpuidRegister, CpuidResult};
pub use error::{Error, Resource, Result};
pub use replay::AidaCpuidDump;
pub use simulated::SimulatedHost;

#[cfg(target_os = "freebsd")]
pub use cpuctl::Cpuctl;
#[cfg(unix)]
pub use devfs::DeviceFiles;

/// The backend for the operating system this crate is compiled for.
#[cfg(target_os = "linux")]
pub type Native = DeviceFiles;

/// The backend for the operating system this crate is compiled for.
#[cfg(target_os = "freebsd")]
pub type Native = Cpuctl;

/// Access the hardware of this host with the default device paths.
#[cfg(any(target_os = "linux", target_os = "freebsd"))]
pub fn native() -> Native {
    Native::default()
}

use std::{fmt, io, path::PathBuf};

use crate::access::BroadcastReport;

/// The classes of hardware state this crate gives access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Pci,
    Msr,
    Cpuid,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Resource::Pci => "pci",
            Resource::Msr => "msr",
            Resource::Cpuid => "cpuid",
        })
    }
}

/// Failures that abort a hardware operation.
///
/// Writes that move fewer bytes than requested are not errors. They
/// are reported as [crate::Transfer::Incomplete] instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device or pseudo-file could not be opened. Usually this
    /// means missing privileges or a kernel without the driver.
    #[error("failed to open {resource} device {}", .path.display())]
    ResourceUnavailable {
        resource: Resource,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ioctl({request}) on {} failed", .path.display())]
    RequestFailed {
        resource: Resource,
        request: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read from {resource} device {} failed", .path.display())]
    ReadFailed {
        resource: Resource,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read of {resource} device {} returned {transferred} of {expected} bytes", .path.display())]
    IncompleteRead {
        resource: Resource,
        path: PathBuf,
        transferred: usize,
        expected: usize,
    },

    #[error("unsupported hardware: {reason}")]
    UnsupportedHardware { reason: String },

    #[error("{resource} state cannot be written on this backend")]
    ReadOnly { resource: Resource },

    #[error("no recorded {resource} value for {what}")]
    NotRecorded { resource: Resource, what: String },

    /// Bus 0 has 32 devices of 8 functions, each with 4 KiB of
    /// configuration space.
    #[error("pci register 00:{device:02x}.{function:x}+{reg:#x} is out of range")]
    InvalidPciAddress { device: u32, function: u32, reg: u32 },

    /// A broadcast MSR write failed on `cpu` after earlier CPUs were
    /// already written. `completed` holds the transfers of those CPUs.
    #[error("broadcast write of msr {index:#x} stopped at cpu {cpu}", index = .completed.index)]
    BroadcastInterrupted {
        cpu: u32,
        completed: BroadcastReport,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The kind of hardware state the failed operation addressed, if
    /// any.
    pub fn resource(&self) -> Option<Resource> {
        match self {
            Error::ResourceUnavailable { resource, .. }
            | Error::RequestFailed { resource, .. }
            | Error::ReadFailed { resource, .. }
            | Error::IncompleteRead { resource, .. }
            | Error::ReadOnly { resource }
            | Error::NotRecorded { resource, .. } => Some(*resource),
            Error::InvalidPciAddress { .. } => Some(Resource::Pci),
            Error::BroadcastInterrupted { .. } => Some(Resource::Msr),
            Error::UnsupportedHardware { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

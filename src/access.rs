//! # Hardware Access Capability
//!
//! [HardwareAccess] is the one interface every backend implements. It
//! has a small set of per-backend primitives that address a single
//! logical CPU or PCI function. The CPU-0 shorthands, the broadcast
//! MSR write and the identification helpers are built on top of them
//! and behave identically for every backend.
//!
//! Every primitive acquires its kernel resource for exactly one
//! transfer and releases it before returning. Nothing is cached
//! between calls.

use std::convert::TryFrom;

use crate::cpuid::{dwords_to_bytes, CpuidQuery, CpuidResult, LEAF_BRAND_STRING, LEAF_EXTENDED_MAX, LEAF_VENDOR};
use crate::error::{Error, Result};
use crate::topology;

/// How much of a write reached the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Complete,

    /// The write moved fewer bytes than the value width or the request
    /// was refused after the resource was opened. The value was not
    /// rewritten.
    Incomplete { transferred: usize, expected: usize },
}

impl Transfer {
    /// Classify a positioned write of `expected` bytes.
    pub fn from_count(transferred: usize, expected: usize) -> Self {
        if transferred == expected {
            Transfer::Complete
        } else {
            Transfer::Incomplete {
                transferred,
                expected,
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        *self == Transfer::Complete
    }
}

/// The outcome of a broadcast MSR write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub index: u32,
    pub value: u64,

    /// One entry per logical CPU, in CPU id order.
    pub transfers: Vec<Transfer>,
}

impl BroadcastReport {
    pub fn cpu_count(&self) -> u32 {
        self.transfers.len() as u32
    }

    /// CPU ids whose write did not complete.
    pub fn incomplete_cpus(&self) -> impl Iterator<Item = u32> + '_ {
        self.transfers
            .iter()
            .enumerate()
            .filter(|(_, transfer)| !transfer.is_complete())
            .map(|(cpu, _)| cpu as u32)
    }

    pub fn is_complete(&self) -> bool {
        self.transfers.iter().all(Transfer::is_complete)
    }
}

/// Narrow a bus 0 PCI address to device, function and register offset.
///
/// Registers are 32 bits wide, so the last valid offset is `0xffc`.
pub(crate) fn pci_address(device: u32, function: u32, reg: u32) -> Result<(u8, u8, u16)> {
    let invalid = || Error::InvalidPciAddress {
        device,
        function,
        reg,
    };

    let dev = u8::try_from(device).ok().filter(|d| *d < 32).ok_or_else(invalid)?;
    let func = u8::try_from(function).ok().filter(|f| *f < 8).ok_or_else(invalid)?;
    let offset = u16::try_from(reg).ok().filter(|r| *r <= 0xffc).ok_or_else(invalid)?;

    Ok((dev, func, offset))
}

/// Read and write MSRs, CPUID and PCI configuration space.
///
/// PCI addressing is always bus 0 in domain 0.
pub trait HardwareAccess {
    /// Read the 32-bit register at `reg` of PCI function
    /// `device`.`function`.
    fn read_pci(&self, device: u32, function: u32, reg: u32) -> Result<u32>;

    /// Write the 32-bit register at `reg` of PCI function
    /// `device`.`function`.
    fn write_pci(&self, device: u32, function: u32, reg: u32, value: u32) -> Result<Transfer>;

    /// Read MSR `index` on logical CPU `cpu`.
    fn read_msr_on(&self, cpu: u32, index: u32) -> Result<u64>;

    /// Write MSR `index` on logical CPU `cpu` only.
    fn write_msr_on(&self, cpu: u32, index: u32, value: u64) -> Result<Transfer>;

    /// Execute `cpuid` on logical CPU `cpu`.
    fn cpuid_on(&self, cpu: u32, query: CpuidQuery) -> Result<CpuidResult>;

    /// Check that the MSR resource of `cpu` can be opened for writing.
    ///
    /// The resource is released again before returning and no data is
    /// transferred.
    fn probe_msr(&self, _cpu: u32) -> Result<()> {
        Ok(())
    }

    /// Read MSR `index` on logical CPU 0.
    fn read_msr(&self, index: u32) -> Result<u64> {
        self.read_msr_on(0, index)
    }

    /// Execute `cpuid` on logical CPU 0.
    fn cpuid(&self, query: CpuidQuery) -> Result<CpuidResult> {
        self.cpuid_on(0, query)
    }

    /// The number of logical CPUs. See [topology::cpu_count].
    fn cpu_count(&self) -> Result<u32> {
        topology::cpu_count(self)
    }

    /// Write MSR `index` on every logical CPU.
    ///
    /// The CPU count is queried on every call. All per-CPU resources
    /// are probed before the first write, so an unavailable device
    /// leaves every CPU untouched. Incomplete writes are recorded in
    /// the report, but neither retried nor treated as errors.
    ///
    /// If a write still fails after the probes passed, the loop stops
    /// and [Error::BroadcastInterrupted] carries the transfers of the
    /// CPUs before it.
    fn write_msr(&self, index: u32, value: u64) -> Result<BroadcastReport> {
        let count = self.cpu_count()?;

        for cpu in 0..count {
            trace!("probing msr device of cpu {}", cpu);
            self.probe_msr(cpu)?;
        }

        let mut report = BroadcastReport {
            index,
            value,
            transfers: Vec::with_capacity(count as usize),
        };
        for cpu in 0..count {
            match self.write_msr_on(cpu, index, value) {
                Ok(transfer) => report.transfers.push(transfer),
                Err(source) => {
                    return Err(Error::BroadcastInterrupted {
                        cpu,
                        completed: report,
                        source: Box::new(source),
                    })
                }
            }
        }

        Ok(report)
    }

    /// The maximum supported standard (`0x0000_xxxx`) CPUID leaf.
    fn max_standard_leaf(&self) -> Result<u32> {
        Ok(self.cpuid(LEAF_VENDOR.into())?.eax)
    }

    /// The maximum supported extended (`0x8000_xxxx`) CPUID leaf.
    fn max_extended_leaf(&self) -> Result<u32> {
        Ok(self.cpuid(LEAF_EXTENDED_MAX.into())?.eax)
    }

    /// Returns the vendor name as string.
    ///
    /// This uses lossy conversion to UTF-8 in case the string is not
    /// valid UTF-8.
    fn vendor_name(&self) -> Result<String> {
        let r = self.cpuid(LEAF_VENDOR.into())?;
        let bytes = dwords_to_bytes(&[r.ebx, r.edx, r.ecx]);

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Returns the model name, or [None] if the CPU has no brand
    /// string leaves.
    fn model_name(&self) -> Result<Option<String>> {
        if self.max_extended_leaf()? < LEAF_BRAND_STRING + 2 {
            return Ok(None);
        }

        let mut dwords = Vec::with_capacity(12);
        for leaf in LEAF_BRAND_STRING..=LEAF_BRAND_STRING + 2 {
            let r = self.cpuid(leaf.into())?;
            dwords.extend_from_slice(&[r.eax, r.ebx, r.ecx, r.edx]);
        }

        let bytes = dwords_to_bytes(&dwords);
        Ok(Some(String::from_utf8_lossy(&bytes).trim().to_owned()))
    }
}

impl<T: HardwareAccess + ?Sized> HardwareAccess for &T {
    fn read_pci(&self, device: u32, function: u32, reg: u32) -> Result<u32> {
        (**self).read_pci(device, function, reg)
    }

    fn write_pci(&self, device: u32, function: u32, reg: u32, value: u32) -> Result<Transfer> {
        (**self).write_pci(device, function, reg, value)
    }

    fn read_msr_on(&self, cpu: u32, index: u32) -> Result<u64> {
        (**self).read_msr_on(cpu, index)
    }

    fn write_msr_on(&self, cpu: u32, index: u32, value: u64) -> Result<Transfer> {
        (**self).write_msr_on(cpu, index, value)
    }

    fn cpuid_on(&self, cpu: u32, query: CpuidQuery) -> Result<CpuidResult> {
        (**self).cpuid_on(cpu, query)
    }

    fn probe_msr(&self, cpu: u32) -> Result<()> {
        (**self).probe_msr(cpu)
    }
}

impl<T: HardwareAccess + ?Sized> HardwareAccess for Box<T> {
    fn read_pci(&self, device: u32, function: u32, reg: u32) -> Result<u32> {
        (**self).read_pci(device, function, reg)
    }

    fn write_pci(&self, device: u32, function: u32, reg: u32, value: u32) -> Result<Transfer> {
        (**self).write_pci(device, function, reg, value)
    }

    fn read_msr_on(&self, cpu: u32, index: u32) -> Result<u64> {
        (**self).read_msr_on(cpu, index)
    }

    fn write_msr_on(&self, cpu: u32, index: u32, value: u64) -> Result<Transfer> {
        (**self).write_msr_on(cpu, index, value)
    }

    fn cpuid_on(&self, cpu: u32, query: CpuidQuery) -> Result<CpuidResult> {
        (**self).cpuid_on(cpu, query)
    }

    fn probe_msr(&self, cpu: u32) -> Result<()> {
        (**self).probe_msr(cpu)
    }
}

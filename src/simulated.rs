//! # Simulated Host
//!
//! An in-memory stand-in for a multi-CPU machine. It keeps CPUID
//! tables and MSR values per logical CPU plus a flat PCI configuration
//! space, and records every data transfer in a transaction log. Faults
//! can be injected to exercise the error paths of code built on
//! [HardwareAccess].

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::access::{pci_address, HardwareAccess, Transfer};
use crate::cpuid::{
    CpuidQuery, CpuidResult, LEAF_ADDRESS_SIZES, LEAF_BRAND_STRING, LEAF_EXTENDED_MAX, LEAF_VENDOR,
};
use crate::error::{Error, Resource, Result};

/// One data transfer performed against a [SimulatedHost].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    ReadPci {
        device: u32,
        function: u32,
        reg: u32,
    },
    WritePci {
        device: u32,
        function: u32,
        reg: u32,
        value: u32,
    },
    ReadMsr {
        cpu: u32,
        index: u32,
    },
    WriteMsr {
        cpu: u32,
        index: u32,
        value: u64,
    },
    Cpuid {
        cpu: u32,
        query: CpuidQuery,
    },
}

impl Transaction {
    /// The logical CPU addressed, or [None] for PCI transfers.
    pub fn cpu(&self) -> Option<u32> {
        match self {
            Transaction::ReadMsr { cpu, .. }
            | Transaction::WriteMsr { cpu, .. }
            | Transaction::Cpuid { cpu, .. } => Some(*cpu),
            Transaction::ReadPci { .. } | Transaction::WritePci { .. } => None,
        }
    }

    pub fn cpuid_query(&self) -> Option<CpuidQuery> {
        match self {
            Transaction::Cpuid { query, .. } => Some(*query),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    cpuid: HashMap<(u32, CpuidQuery), CpuidResult>,
    msrs: HashMap<(u32, u32), u64>,
    pci: HashMap<(u32, u32, u32), u32>,

    /// Resources that fail to open. A CPU of [None] fails every CPU.
    unavailable: HashSet<(Resource, Option<u32>)>,

    /// CPUs whose MSR device can be acquired by `probe_msr` but fails
    /// to open for the write that follows.
    vanishing_msrs: HashSet<u32>,

    /// CPUs whose MSR writes stop after the given number of bytes.
    short_writes: HashMap<u32, usize>,

    log: Vec<Transaction>,
}

/// A simulated host with a fixed number of logical CPUs.
#[derive(Debug)]
pub struct SimulatedHost {
    cpus: u32,
    state: Mutex<State>,
}

/// Splits a 48-byte brand string into the twelve CPUID registers.
fn brand_string_dwords(brand: &str) -> [u32; 12] {
    let mut bytes = [0u8; 48];
    for (dst, src) in bytes.iter_mut().zip(brand.bytes().take(47)) {
        *dst = src;
    }

    let mut dwords = [0u32; 12];
    for (dw, chunk) in dwords.iter_mut().zip(bytes.chunks_exact(4)) {
        *dw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    dwords
}

impl SimulatedHost {
    /// A host with `cpus` logical CPUs and empty CPUID tables.
    ///
    /// Unknown CPUID leaves, MSRs and PCI registers read as zero.
    pub fn new(cpus: u32) -> Self {
        assert!(cpus >= 1, "a host has at least one logical CPU");

        Self {
            cpus,
            state: Mutex::new(State::default()),
        }
    }

    /// A host that identifies as an AMD processor and reports `cpus`
    /// logical CPUs in the address sizes leaf.
    pub fn amd(cpus: u32) -> Self {
        assert!(cpus <= 256, "the address sizes leaf encodes at most 256 CPUs");

        let host = Self::new(cpus);

        // "AuthenticAMD"
        host.set_cpuid_all(
            LEAF_VENDOR.into(),
            CpuidResult {
                eax: 0x10,
                ebx: 0x6874_7541,
                ecx: 0x444D_4163,
                edx: 0x6974_6E65,
            },
        );
        host.set_cpuid_all(
            LEAF_EXTENDED_MAX.into(),
            CpuidResult {
                eax: LEAF_ADDRESS_SIZES,
                ..CpuidResult::default()
            },
        );

        let brand = brand_string_dwords("AMD Simulated Processor");
        for (leaf, regs) in (LEAF_BRAND_STRING..).zip(brand.chunks_exact(4)) {
            host.set_cpuid_all(leaf.into(), CpuidResult::from([regs[0], regs[1], regs[2], regs[3]]));
        }

        host.set_cpuid_all(
            LEAF_ADDRESS_SIZES.into(),
            CpuidResult {
                eax: 0x0000_3030,
                ecx: cpus - 1,
                ..CpuidResult::default()
            },
        );

        host
    }

    pub fn cpus(&self) -> u32 {
        self.cpus
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the log from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_cpuid(&self, cpu: u32, query: CpuidQuery, result: CpuidResult) {
        self.state().cpuid.insert((cpu, query), result);
    }

    /// Set the same CPUID answer on every logical CPU.
    pub fn set_cpuid_all(&self, query: CpuidQuery, result: CpuidResult) {
        let mut state = self.state();
        for cpu in 0..self.cpus {
            state.cpuid.insert((cpu, query), result);
        }
    }

    pub fn set_msr(&self, cpu: u32, index: u32, value: u64) {
        self.state().msrs.insert((cpu, index), value);
    }

    /// The current value of an MSR, without recording a transaction.
    pub fn msr(&self, cpu: u32, index: u32) -> Option<u64> {
        self.state().msrs.get(&(cpu, index)).copied()
    }

    pub fn set_pci(&self, device: u32, function: u32, reg: u32, value: u32) {
        self.state().pci.insert((device, function, reg), value);
    }

    /// The current value of a PCI register, without recording a
    /// transaction.
    pub fn pci(&self, device: u32, function: u32, reg: u32) -> Option<u32> {
        self.state().pci.get(&(device, function, reg)).copied()
    }

    /// Make every device of `resource` fail to open.
    pub fn fail_open(&self, resource: Resource) {
        self.state().unavailable.insert((resource, None));
    }

    /// Make the `resource` device of one logical CPU fail to open.
    pub fn fail_open_on(&self, resource: Resource, cpu: u32) {
        self.state().unavailable.insert((resource, Some(cpu)));
    }

    /// Let the MSR device of `cpu` disappear right before it is written.
    pub fn vanish_msr_before_write(&self, cpu: u32) {
        self.state().vanishing_msrs.insert(cpu);
    }

    /// Make MSR writes on `cpu` stop after `transferred` bytes.
    pub fn short_writes_on(&self, cpu: u32, transferred: usize) {
        self.state().short_writes.insert(cpu, transferred);
    }

    /// All transfers performed so far, oldest first.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.state().log.clone()
    }

    pub fn clear_transactions(&self) {
        self.state().log.clear();
    }

    /// Acquire the simulated device of `resource` for `cpu`.
    fn open(&self, state: &State, resource: Resource, cpu: Option<u32>, path: PathBuf) -> Result<()> {
        let missing = cpu.map_or(false, |cpu| cpu >= self.cpus);
        let refused = state.unavailable.contains(&(resource, None))
            || state.unavailable.contains(&(resource, cpu));

        if missing {
            Err(Error::ResourceUnavailable {
                resource,
                path,
                source: io::Error::new(io::ErrorKind::NotFound, "no such logical CPU"),
            })
        } else if refused {
            Err(Error::ResourceUnavailable {
                resource,
                path,
                source: io::Error::new(io::ErrorKind::PermissionDenied, "injected open failure"),
            })
        } else {
            Ok(())
        }
    }

    fn cpu_path(cpu: u32, resource: Resource) -> PathBuf {
        PathBuf::from(format!("/sim/cpu/{}/{}", cpu, resource))
    }

    fn pci_path(device: u32, function: u32) -> PathBuf {
        PathBuf::from(format!("/sim/pci/00/{:02x}.{:x}", device, function))
    }
}

impl HardwareAccess for SimulatedHost {
    fn read_pci(&self, device: u32, function: u32, reg: u32) -> Result<u32> {
        pci_address(device, function, reg)?;
        let mut state = self.state();
        self.open(&state, Resource::Pci, None, Self::pci_path(device, function))?;

        state.log.push(Transaction::ReadPci {
            device,
            function,
            reg,
        });
        Ok(state.pci.get(&(device, function, reg)).copied().unwrap_or(0))
    }

    fn write_pci(&self, device: u32, function: u32, reg: u32, value: u32) -> Result<Transfer> {
        pci_address(device, function, reg)?;
        let mut state = self.state();
        self.open(&state, Resource::Pci, None, Self::pci_path(device, function))?;

        state.log.push(Transaction::WritePci {
            device,
            function,
            reg,
            value,
        });
        state.pci.insert((device, function, reg), value);
        Ok(Transfer::Complete)
    }

    fn read_msr_on(&self, cpu: u32, index: u32) -> Result<u64> {
        let mut state = self.state();
        self.open(&state, Resource::Msr, Some(cpu), Self::cpu_path(cpu, Resource::Msr))?;

        state.log.push(Transaction::ReadMsr { cpu, index });
        Ok(state.msrs.get(&(cpu, index)).copied().unwrap_or(0))
    }

    fn write_msr_on(&self, cpu: u32, index: u32, value: u64) -> Result<Transfer> {
        let mut state = self.state();
        let path = Self::cpu_path(cpu, Resource::Msr);
        self.open(&state, Resource::Msr, Some(cpu), path.clone())?;
        if state.vanishing_msrs.contains(&cpu) {
            return Err(Error::ResourceUnavailable {
                resource: Resource::Msr,
                path,
                source: io::Error::new(io::ErrorKind::NotFound, "device removed"),
            });
        }

        state.log.push(Transaction::WriteMsr { cpu, index, value });

        let expected = std::mem::size_of::<u64>();
        let transferred = state.short_writes.get(&cpu).copied().unwrap_or(expected);
        let transfer = Transfer::from_count(transferred, expected);
        if transfer.is_complete() {
            state.msrs.insert((cpu, index), value);
        } else {
            warn!("short write of msr {:#x} on cpu {}: {} of {} bytes", index, cpu, transferred, expected);
        }

        Ok(transfer)
    }

    fn cpuid_on(&self, cpu: u32, query: CpuidQuery) -> Result<CpuidResult> {
        let mut state = self.state();
        self.open(&state, Resource::Cpuid, Some(cpu), Self::cpu_path(cpu, Resource::Cpuid))?;

        state.log.push(Transaction::Cpuid { cpu, query });
        Ok(state.cpuid.get(&(cpu, query)).copied().unwrap_or_default())
    }

    fn probe_msr(&self, cpu: u32) -> Result<()> {
        let state = self.state();
        self.open(&state, Resource::Msr, Some(cpu), Self::cpu_path(cpu, Resource::Msr))
    }
}

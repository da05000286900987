//! # Device File Backend
//!
//! Linux exposes MSRs and CPUID through the `msr` and `cpuid` drivers
//! as `/dev/cpu/N/msr` and `/dev/cpu/N/cpuid`, and PCI configuration
//! space through procfs as `/proc/bus/pci/BB/DD.F`. All of them are
//! accessed with positioned reads and writes. The file offset selects
//! the MSR index, the CPUID leaf or the configuration register.
//!
//! Every operation opens the file it needs, performs one transfer and
//! closes it again.

use std::path::{Path, PathBuf};

use fs_err::os::unix::fs::FileExt;
use fs_err::{File, OpenOptions};

use crate::access::{pci_address, HardwareAccess, Transfer};
use crate::cpuid::{CpuidQuery, CpuidResult};
use crate::error::{Error, Resource, Result};

/// Only bus 0 of PCI domain 0 is addressed.
const PCI_BUS: u32 = 0;

/// Access through Linux device files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFiles {
    cpu_root: PathBuf,
    pci_root: PathBuf,
}

impl Default for DeviceFiles {
    fn default() -> Self {
        Self {
            cpu_root: PathBuf::from("/dev/cpu"),
            pci_root: PathBuf::from("/proc/bus/pci"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

impl DeviceFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `root` instead of `/dev/cpu` for the per-CPU device files.
    pub fn with_cpu_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cpu_root = root.into();
        self
    }

    /// Use `root` instead of `/proc/bus/pci` for PCI configuration
    /// space.
    pub fn with_pci_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.pci_root = root.into();
        self
    }

    pub fn msr_path(&self, cpu: u32) -> PathBuf {
        self.cpu_root.join(cpu.to_string()).join("msr")
    }

    pub fn cpuid_path(&self, cpu: u32) -> PathBuf {
        self.cpu_root.join(cpu.to_string()).join("cpuid")
    }

    pub fn pci_path(&self, device: u32, function: u32) -> PathBuf {
        self.pci_root
            .join(format!("{:02x}", PCI_BUS))
            .join(format!("{:02x}.{:x}", device, function))
    }

    fn open(resource: Resource, path: &Path, mode: Mode) -> Result<File> {
        OpenOptions::new()
            .read(mode == Mode::Read)
            .write(mode == Mode::Write)
            .open(path)
            .map_err(|source| Error::ResourceUnavailable {
                resource,
                path: path.to_owned(),
                source,
            })
    }

    /// Read exactly `N` bytes at `offset` or fail. Partial values are
    /// never handed out.
    fn read_at<const N: usize>(resource: Resource, path: &Path, offset: u64) -> Result<[u8; N]> {
        let file = Self::open(resource, path, Mode::Read)?;

        let mut buf = [0u8; N];
        let transferred = file
            .read_at(&mut buf, offset)
            .map_err(|source| Error::ReadFailed {
                resource,
                path: path.to_owned(),
                source,
            })?;

        if transferred != N {
            return Err(Error::IncompleteRead {
                resource,
                path: path.to_owned(),
                transferred,
                expected: N,
            });
        }

        Ok(buf)
    }

    /// Write `bytes` at `offset`. Failures after the open are logged
    /// once and reported in the returned [Transfer], never retried.
    fn write_at(resource: Resource, path: &Path, offset: u64, bytes: &[u8]) -> Result<Transfer> {
        let file = Self::open(resource, path, Mode::Write)?;

        let transferred = match file.write_at(bytes, offset) {
            Ok(n) if n == bytes.len() => return Ok(Transfer::Complete),
            Ok(n) => {
                warn!(
                    "short write to {} device {} at {:#x}: {} of {} bytes",
                    resource,
                    path.display(),
                    offset,
                    n,
                    bytes.len()
                );
                n
            }
            Err(e) => {
                warn!("failed to write to {} device {} at {:#x}: {}", resource, path.display(), offset, e);
                0
            }
        };

        Ok(Transfer::Incomplete {
            transferred,
            expected: bytes.len(),
        })
    }
}

impl HardwareAccess for DeviceFiles {
    fn read_pci(&self, device: u32, function: u32, reg: u32) -> Result<u32> {
        let (device, function, reg) = pci_address(device, function, reg)?;
        let path = self.pci_path(device.into(), function.into());
        let value = u32::from_ne_bytes(Self::read_at(Resource::Pci, &path, reg.into())?);

        debug!("read {}+{:#x}: {:#010x}", path.display(), reg, value);
        Ok(value)
    }

    fn write_pci(&self, device: u32, function: u32, reg: u32, value: u32) -> Result<Transfer> {
        let (device, function, reg) = pci_address(device, function, reg)?;
        let path = self.pci_path(device.into(), function.into());

        debug!("write {}+{:#x}: {:#010x}", path.display(), reg, value);
        Self::write_at(Resource::Pci, &path, reg.into(), &value.to_ne_bytes())
    }

    fn read_msr_on(&self, cpu: u32, index: u32) -> Result<u64> {
        let path = self.msr_path(cpu);
        let value = u64::from_ne_bytes(Self::read_at(Resource::Msr, &path, index.into())?);

        debug!("rdmsr {:#x} on cpu {}: {:#018x}", index, cpu, value);
        Ok(value)
    }

    fn write_msr_on(&self, cpu: u32, index: u32, value: u64) -> Result<Transfer> {
        debug!("wrmsr {:#x} on cpu {}: {:#018x}", index, cpu, value);
        Self::write_at(Resource::Msr, &self.msr_path(cpu), index.into(), &value.to_ne_bytes())
    }

    fn cpuid_on(&self, cpu: u32, query: CpuidQuery) -> Result<CpuidResult> {
        let path = self.cpuid_path(cpu);
        let bytes = Self::read_at(Resource::Cpuid, &path, query.file_offset())?;
        let result = CpuidResult::from_ne_bytes(bytes);

        debug!(
            "cpuid {:#x}/{:#x} on cpu {}: {:08x}-{:08x}-{:08x}-{:08x}",
            query.leaf, query.subleaf, cpu, result.eax, result.ebx, result.ecx, result.edx
        );
        Ok(result)
    }

    fn probe_msr(&self, cpu: u32) -> Result<()> {
        Self::open(Resource::Msr, &self.msr_path(cpu), Mode::Write).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuid::{LEAF_ADDRESS_SIZES, LEAF_EXTENDED_MAX, LEAF_VENDOR};
    use log::{Level, LevelFilter, Log, Metadata, Record};
    use std::cell::RefCell;
    use std::fs;
    use std::os::unix::fs::FileExt as _;
    use std::sync::Once;

    thread_local! {
        static RECORDS: RefCell<Vec<(Level, String)>> = RefCell::new(Vec::new());
    }

    /// Collects the log records of the calling test thread.
    struct CaptureLog;

    impl Log for CaptureLog {
        fn enabled(&self, _metadata: &Metadata) -> bool {
            true
        }

        fn log(&self, record: &Record) {
            RECORDS.with(|records| {
                records
                    .borrow_mut()
                    .push((record.level(), record.args().to_string()))
            });
        }

        fn flush(&self) {}
    }

    fn capture_log() {
        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            log::set_logger(&CaptureLog).expect("no other logger in tests");
            log::set_max_level(LevelFilter::Trace);
        });
        RECORDS.with(|records| records.borrow_mut().clear());
    }

    fn captured_warnings() -> Vec<String> {
        RECORDS.with(|records| {
            records
                .borrow()
                .iter()
                .filter(|(level, _)| *level == Level::Warn)
                .map(|(_, message)| message.clone())
                .collect()
        })
    }

    /// A directory tree standing in for `/dev/cpu` and `/proc/bus/pci`.
    struct FakeHost {
        root: PathBuf,
    }

    impl FakeHost {
        fn new(name: &str) -> Self {
            let root = std::env::temp_dir().join(format!("hwaccess-{}-{}", name, std::process::id()));
            let _ = fs::remove_dir_all(&root);
            fs::create_dir_all(root.join("cpu")).expect("create cpu root");
            fs::create_dir_all(root.join("pci/00")).expect("create pci root");

            Self { root }
        }

        /// An AMD host with `cpus` logical CPUs.
        fn amd(name: &str, cpus: u32) -> Self {
            let host = Self::new(name);
            for cpu in 0..cpus {
                host.add_cpu(cpu);
            }

            host.set_cpuid(
                0,
                LEAF_VENDOR.into(),
                CpuidResult::from([0x10, 0x6874_7541, 0x444D_4163, 0x6974_6E65]),
            );
            host.set_cpuid(0, LEAF_EXTENDED_MAX.into(), CpuidResult::from([LEAF_ADDRESS_SIZES, 0, 0, 0]));
            host.set_cpuid(0, LEAF_ADDRESS_SIZES.into(), CpuidResult::from([0x3030, 0, cpus - 1, 0]));
            host
        }

        fn add_cpu(&self, cpu: u32) {
            let dir = self.root.join("cpu").join(cpu.to_string());
            fs::create_dir_all(&dir).expect("create cpu dir");
            fs::write(dir.join("msr"), b"").expect("create msr file");
            fs::write(dir.join("cpuid"), b"").expect("create cpuid file");
        }

        fn set_cpuid(&self, cpu: u32, query: CpuidQuery, result: CpuidResult) {
            let path = self.root.join("cpu").join(cpu.to_string()).join("cpuid");
            let file = fs::OpenOptions::new().write(true).open(path).expect("open cpuid file");
            file.write_all_at(&result.to_ne_bytes(), query.file_offset())
                .expect("write cpuid entry");
        }

        fn add_pci_function(&self, device: u32, function: u32) {
            fs::write(
                self.root.join("pci/00").join(format!("{:02x}.{:x}", device, function)),
                b"",
            )
            .expect("create pci config file");
        }

        fn backend(&self) -> DeviceFiles {
            DeviceFiles::new()
                .with_cpu_root(self.root.join("cpu"))
                .with_pci_root(self.root.join("pci"))
        }
    }

    impl Drop for FakeHost {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn default_paths_match_linux() {
        let backend = DeviceFiles::default();

        assert_eq!(backend.msr_path(3), PathBuf::from("/dev/cpu/3/msr"));
        assert_eq!(backend.cpuid_path(0), PathBuf::from("/dev/cpu/0/cpuid"));
        assert_eq!(backend.pci_path(0x18, 3), PathBuf::from("/proc/bus/pci/00/18.3"));
        assert_eq!(backend.pci_path(2, 0), PathBuf::from("/proc/bus/pci/00/02.0"));
    }

    #[test]
    fn pci_write_then_read_returns_value() {
        let host = FakeHost::new("pci");
        host.add_pci_function(0x18, 3);
        let backend = host.backend();

        let transfer = backend.write_pci(0x18, 3, 0x160, 0xABCD_1234).expect("pci write");
        assert!(transfer.is_complete());
        assert_eq!(backend.read_pci(0x18, 3, 0x160).expect("pci read"), 0xABCD_1234);
    }

    #[test]
    fn missing_pci_function_is_unavailable() {
        let host = FakeHost::new("pci-missing");
        let backend = host.backend();

        match backend.read_pci(0x18, 4, 0x160) {
            Err(Error::ResourceUnavailable { resource, path, .. }) => {
                assert_eq!(resource, Resource::Pci);
                assert_eq!(path, backend.pci_path(0x18, 4));
            }
            other => panic!("expected unavailable resource, got {:?}", other),
        }
        assert!(backend.write_pci(0x18, 4, 0x160, 1).is_err());
        assert!(!backend.pci_path(0x18, 4).exists());
    }

    #[test]
    fn cpuid_reads_registers_in_order() {
        let host = FakeHost::amd("cpuid", 1);
        host.set_cpuid(0, CpuidQuery::new(4, 3), CpuidResult::from([0x1C03_C163, 0x03C0_003F, 0x3FFF, 6]));
        let backend = host.backend();

        assert_eq!(backend.vendor_name().expect("vendor"), "AuthenticAMD");
        assert_eq!(
            backend.cpuid(CpuidQuery::new(4, 3)).expect("cpuid"),
            CpuidResult {
                eax: 0x1C03_C163,
                ebx: 0x03C0_003F,
                ecx: 0x0000_3FFF,
                edx: 0x0000_0006,
            }
        );
    }

    #[test]
    fn truncated_reads_are_errors() {
        let host = FakeHost::amd("truncated", 1);
        let backend = host.backend();

        match backend.read_msr(0x10) {
            Err(Error::IncompleteRead {
                resource,
                transferred,
                expected,
                ..
            }) => {
                assert_eq!(resource, Resource::Msr);
                assert_eq!(transferred, 0);
                assert_eq!(expected, 8);
            }
            other => panic!("expected incomplete read, got {:?}", other),
        }
    }

    #[test]
    fn broadcast_reaches_every_cpu_file() {
        let host = FakeHost::amd("broadcast", 8);
        let backend = host.backend();

        assert_eq!(backend.cpu_count().expect("cpu count"), 8);

        let report = backend.write_msr(0x10, 0x1234).expect("broadcast");
        assert_eq!(report.cpu_count(), 8);
        assert!(report.is_complete());

        for cpu in 0..8 {
            assert_eq!(backend.read_msr_on(cpu, 0x10).expect("read back"), 0x1234);
        }
    }

    #[test]
    fn missing_cpu_file_stops_broadcast_before_writing() {
        let host = FakeHost::amd("broadcast-missing", 8);
        fs::remove_file(host.root.join("cpu/5/msr")).expect("remove msr file");
        let backend = host.backend();

        match backend.write_msr(0x10, 0x1234) {
            Err(Error::ResourceUnavailable { path, .. }) => assert_eq!(path, backend.msr_path(5)),
            other => panic!("expected unavailable resource, got {:?}", other),
        }
        for cpu in 0..5 {
            assert!(backend.read_msr_on(cpu, 0x10).is_err());
        }
    }

    #[test]
    fn single_target_write_leaves_other_cpus() {
        let host = FakeHost::amd("single", 2);
        let backend = host.backend();

        assert!(backend.write_msr_on(1, 0x20, 7).expect("write").is_complete());
        assert_eq!(backend.read_msr_on(1, 0x20).expect("read"), 7);
        assert!(backend.read_msr_on(0, 0x20).is_err());
    }

    #[test]
    fn out_of_range_pci_address_is_rejected() {
        let host = FakeHost::new("pci-range");
        host.add_pci_function(0x18, 0);
        let backend = host.backend();

        match backend.write_pci(0x118, 0, 0x60, 1) {
            Err(Error::InvalidPciAddress { device, .. }) => assert_eq!(device, 0x118),
            other => panic!("expected invalid address, got {:?}", other),
        }
        assert!(matches!(
            backend.read_pci(0x18, 0, 0x1000),
            Err(Error::InvalidPciAddress { .. })
        ));
        assert!(!backend.pci_path(0x118, 0).exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn refused_write_is_logged_once() {
        let host = FakeHost::amd("refused", 1);
        let msr = host.root.join("cpu/0/msr");
        fs::remove_file(&msr).expect("remove msr file");
        // Writes to /dev/full fail with ENOSPC after a successful open.
        std::os::unix::fs::symlink("/dev/full", &msr).expect("link msr file to /dev/full");
        let backend = host.backend();

        capture_log();
        let transfer = backend.write_msr_on(0, 0x10, 1).expect("device opens");

        assert_eq!(
            transfer,
            Transfer::Incomplete {
                transferred: 0,
                expected: 8
            }
        );
        let warnings = captured_warnings();
        assert_eq!(warnings.len(), 1, "{:?}", warnings);
        assert!(warnings[0].contains("cpu/0/msr"));
    }
}

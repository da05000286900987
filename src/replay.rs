//! # Replay AIDA CPUID Dumps
//!
//! Serve CPUID and MSR reads out of an AIDA64 CPUID dump instead of
//! live hardware. CPUID answers are kept per logical CPU. The dump
//! records MSRs only once, so every logical CPU reads the same MSR
//! values. Duplicated MSRs in the input are performance counters; the
//! last occurrence wins.
//!
//! A replayed host is read-only and has no PCI configuration space.
//!
//! See [AidaCpuidDump].

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use regex::{Captures, Regex};

use crate::access::{HardwareAccess, Transfer};
use crate::cpuid::{CpuidQuery, CpuidResult};
use crate::error::{Error, Resource, Result};

lazy_static! {
    static ref SECTION_RE: Regex = Regex::new(r"^-{6}\[ (?P<name>.+) \]-{6}$").expect("a valid regex");
    static ref LOGICAL_CPU_RE: Regex =
        Regex::new(r"^Logical CPU #(?P<cpu>[0-9]{1,9})$").expect("a valid regex");
    static ref CPUID_RE: Regex = Regex::new(concat!(
        r"^CPUID (?P<leaf>[[:xdigit:]]{1,8}): ",
        r"(?P<eax>[[:xdigit:]]{8})-(?P<ebx>[[:xdigit:]]{8})-(?P<ecx>[[:xdigit:]]{8})-(?P<edx>[[:xdigit:]]{8})",
        r"(?: \[SL (?P<subleaf>[[:xdigit:]]{1,8})\])?(?:\s.*)?$",
    ))
    .expect("a valid regex");
    static ref MSR_RE: Regex = Regex::new(
        r"^MSR (?P<index>[[:xdigit:]]{1,8}): (?P<value>(?:[[:xdigit:]]{4}-){3}[[:xdigit:]]{4})(?:\s.*)?$"
    )
    .expect("a valid regex");
}

/// CPUID answers per logical CPU and MSR values recorded by AIDA64.
#[derive(Debug, Clone, Default)]
pub struct AidaCpuidDump {
    pub cpuid: BTreeMap<u32, BTreeMap<CpuidQuery, CpuidResult>>,
    pub msrs: BTreeMap<u32, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DumpParseError {
    #[error("section {0:?} appears more than once")]
    DuplicateSection(String),

    #[error("no CPUID values for logical CPU #0")]
    NoCpuZero,
}

/// The lines of a dump that carry data. Everything else is skipped.
#[derive(Debug, Clone, PartialEq)]
enum Record {
    /// `------[ Logical CPU #0 ]------`
    Section(String),

    /// `CPUID 0000000D: 0000000F-00000348-00001800-00000000 [SL 01]`
    Cpuid(CpuidQuery, CpuidResult),

    /// `MSR C0010064: 8000-0000-4A36-0890 [P0]`
    Msr(u32, u64),
}

/// Where a data line is filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    LogicalCpu(u32),
    Msrs,
    Other,
}

impl Section {
    fn named(name: &str) -> Self {
        if name == "MSR Registers" {
            return Section::Msrs;
        }

        LOGICAL_CPU_RE
            .captures(name)
            .and_then(|caps| caps.name("cpu")?.as_str().parse().ok())
            .map_or(Section::Other, Section::LogicalCpu)
    }
}

fn hex_u32(digits: &str) -> Option<u32> {
    u32::from_str_radix(digits, 16).ok()
}

/// `FEE0-0900`-style groups of hex digits.
fn dashed_hex_u64(text: &str) -> Option<u64> {
    let digits: String = text.split('-').collect();
    u64::from_str_radix(&digits, 16).ok()
}

fn hex_field(caps: &Captures, name: &str) -> Option<u32> {
    hex_u32(caps.name(name)?.as_str())
}

fn classify(line: &str) -> Option<Record> {
    if let Some(caps) = SECTION_RE.captures(line) {
        return Some(Record::Section(caps.name("name")?.as_str().to_owned()));
    }

    if let Some(caps) = CPUID_RE.captures(line) {
        let subleaf = match caps.name("subleaf") {
            Some(m) => hex_u32(m.as_str())?,
            None => 0,
        };
        let query = CpuidQuery::new(hex_field(&caps, "leaf")?, subleaf);
        let result = CpuidResult {
            eax: hex_field(&caps, "eax")?,
            ebx: hex_field(&caps, "ebx")?,
            ecx: hex_field(&caps, "ecx")?,
            edx: hex_field(&caps, "edx")?,
        };
        return Some(Record::Cpuid(query, result));
    }

    let caps = MSR_RE.captures(line)?;
    Some(Record::Msr(
        hex_field(&caps, "index")?,
        dashed_hex_u64(caps.name("value")?.as_str())?,
    ))
}

impl FromStr for AidaCpuidDump {
    type Err = DumpParseError;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        let mut dump = AidaCpuidDump::default();
        let mut seen = BTreeSet::new();
        let mut section = Section::Preamble;

        for record in text.lines().filter_map(|line| classify(line.trim_end())) {
            match (record, section) {
                (Record::Section(name), _) => {
                    section = Section::named(&name);
                    if let Section::LogicalCpu(cpu) = section {
                        dump.cpuid.entry(cpu).or_default();
                    }
                    if !seen.insert(name.clone()) {
                        return Err(DumpParseError::DuplicateSection(name));
                    }
                }
                (Record::Cpuid(query, result), Section::LogicalCpu(cpu)) => {
                    dump.cpuid.entry(cpu).or_default().insert(query, result);
                }
                (Record::Msr(index, value), Section::Msrs) => {
                    dump.msrs.insert(index, value);
                }
                _ => {}
            }
        }

        if dump.cpuid.get(&0).map_or(true, BTreeMap::is_empty) {
            return Err(DumpParseError::NoCpuZero);
        }

        debug!(
            "replaying {} logical cpus and {} msrs",
            dump.cpuid.len(),
            dump.msrs.len()
        );
        Ok(dump)
    }
}

impl AidaCpuidDump {
    /// Logical CPUs present in the dump.
    pub fn logical_cpus(&self) -> impl Iterator<Item = u32> + '_ {
        self.cpuid.keys().copied()
    }

    fn cpu_table(&self, resource: Resource, cpu: u32) -> Result<&BTreeMap<CpuidQuery, CpuidResult>> {
        self.cpuid.get(&cpu).ok_or_else(|| Error::NotRecorded {
            resource,
            what: format!("logical CPU #{}", cpu),
        })
    }
}

impl HardwareAccess for AidaCpuidDump {
    fn read_pci(&self, device: u32, function: u32, reg: u32) -> Result<u32> {
        Err(Error::NotRecorded {
            resource: Resource::Pci,
            what: format!("0:{:x}.{:x}+{:#x}", device, function, reg),
        })
    }

    fn write_pci(&self, _device: u32, _function: u32, _reg: u32, _value: u32) -> Result<Transfer> {
        Err(Error::ReadOnly {
            resource: Resource::Pci,
        })
    }

    fn read_msr_on(&self, cpu: u32, index: u32) -> Result<u64> {
        self.cpu_table(Resource::Msr, cpu)?;

        self.msrs.get(&index).copied().ok_or_else(|| Error::NotRecorded {
            resource: Resource::Msr,
            what: format!("MSR {:#x}", index),
        })
    }

    fn write_msr_on(&self, _cpu: u32, _index: u32, _value: u64) -> Result<Transfer> {
        Err(Error::ReadOnly {
            resource: Resource::Msr,
        })
    }

    fn cpuid_on(&self, cpu: u32, query: CpuidQuery) -> Result<CpuidResult> {
        self.cpu_table(Resource::Cpuid, cpu)?
            .get(&query)
            .copied()
            .ok_or_else(|| Error::NotRecorded {
                resource: Resource::Cpuid,
                what: format!("leaf {:#x} subleaf {:#x} on logical CPU #{}", query.leaf, query.subleaf, cpu),
            })
    }

    fn probe_msr(&self, _cpu: u32) -> Result<()> {
        Err(Error::ReadOnly {
            resource: Resource::Msr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RYZEN_DUMP: &str = "
------[ Versions ]------

Program Version : AIDA64 Extreme v6.33.5700

------[ Logical CPU #0 ]------

allcpu: Package 0 / Core 0 / Thread 0: Valid

CPUID 00000000: 00000010-68747541-444D4163-69746E65 [AuthenticAMD]
CPUID 00000001: 00A20F10-00100800-7ED8320B-178BFBFF
CPUID 80000000: 80000023-68747541-444D4163-69746E65
CPUID 80000008: 00003030-111EF657-00000003-00010000

------[ Logical CPU #1 ]------

allcpu: Package 0 / Core 0 / Thread 1: Valid, Virtual

CPUID 00000001: 00A20F10-01100800-7ED8320B-178BFBFF
CPUID 0000000D: 00000207-00000988-00000988-00000000 [SL 00]
CPUID 0000000D: 0000000F-00000348-00001800-00000000 [SL 01]

------[ MSR Registers ]------

MSR C0010015: 0000-0000-4900-0011
MSR C0010064: 8000-0000-4A36-0890 [P0]
MSR 0000001B: 0000-0000-FEE0-0900
";

    #[test]
    fn data_lines_are_classified() {
        assert_eq!(
            classify("------[ Logical CPU #0 ]------"),
            Some(Record::Section("Logical CPU #0".to_owned()))
        );
        assert_eq!(
            classify("CPUID 00000004: 1C03C163-03C0003F-00003FFF-00000006 [SL 03]"),
            Some(Record::Cpuid(
                CpuidQuery::new(4, 3),
                CpuidResult::from([0x1C03_C163, 0x03C0_003F, 0x3FFF, 6])
            ))
        );
        assert_eq!(
            classify("CPUID 00000000: 00000010-68747541-444D4163-69746E65 [AuthenticAMD]"),
            Some(Record::Cpuid(
                0.into(),
                CpuidResult::from([0x10, 0x6874_7541, 0x444D_4163, 0x6974_6E65])
            ))
        );
        assert_eq!(
            classify("MSR 000001FC: 0000-0000-0030-1CC3"),
            Some(Record::Msr(0x1FC, 0x0030_1CC3))
        );
        assert_eq!(classify("MSR 00000300: < FAILED >"), None);
        assert_eq!(classify("allcpu: Package 0 / Core 0 / Thread 0: Valid"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn overlong_cpuid_leaf_is_skipped() {
        assert_eq!(
            classify("CPUID 100000000: 00000010-68747541-444D4163-69746E65"),
            None
        );

        let input = "------[ Logical CPU #0 ]------\n\
                     CPUID 00000000: 00000010-68747541-444D4163-69746E65\n\
                     CPUID 100000000: 00000001-00000002-00000003-00000004\n";
        let dump = AidaCpuidDump::from_str(input).expect("parse");
        assert_eq!(dump.cpuid[&0].len(), 1);
    }

    #[test]
    fn malformed_msr_values_are_skipped() {
        assert_eq!(classify("MSR 0000001B: -------------------"), None);
        assert_eq!(classify("MSR 0000001B: 0000-0000-FEE0-090"), None);
        assert_eq!(classify("MSR 1C0010015: 0000-0000-4900-0011"), None);
    }

    #[test]
    fn section_names_pick_the_target() {
        assert_eq!(Section::named("Logical CPU #13"), Section::LogicalCpu(13));
        assert_eq!(Section::named("MSR Registers"), Section::Msrs);
        assert_eq!(Section::named("Logical CPU #99999999999"), Section::Other);
        assert_eq!(Section::named("Versions"), Section::Other);
    }

    #[test]
    fn data_outside_its_section_is_ignored() {
        let input = "CPUID 00000001: 00A20F10-00100800-7ED8320B-178BFBFF\n\
                     ------[ Logical CPU #0 ]------\n\
                     CPUID 00000000: 00000010-68747541-444D4163-69746E65\n\
                     MSR 0000001B: 0000-0000-FEE0-0900\n\
                     ------[ Versions ]------\n\
                     CPUID 00000001: 00A20F10-00100800-7ED8320B-178BFBFF\n";
        let dump = AidaCpuidDump::from_str(input).expect("parse");

        assert_eq!(dump.cpuid[&0].keys().collect::<Vec<_>>(), vec![&CpuidQuery::from(0)]);
        assert!(dump.msrs.is_empty());
    }

    #[test]
    fn dump_is_parsed_per_cpu() {
        let dump = AidaCpuidDump::from_str(RYZEN_DUMP).expect("to be able to parse example input");

        assert_eq!(dump.logical_cpus().collect::<Vec<u32>>(), vec![0, 1]);
        assert_eq!(dump.cpuid[&0].len(), 4);
        assert_eq!(dump.cpuid[&1].len(), 3);
        assert_eq!(dump.msrs.len(), 3);
        assert_eq!(dump.cpuid[&1][&CpuidQuery::new(0xD, 1)].ebx, 0x348);
    }

    #[test]
    fn repeated_sections_are_rejected() {
        let input = "------[ Logical CPU #0 ]------\nCPUID 00000000: 00000010-68747541-444D4163-69746E65\n------[ Logical CPU #0 ]------\n";

        assert_eq!(
            AidaCpuidDump::from_str(input).expect_err("repeated section"),
            DumpParseError::DuplicateSection("Logical CPU #0".to_owned())
        );
    }

    #[test]
    fn dump_without_cpu_zero_is_rejected() {
        assert_eq!(
            AidaCpuidDump::from_str("------[ MSR Registers ]------\nMSR 0000001B: 0000-0000-FEE0-0900\n")
                .expect_err("no CPU #0"),
            DumpParseError::NoCpuZero
        );
    }

    #[test]
    fn replay_answers_reads() {
        let dump = AidaCpuidDump::from_str(RYZEN_DUMP).expect("parse");

        assert_eq!(dump.vendor_name().expect("vendor"), "AuthenticAMD");
        assert_eq!(dump.cpu_count().expect("cpu count"), 4);
        assert_eq!(dump.read_msr(0xC001_0064).expect("msr"), 0x8000_0000_4A36_0890);
        assert_eq!(dump.read_msr_on(1, 0x1B).expect("msr"), 0xFEE0_0900);
        assert_eq!(dump.cpuid_on(1, 1.into()).expect("cpuid").ebx, 0x0110_0800);

        match dump.cpuid_on(2, 1.into()) {
            Err(Error::NotRecorded { resource, .. }) => assert_eq!(resource, Resource::Cpuid),
            other => panic!("expected unrecorded value, got {:?}", other),
        }
        assert!(dump.read_msr(0x10).is_err());
        assert!(dump.read_pci(0x18, 3, 0x160).is_err());
    }

    #[test]
    fn replay_rejects_writes() {
        let dump = AidaCpuidDump::from_str(RYZEN_DUMP).expect("parse");

        match dump.write_msr(0xC001_0015, 0x1234) {
            Err(Error::ReadOnly { resource }) => assert_eq!(resource, Resource::Msr),
            other => panic!("expected read-only error, got {:?}", other),
        }
        assert!(dump.write_msr_on(0, 0xC001_0015, 0x1234).is_err());
        assert!(dump.write_pci(0x18, 3, 0x160, 0).is_err());
    }
}

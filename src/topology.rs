//! # Logical CPU Count
//!
//! The number of logical CPUs is taken from the AMD address sizes
//! leaf (`0x8000_0008`). Bits 7:0 of ECX hold the number of logical
//! CPUs minus one. Other vendors encode this leaf differently (Intel
//! reports zero there), so the count is only derived on AMD-compatible
//! hosts.

use crate::access::HardwareAccess;
use crate::cpuid::{CpuidResult, LEAF_ADDRESS_SIZES};
use crate::error::{Error, Result};

/// Vendors using the AMD layout of the address sizes leaf.
const AMD_LAYOUT_VENDORS: &[&str] = &["AuthenticAMD", "HygonGenuine"];

/// Decode the logical CPU count from an address sizes leaf result.
pub fn decode_cpu_count(address_sizes: &CpuidResult) -> u32 {
    (address_sizes.ecx & 0xff) + 1
}

/// Determine the number of logical CPUs of the host behind `hw`.
///
/// Fails with [Error::UnsupportedHardware] if the host does not
/// implement the address sizes leaf or is not AMD-compatible.
pub fn cpu_count<H: HardwareAccess + ?Sized>(hw: &H) -> Result<u32> {
    let vendor = hw.vendor_name()?;
    if !AMD_LAYOUT_VENDORS.contains(&vendor.as_str()) {
        return Err(Error::UnsupportedHardware {
            reason: format!("CPU count encoding of vendor {:?} is unknown", vendor),
        });
    }

    let max_extended = hw.max_extended_leaf()?;
    if max_extended < LEAF_ADDRESS_SIZES {
        return Err(Error::UnsupportedHardware {
            reason: format!(
                "CPUID leaf {:#x} not available (maximum extended leaf is {:#x})",
                LEAF_ADDRESS_SIZES, max_extended
            ),
        });
    }

    let count = decode_cpu_count(&hw.cpuid(LEAF_ADDRESS_SIZES.into())?);
    debug!("{} logical cpus", count);

    Ok(count)
}

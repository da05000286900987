//! Values exchanged with the `cpuid` instruction.

/// Vendor identification and maximum standard leaf.
pub const LEAF_VENDOR: u32 = 0x0000_0000;

/// Maximum extended leaf.
pub const LEAF_EXTENDED_MAX: u32 = 0x8000_0000;

/// First of the three processor brand string leaves.
pub const LEAF_BRAND_STRING: u32 = 0x8000_0002;

/// AMD "address sizes and physical core count" leaf.
pub const LEAF_ADDRESS_SIZES: u32 = 0x8000_0008;

/// The input to a `cpuid` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuidQuery {
    pub leaf: u32,
    pub subleaf: u32,
}

/// Simple queries do not require a subleaf.
impl From<u32> for CpuidQuery {
    fn from(leaf: u32) -> Self {
        Self { leaf, subleaf: 0 }
    }
}

impl CpuidQuery {
    pub fn new(leaf: u32, subleaf: u32) -> Self {
        Self { leaf, subleaf }
    }

    /// Position of this query inside a Linux `/dev/cpu/N/cpuid` file.
    ///
    /// The driver takes the leaf from the low and the subleaf from the
    /// high half of the file offset.
    pub fn file_offset(&self) -> u64 {
        (u64::from(self.subleaf) << 32) | u64::from(self.leaf)
    }
}

/// The result of a `cpuid` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// The registers of a [CpuidResult].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuidRegister {
    Eax,
    Ebx,
    Ecx,
    Edx,
}

impl CpuidResult {
    /// Size of a result as transferred by the kernel interfaces.
    pub const SIZE: usize = 16;

    /// Retrieve a register value from a CPUID result.
    pub fn get(&self, reg: CpuidRegister) -> u32 {
        match reg {
            CpuidRegister::Eax => self.eax,
            CpuidRegister::Ebx => self.ebx,
            CpuidRegister::Ecx => self.ecx,
            CpuidRegister::Edx => self.edx,
        }
    }

    /// Decode the four registers from their in-memory layout.
    pub fn from_ne_bytes(bytes: [u8; CpuidResult::SIZE]) -> Self {
        let word = |i: usize| {
            u32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };

        Self {
            eax: word(0),
            ebx: word(4),
            ecx: word(8),
            edx: word(12),
        }
    }

    /// Encode the registers in the order EAX, EBX, ECX, EDX.
    pub fn to_ne_bytes(&self) -> [u8; CpuidResult::SIZE] {
        let mut bytes = [0; CpuidResult::SIZE];
        for (chunk, reg) in bytes
            .chunks_exact_mut(4)
            .zip(&[self.eax, self.ebx, self.ecx, self.edx])
        {
            chunk.copy_from_slice(&reg.to_ne_bytes());
        }
        bytes
    }
}

/// Result arrays returned by the kernel are ordered EAX, EBX, ECX, EDX.
impl From<[u32; 4]> for CpuidResult {
    fn from(data: [u32; 4]) -> Self {
        Self {
            eax: data[0],
            ebx: data[1],
            ecx: data[2],
            edx: data[3],
        }
    }
}

/// Converts a slice of 32-bit little-endian integers into a
/// `Vec<u8>`. This also trims zero bytes at the end.
pub(crate) fn dwords_to_bytes(dwords: &[u32]) -> Vec<u8> {
    dwords
        .iter()
        .flat_map(|dw| dw.to_le_bytes())
        .take_while(|c| *c != 0)
        .collect()
}

//! x86-64 register and condition-code tables.
//!
//! Everything here is a static fact about the architecture: register family
//! names at each operand width, the REX-free encodable subset, and the
//! condition-code spelling/opposite relations used by branch rewrites.

use std::collections::HashMap;
use std::sync::LazyLock;

/// Register families in encoding order: `(8-bit, 16-bit, 32-bit, 64-bit)`.
/// The first eight families are encodable without a REX prefix.
pub const REG_FAMILIES: [[&str; 4]; 16] = [
    ["al", "ax", "eax", "rax"],
    ["dl", "dx", "edx", "rdx"],
    ["cl", "cx", "ecx", "rcx"],
    ["bl", "bx", "ebx", "rbx"],
    ["sil", "si", "esi", "rsi"],
    ["dil", "di", "edi", "rdi"],
    ["bpl", "bp", "ebp", "rbp"],
    ["spl", "sp", "esp", "rsp"],
    ["r8b", "r8w", "r8d", "r8"],
    ["r9b", "r9w", "r9d", "r9"],
    ["r10b", "r10w", "r10d", "r10"],
    ["r11b", "r11w", "r11d", "r11"],
    ["r12b", "r12w", "r12d", "r12"],
    ["r13b", "r13w", "r13d", "r13"],
    ["r14b", "r14w", "r14d", "r14"],
    ["r15b", "r15w", "r15d", "r15"],
];

pub const NREG: usize = REG_FAMILIES.len();

/// Number of families addressable without a REX prefix.
pub const NREG_LO: usize = 8;

pub const AX: usize = 0;
pub const DX: usize = 1;
pub const CX: usize = 2;
pub const BX: usize = 3;
pub const SI: usize = 4;
pub const DI: usize = 5;
pub const BP: usize = 6;
pub const SP: usize = 7;
pub const R8: usize = 8;
pub const R9: usize = 9;
pub const R11: usize = 11;

const WIDTH_COL: [(usize, u8); 4] = [(0, 8), (1, 16), (2, 32), (3, 64)];

/// Name -> (family index, operand width in bits).
static REG_INDEX_BITS: LazyLock<HashMap<&'static [u8], (usize, u8)>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for (index, family) in REG_FAMILIES.iter().enumerate() {
        for (col, bits) in WIDTH_COL {
            map.insert(family[col].as_bytes(), (index, bits));
        }
    }
    map
});

pub fn reg_index_bits(name: &[u8]) -> Option<(usize, u8)> {
    REG_INDEX_BITS.get(name).copied()
}

pub fn reg_bits(name: &[u8]) -> Option<u8> {
    reg_index_bits(name).map(|(_, bits)| bits)
}

pub fn reg_index(name: &[u8]) -> Option<usize> {
    reg_index_bits(name).map(|(index, _)| index)
}

pub fn is_reg32(name: &[u8]) -> bool {
    matches!(reg_index_bits(name), Some((_, 32)))
}

fn col_for_bits(bits: u8) -> usize {
    match bits {
        8 => 0,
        16 => 1,
        32 => 2,
        64 => 3,
        _ => unreachable!("register width {bits}"),
    }
}

/// The name of the given family at the given width.
pub fn reg_name(index: usize, bits: u8) -> &'static [u8] {
    REG_FAMILIES[index][col_for_bits(bits)].as_bytes()
}

/// Rename `name` to the same family's view at `bits` width.
pub fn reg_to_width(name: &[u8], bits: u8) -> Option<&'static [u8]> {
    reg_index(name).map(|index| reg_name(index, bits))
}

/// b/w/l/q operand-size suffix for a width.
pub fn width_suffix(bits: u8) -> &'static [u8] {
    match bits {
        8 => b"b",
        16 => b"w",
        32 => b"l",
        64 => b"q",
        _ => unreachable!("operand width {bits}"),
    }
}

/// Condition-code spelling aliases, mapped to the canonical spelling.
pub const CC_ALIASES: [(&str, &str); 14] = [
    ("c", "b"),
    ("na", "be"),
    ("nae", "b"),
    ("nb", "ae"),
    ("nbe", "a"),
    ("nc", "ae"),
    ("ng", "le"),
    ("nge", "l"),
    ("nl", "ge"),
    ("nle", "g"),
    ("nz", "ne"),
    ("pe", "p"),
    ("po", "np"),
    ("z", "e"),
];

/// Canonical condition codes and their logical opposites.
pub const CC_OPPOSITES: [(&str, &str); 16] = [
    ("a", "be"),
    ("ae", "b"),
    ("b", "ae"),
    ("be", "a"),
    ("e", "ne"),
    ("g", "le"),
    ("ge", "l"),
    ("l", "ge"),
    ("le", "g"),
    ("ne", "e"),
    ("no", "o"),
    ("np", "p"),
    ("ns", "s"),
    ("o", "no"),
    ("p", "np"),
    ("s", "ns"),
];

static CC_CANONICALIZE: LazyLock<HashMap<&'static [u8], &'static [u8]>> = LazyLock::new(|| {
    CC_ALIASES
        .iter()
        .map(|&(alias, canon)| (alias.as_bytes(), canon.as_bytes()))
        .collect()
});

static CC_OPPOSITE: LazyLock<HashMap<&'static [u8], &'static [u8]>> = LazyLock::new(|| {
    CC_OPPOSITES
        .iter()
        .map(|&(cc, opp)| (cc.as_bytes(), opp.as_bytes()))
        .collect()
});

pub fn cc_canonicalize(cc: &[u8]) -> Option<&'static [u8]> {
    CC_CANONICALIZE.get(cc).copied()
}

pub fn cc_opposite(cc: &[u8]) -> Option<&'static [u8]> {
    CC_OPPOSITE.get(cc).copied()
}

/// Every recognized condition-code spelling (canonical and alias).
pub fn all_cc_spellings() -> impl Iterator<Item = &'static str> {
    CC_OPPOSITES
        .iter()
        .map(|&(cc, _)| cc)
        .chain(CC_ALIASES.iter().map(|&(alias, _)| alias))
}

pub fn is_cc(cc: &[u8]) -> bool {
    CC_OPPOSITE.contains_key(cc) || CC_CANONICALIZE.contains_key(cc)
}

/// Which x86-64 System-V ABI variant the input targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Abi {
    /// `--64`: LP64.
    #[default]
    Lp64,
    /// `--x32`: ILP32 with 64-bit registers.
    X32,
}

impl Abi {
    /// Parse the assembler's ABI selection flag.
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "--64" => Some(Abi::Lp64),
            "--x32" => Some(Abi::X32),
            _ => None,
        }
    }

    pub fn is_x32(self) -> bool {
        matches!(self, Abi::X32)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Abi::Lp64 => "64",
            Abi::X32 => "x32",
        }
    }
}

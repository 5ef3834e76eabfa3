//! Zero-extension tracking over a single forward pass.
//!
//! For every general-purpose register the tracker keeps an upper bound on
//! the number of meaningful low-order bits it currently holds (64 =
//! unknown, 0 = known zero). The bound is sound by construction: any line
//! the tracker cannot account for resets the affected registers (or the
//! whole vector) to unknown. The per-line [`ZeroExtend::feed`] either
//! returns a narrower rewrite of the line or leaves it alone.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::bytes::Regex;

use core_x86::{AX, Abi, BP, BX, CX, NREG, NREG_LO, R11, SP, reg_index_bits, reg_name};

pub mod cxx;

fn product(parts: &[&[&str]]) -> Vec<Vec<u8>> {
    let mut acc: Vec<Vec<u8>> = vec![Vec::new()];
    for part in parts {
        let mut next = Vec::with_capacity(acc.len() * part.len());
        for stem in &acc {
            for piece in *part {
                let mut s = stem.clone();
                s.extend_from_slice(piece.as_bytes());
                next.push(s);
            }
        }
        acc = next;
    }
    acc
}

fn bwlq(ins: &[&str]) -> Vec<Vec<u8>> {
    product(&[ins, &["", "b", "w", "l", "q"]])
}

fn avx(ins: &[&str]) -> Vec<Vec<u8>> {
    product(&[&["", "v"], ins])
}

fn set_of(groups: Vec<Vec<Vec<u8>>>) -> HashSet<Vec<u8>> {
    groups.into_iter().flatten().collect()
}

// Doesn't affect registers (may modify flags).
static NOAFFECT: LazyLock<HashSet<Vec<u8>>> = LazyLock::new(|| {
    let jcc: Vec<String> = core_x86::all_cc_spellings()
        .map(|cc| format!("j{cc}"))
        .collect();
    let jcc_refs: Vec<&str> = jcc.iter().map(String::as_str).collect();
    set_of(vec![
        vec![
            b".p2align".to_vec(),
            b".align".to_vec(),
            b".balign".to_vec(),
            b"push".to_vec(),
            b"pushl".to_vec(),
            b"pushq".to_vec(),
            b"pushf".to_vec(),
        ],
        bwlq(&["nop", "cmp", "test"]),
        product(&[&jcc_refs]),
    ])
});

static RESET: LazyLock<HashSet<Vec<u8>>> = LazyLock::new(|| {
    set_of(vec![
        product(&[&["jmp", "ret"], &["", "l", "q"]]),
        vec![
            b"cpuid".to_vec(),
            b"ud2".to_vec(),
            b"ud2a".to_vec(),
            b"hlt".to_vec(),
        ],
    ])
});

// Result is a bit index or population count: at most 7 meaningful bits.
static BITS_RESULTS: LazyLock<HashSet<Vec<u8>>> =
    LazyLock::new(|| set_of(vec![bwlq(&["bsf", "bsr", "lzcnt", "tzcnt", "popcnt"])]));

// No side effect beyond writing the destination and the flags.
static SIMPLE_ARITH: LazyLock<HashSet<Vec<u8>>> = LazyLock::new(|| {
    set_of(vec![
        bwlq(&[
            "lea", "add", "sub", "inc", "dec", "adc", "sbb", "xor", "and", "or", "andn", "rol",
            "ror", "shl", "shr", "sar", "shrx", "sarx", "shlx", "not", "neg", "crc32",
        ]),
        vec![b"bswap".to_vec(), b"bswapl".to_vec(), b"bswapq".to_vec()],
        // XMM -> GPR transfers
        avx(&["movd", "movq", "pextrb", "pextrw", "pextrd", "pextrq"]),
        product(&[&["", "v"], &["cvt", "cvtt"], &["sd2si", "ss2si"]]),
        avx(&["pmovmskb", "movmskps"]),
    ])
});

static CMOVCC: LazyLock<HashSet<Vec<u8>>> = LazyLock::new(|| {
    core_x86::all_cc_spellings()
        .map(|cc| format!("cmov{cc}").into_bytes())
        .collect()
});

// SIMD instructions that never clobber a GPR.
static IGNORE_SIMD: LazyLock<HashSet<Vec<u8>>> = LazyLock::new(|| {
    set_of(vec![
        avx(&["movaps", "movups", "movdqa", "movdqu", "movapd", "movupd"]),
        product(&[
            &["", "v"],
            &["and", "or", "xor", "add", "sub"],
            &["sd", "ss", "pd", "ps"],
        ]),
        product(&[
            &["", "v"],
            &["padd", "psub", "pmaxu", "pmaxs"],
            &["b", "w", "d", "q"],
        ]),
    ])
});

// With a memory destination these clobber no GPR.
static MEMORY_DST_OK: LazyLock<HashSet<Vec<u8>>> =
    LazyLock::new(|| set_of(vec![bwlq(&["mov", "add", "sub", "inc", "dec", "cmp", "test"])]));

static FUNCTIONS_RETURNING_POINTERS: LazyLock<HashSet<Vec<u8>>> = LazyLock::new(|| {
    let names: &[&str] = &[
        "memcpy",
        "memmove",
        "mempcpy",
        "strchr",
        "strrchr",
        "memchr",
        "memrchr",
        "strdup",
        "strpbrk",
        "stpcpy",
        "strstr",
        "memmem",
        "malloc",
        "calloc",
        "realloc",
        "memalign",
        "aligned_alloc",
        "mmap",
        "realpath",
        "getenv",
        "__errno_location",
        // operator new / new[], x32 mangling
        "_Znwj",
        "_Znaj",
        "__cxa_allocate_exception",
        "__cxa_begin_catch",
        // gnumake plugins
        "gmk_alloc",
    ];
    set_of(vec![product(&[names, &["", "@plt", "@PLT"]])])
});

const AMD64_CALL_PRESERVED: [usize; 6] = [BX, BP, 12, 13, 14, 15];

static SINGLE_REG_ADDRESSING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(%(\w+)\)").unwrap());
static IMMEDIATE_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A[+-]?(0x[\da-f]+|0+|[1-9]\d*)").unwrap());

fn parse_int(text: &[u8]) -> Option<i128> {
    let s = std::str::from_utf8(text).ok()?;
    let (sign, digits) = match s.as_bytes().first() {
        Some(b'-') => (-1, &s[1..]),
        Some(b'+') => (1, &s[1..]),
        _ => (1, s),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x") {
        i128::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i128>().ok()?
    };
    Some(sign * value)
}

fn imm_bits(value: i128, bits: u8) -> u8 {
    if value < 0 {
        return bits;
    }
    let length = (128 - value.leading_zeros()) as u8;
    length.min(bits)
}

// A one-register address with a full 32-bit bound may only be widened when
// the displacement is a plain integer (or absent); a symbolic component
// plus a "negative" 32-bit register value would change the address.
fn no_static_address(prefix: &[u8]) -> bool {
    let tail = match prefix.iter().rposition(|&b| b == b',') {
        Some(pos) => &prefix[pos + 1..],
        None => prefix,
    };
    let tail: Vec<u8> = tail
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    tail.is_empty() || parse_int(&tail).is_some()
}

/// Split a mnemonic from its operand text.
fn split_key(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace())?;
    let rest = &line[start..];
    let end = rest
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(rest.len());
    let (key, mut operand) = rest.split_at(end);
    while let Some((&b, tail)) = operand.split_first() {
        if b.is_ascii_whitespace() {
            operand = tail;
        } else {
            break;
        }
    }
    Some((key, operand))
}

fn is_operand_sep(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b',')
}

// Count for the right-shift rules only: both an absent count and an
// explicit $0 shrink the bound by one, which matches how those rules read
// their operand. The shl rule keeps $0 and "absent" apart.
fn shift_count(imm: Option<i128>) -> u8 {
    match imm {
        Some(0) | None => 1,
        Some(k) => k.clamp(0, 64) as u8,
    }
}

fn mov_rr(src: &[u8], dst: &[u8]) -> Vec<u8> {
    let mut out = b"\tmov\t%".to_vec();
    out.extend_from_slice(src);
    out.extend_from_slice(b",%");
    out.extend_from_slice(dst);
    out
}

fn two_operand(key: &[u8], first: &[u8], second: &[u8]) -> Vec<u8> {
    let mut out = b"\t".to_vec();
    out.extend_from_slice(key);
    out.push(b'\t');
    out.extend_from_slice(first);
    out.push(b',');
    out.extend_from_slice(second);
    out
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// The forward-pass tracker. Feed it every line of the document in order.
pub struct ZeroExtend {
    abi: Abi,
    bounds: [u8; NREG],
    defaults: [u8; NREG],
    pointer_params: Option<cxx::PointerParams>,
}

impl ZeroExtend {
    /// `contents` is the whole document; on x32 it is scanned for mangled
    /// symbols so labels can seed pointer-parameter bounds.
    pub fn new(abi: Abi, contents: &[u8]) -> Self {
        let mut defaults = [64u8; NREG];
        if abi.is_x32() {
            defaults[SP] = 32;
        }
        let pointer_params = if abi.is_x32() {
            cxx::analyze(contents)
        } else {
            None
        };
        Self {
            abi,
            bounds: defaults,
            defaults,
            pointer_params,
        }
    }

    fn reset(&mut self) {
        self.bounds = self.defaults;
    }

    /// Current bound for a register family.
    pub fn bound(&self, reg: usize) -> u8 {
        self.bounds[reg]
    }

    /// Process one line. `Some(new)` replaces the line (empty deletes it);
    /// `None` leaves it untouched. `flag_never_used` answers whether the
    /// flags produced at this line can be observed downstream; it is only
    /// consulted when a candidate rewrite would change flag behavior.
    pub fn feed(
        &mut self,
        line: &[u8],
        mut flag_never_used: impl FnMut() -> bool,
    ) -> Option<Vec<u8>> {
        let mut res: Option<Vec<u8>> = None;

        if line.contains(&b';') {
            self.reset();
            return res;
        }

        if line.last() == Some(&b':') {
            self.reset();
            if self.abi.is_x32() {
                if let Some(params) = &self.pointer_params {
                    for reg in params.z32_registers(&line[..line.len() - 1]) {
                        self.bounds[reg] = 32;
                    }
                }
            }
            return res;
        }

        let Some((key, operand)) = split_key(line) else {
            return res;
        };
        let key = key.to_vec();
        let mut operand = operand.to_vec();

        if key == b".loc" || key.starts_with(b".cfi_") {
            return res;
        }

        // x32: `(%r32)` with the register already known ≤32 bits can use the
        // 64-bit name and save an address-size prefix.
        if self.abi.is_x32() && !operand.is_empty() && find_sub(&operand, b"(%").is_some() {
            if let Some(caps) = SINGLE_REG_ADDRESSING.captures(&operand) {
                let m = caps.get(0).unwrap();
                let reg = caps.get(1).unwrap().as_bytes();
                if let Some((index, 32)) = reg_index_bits(reg) {
                    let bound = self.bounds[index];
                    if bound <= 32 && (bound <= 31 || no_static_address(&operand[..m.start()])) {
                        let mut rebuilt = operand[..m.start()].to_vec();
                        rebuilt.extend_from_slice(b"(%");
                        rebuilt.extend_from_slice(reg_name(index, 64));
                        rebuilt.push(b')');
                        rebuilt.extend_from_slice(&operand[m.end()..]);
                        operand = rebuilt;
                        let mut newline = b"\t".to_vec();
                        newline.extend_from_slice(&key);
                        newline.push(b'\t');
                        newline.extend_from_slice(&operand);
                        res = Some(newline);
                    }
                }
            }
        }

        if RESET.contains(&key) {
            self.reset();
            return res;
        }

        // Regular x86-64 calling convention.
        if key == b"call" || key == b"calll" || key == b"callq" {
            let old = self.bounds;
            self.reset();
            for reg in AMD64_CALL_PRESERVED {
                self.bounds[reg] = old[reg];
            }
            if self.abi.is_x32() && FUNCTIONS_RETURNING_POINTERS.contains(&operand) {
                self.bounds[AX] = 32;
            }
            return res;
        }

        // Linux clobbers %rcx/%r11 and returns in %rax.
        if key == b"syscall" {
            self.bounds[AX] = 64;
            self.bounds[CX] = 64;
            self.bounds[R11] = 64;
            return res;
        }

        if key == b"cltq" {
            if self.bounds[AX] < 32 {
                res = Some(Vec::new());
            } else {
                self.bounds[AX] = 64;
            }
            return res;
        }

        if IGNORE_SIMD.contains(&key) {
            return res;
        }

        if operand.last() == Some(&b')') && MEMORY_DST_OK.contains(&key) {
            return res;
        }

        if operand.len() < 3 {
            if !NOAFFECT.contains(&key) {
                self.reset();
            }
            return res;
        }

        // Destination register: the last %reg in the operand text.
        let percent = operand.iter().rposition(|&b| b == b'%');
        let dst_found = percent.and_then(|pos| {
            if pos != 0 && !is_operand_sep(operand[pos - 1]) {
                return None;
            }
            reg_index_bits(&operand[pos + 1..]).map(|(index, bits)| (index, bits, pos))
        });
        let Some((dst, dst_bits, dst_pos)) = dst_found else {
            if !NOAFFECT.contains(&key) {
                self.reset();
            }
            return res;
        };
        let dst_name = operand[dst_pos + 1..].to_vec();

        // Source register, when the operand leads with one.
        let mut src: Option<(usize, u8)> = None;
        if operand.first() == Some(&b'%') && operand[1..] != dst_name[..] {
            for len in 2..=4usize {
                if operand.len() > len
                    && (operand.len() == len + 1 || is_operand_sep(operand[len + 1]))
                {
                    if let Some(found) = reg_index_bits(&operand[1..len + 1]) {
                        src = Some(found);
                        break;
                    }
                }
            }
        }

        // Immediate source.
        let mut src_imm: Option<i128> = None;
        let mut imm_text: Vec<u8> = Vec::new();
        if operand.first() == Some(&b'$') {
            if let Some(m) = IMMEDIATE_VALUE.find(&operand[1..]) {
                imm_text = m.as_bytes().to_vec();
                if let Some(mut value) = parse_int(&imm_text) {
                    if value < 0 {
                        value += 1i128 << dst_bits;
                    }
                    src_imm = Some(value);
                }
            }
        }

        let bounds = &mut self.bounds;
        let is_mov = matches!(
            key.as_slice(),
            b"mov" | b"movb" | b"movw" | b"movl" | b"movq" | b"movabs" | b"movabsq"
        );
        let is_xor = matches!(key.as_slice(), b"xor" | b"xorl" | b"xorq");
        let is_and = matches!(key.as_slice(), b"and" | b"andl" | b"andq");

        if is_mov && src == Some((dst, 32)) && dst_bits == 32 && bounds[dst] <= 32 {
            // mov %r32,%r32 of an already-zero-extended register.
            res = Some(Vec::new());
        } else if is_mov
            && dst_bits == 64
            && dst < NREG_LO
            && src.is_some_and(|(s, _)| bounds[s] <= 32 && s < NREG_LO)
        {
            // The value fits 32 bits; the 32-bit move is shorter.
            let (s, _) = src.unwrap();
            bounds[dst] = bounds[s];
            res = Some(mov_rr(reg_name(s, 32), reg_name(dst, 32)));
        } else if is_mov && src_imm == Some(0) && flag_never_used() {
            // mov $0,%reg -> xor %reg,%reg
            let reg: Vec<u8> = if dst_bits >= 32 {
                bounds[dst] = 0;
                reg_name(dst, 32).to_vec()
            } else {
                if bounds[dst] <= dst_bits {
                    bounds[dst] = 0;
                }
                dst_name.clone()
            };
            let mut out = b"\txor\t%".to_vec();
            out.extend_from_slice(&reg);
            out.extend_from_slice(b",%");
            out.extend_from_slice(&reg);
            res = Some(out);
        } else if is_mov && (dst_bits == 32 || dst_bits == 64) {
            if let Some((s, _)) = src {
                bounds[dst] = dst_bits.min(bounds[s]);
            } else if let Some(value) = src_imm {
                let bits = imm_bits(value, dst_bits);
                bounds[dst] = bits;
                if dst_bits == 64 && bits <= 32 {
                    let mut imm = b"$".to_vec();
                    imm.extend_from_slice(&imm_text);
                    let mut dst32 = b"%".to_vec();
                    dst32.extend_from_slice(reg_name(dst, 32));
                    res = Some(two_operand(b"mov", &imm, &dst32));
                }
            } else {
                bounds[dst] = dst_bits;
            }
        } else if is_mov {
            bounds[dst] = bounds[dst].max(dst_bits);
        } else if key == b"movzbl" || key == b"movzwl" {
            let narrow: u8 = if key == b"movzbl" { 8 } else { 16 };
            match src {
                Some((s, src_bits)) if bounds[s] <= src_bits => {
                    // The source is already zero-extended past its width.
                    if s == dst {
                        res = Some(Vec::new());
                    } else {
                        res = Some(mov_rr(reg_name(s, 32), &dst_name));
                        bounds[dst] = bounds[s];
                    }
                }
                _ => bounds[dst] = narrow,
            }
        } else if key == b"movslq" {
            match src {
                Some((s, _)) if bounds[s] < 32 => {
                    // Sign extension of a value that cannot be negative.
                    if s == dst {
                        res = Some(Vec::new());
                    } else {
                        res = Some(mov_rr(reg_name(s, 32), reg_name(dst, 32)));
                        bounds[dst] = bounds[s];
                    }
                }
                _ => bounds[dst] = 64,
            }
        } else if is_xor && src == Some((dst, dst_bits)) && (dst_bits == 32 || dst_bits == 64) {
            if bounds[dst] == 0 && flag_never_used() {
                // Already zero.
                res = Some(Vec::new());
            } else {
                if dst_bits == 64 && dst < NREG_LO {
                    let r = reg_name(dst, 32);
                    let mut out = b"\txor\t%".to_vec();
                    out.extend_from_slice(r);
                    out.extend_from_slice(b",%");
                    out.extend_from_slice(r);
                    res = Some(out);
                }
                bounds[dst] = 0;
            }
        } else if is_xor
            && src_imm == Some(65535)
            && (dst_bits == 32 || dst_bits == 64)
            && bounds[dst] <= 32
            && flag_never_used()
        {
            // Only the low 16 bits are ever set: flip them directly.
            let mut out = b"\tnot\t%".to_vec();
            out.extend_from_slice(reg_name(dst, 16));
            res = Some(out);
            bounds[dst] = bounds[dst].max(16);
        } else if matches!(key.as_slice(), b"shr" | b"shrq")
            && dst_bits == 64
            && src.is_none()
            && bounds[dst] <= 32
            && src_imm.is_none_or(|v| v < 32)
        {
            // Never with a %cl count: a count >= width behaves differently
            // in the 32-bit form.
            let mut out = b"\tshr\t".to_vec();
            if src_imm.is_some() {
                out.push(b'$');
                out.extend_from_slice(&imm_text);
                out.push(b',');
            }
            out.push(b'%');
            out.extend_from_slice(reg_name(dst, 32));
            res = Some(out);
            bounds[dst] = bounds[dst].saturating_sub(shift_count(src_imm));
        } else if matches!(key.as_slice(), b"shr" | b"shrl")
            && dst_bits == 32
            && src.is_none()
            && src_imm.is_none_or(|v| v < 32)
        {
            bounds[dst] = bounds[dst].min(32).saturating_sub(shift_count(src_imm));
        } else if is_and
            && (dst_bits == 32 || dst_bits == 64)
            && matches!(src_imm, Some(255) | Some(65535) | Some(0xffff_ffff))
            && flag_never_used()
        {
            // A whole-subregister mask is a zero-extending move, or nothing
            // when the register is already narrow enough.
            res = Some(Vec::new());
            match src_imm.unwrap() {
                255 => {
                    if bounds[dst] > 8 {
                        let mut src8 = b"%".to_vec();
                        src8.extend_from_slice(reg_name(dst, 8));
                        let mut dst32 = b"%".to_vec();
                        dst32.extend_from_slice(reg_name(dst, 32));
                        res = Some(two_operand(b"movzbl", &src8, &dst32));
                        bounds[dst] = 8;
                    }
                }
                65535 => {
                    if bounds[dst] > 16 {
                        let mut src16 = b"%".to_vec();
                        src16.extend_from_slice(reg_name(dst, 16));
                        let mut dst32 = b"%".to_vec();
                        dst32.extend_from_slice(reg_name(dst, 32));
                        res = Some(two_operand(b"movzwl", &src16, &dst32));
                        bounds[dst] = 16;
                    }
                }
                _ => {
                    if bounds[dst] > 32 {
                        res = Some(mov_rr(reg_name(dst, 32), reg_name(dst, 32)));
                        bounds[dst] = 32;
                    }
                }
            }
        } else if is_and && src_imm.is_some() {
            let bits = imm_bits(src_imm.unwrap(), dst_bits);
            bounds[dst] = bounds[dst].min(bits);
            if bits <= 32 && dst_bits == 64 && dst < NREG_LO {
                // SF is unaffected: a 32-bit immediate with its sign bit set
                // cannot be encoded in the 64-bit instruction anyway.
                let mut imm = b"$".to_vec();
                imm.extend_from_slice(&imm_text);
                let mut dst32 = b"%".to_vec();
                dst32.extend_from_slice(reg_name(dst, 32));
                res = Some(two_operand(b"and", &imm, &dst32));
            }
        } else if is_and && src.is_some() {
            let (s, _) = src.unwrap();
            bounds[dst] = bounds[dst].min(bounds[s]);
        } else if matches!(key.as_slice(), b"test" | b"testl" | b"testq")
            && dst_bits > 8
            && src_imm.is_some_and(|v| (0..=255).contains(&v))
        {
            // The 8-bit register form produces the same flags.
            let mut imm = b"$".to_vec();
            imm.extend_from_slice(&imm_text);
            let mut dst8 = b"%".to_vec();
            dst8.extend_from_slice(reg_name(dst, 8));
            res = Some(two_operand(b"test", &imm, &dst8));
        } else if matches!(key.as_slice(), b"test" | b"testq")
            && dst_bits == 64
            && dst < NREG_LO
            && src_imm.is_some_and(|v| (0..1i128 << 32).contains(&v))
        {
            let mut imm = b"$".to_vec();
            imm.extend_from_slice(&imm_text);
            let mut dst32 = b"%".to_vec();
            dst32.extend_from_slice(reg_name(dst, 32));
            res = Some(two_operand(b"test", &imm, &dst32));
        } else if matches!(
            key.as_slice(),
            b"cmp" | b"cmpb" | b"cmpw" | b"cmpl" | b"cmpq"
        ) && src_imm == Some(0)
        {
            // cmp $0,%reg produces exactly the flags of test %reg,%reg.
            let mut reg = b"%".to_vec();
            reg.extend_from_slice(&dst_name);
            res = Some(two_operand(b"test", &reg, &reg));
        } else if matches!(key.as_slice(), b"shl" | b"sal" | b"shlq" | b"salq")
            && dst_bits == 64
            && src.is_none()
        {
            // An absent count is the implicit shift-by-one form; an explicit
            // $0 really shifts by zero (unlike shr, whose count helper folds
            // the two together).
            let k = src_imm.map_or(1, |k| k.clamp(0, 64) as u8);
            let total = k as u32 + bounds[dst] as u32;
            // Shifting into bit 31 changes SF in the 32-bit form.
            if total < 32 || (total == 32 && flag_never_used()) {
                bounds[dst] += k;
                let mut out = b"\tsall\t".to_vec();
                if src_imm.is_some() {
                    out.push(b'$');
                    out.extend_from_slice(&imm_text);
                    out.push(b',');
                }
                out.push(b'%');
                out.extend_from_slice(reg_name(dst, 32));
                res = Some(out);
            } else {
                bounds[dst] = 64;
            }
        } else if BITS_RESULTS.contains(&key) {
            bounds[dst] = 7;
        } else if SIMPLE_ARITH.contains(&key) {
            if dst_bits == 32 || dst_bits == 64 {
                // 32-bit destinations zero-extend in hardware.
                bounds[dst] = dst_bits;
            } else {
                bounds[dst] = bounds[dst].max(dst_bits);
            }
        } else if CMOVCC.contains(&key) {
            match src {
                Some((s, 64)) if dst_bits == 64 && bounds[dst] <= 32 && bounds[s] <= 32 => {
                    let mut src32 = b"%".to_vec();
                    src32.extend_from_slice(reg_name(s, 32));
                    let mut dst32 = b"%".to_vec();
                    dst32.extend_from_slice(reg_name(dst, 32));
                    res = Some(two_operand(&key, &src32, &dst32));
                    bounds[dst] = bounds[dst].max(bounds[s]);
                }
                _ => {
                    // cmov to a 32-bit register only zero-extends when the
                    // move actually happens.
                    bounds[dst] = bounds[dst].max(dst_bits);
                }
            }
        } else if NOAFFECT.contains(&key) {
            // leaves registers alone
        } else {
            self.reset();
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_x86::{DI, DX, R9, SI};

    fn feed(ze: &mut ZeroExtend, line: &str, dead: bool) -> Option<String> {
        ze.feed(line.as_bytes(), || dead)
            .map(|l| String::from_utf8(l).unwrap())
    }

    #[test]
    fn mov_zero_becomes_xor_when_flags_dead() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(
            feed(&mut ze, "\tmovl\t$0, %eax", true).as_deref(),
            Some("\txor\t%eax,%eax")
        );
        assert_eq!(ze.bound(AX), 0);
        // With flags possibly live the mov stays.
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(feed(&mut ze, "\tmovl\t$0, %eax", false), None);
        assert_eq!(ze.bound(AX), 0);
    }

    #[test]
    fn wide_immediate_move_narrows() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(
            feed(&mut ze, "\tmovq\t$1000, %rdi", true).as_deref(),
            Some("\tmov\t$1000,%edi")
        );
        assert_eq!(ze.bound(DI), 10);
        // A 64-bit immediate has to stay in the 64-bit form.
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(feed(&mut ze, "\tmovabsq\t$0x123456789a, %rdi", true), None);
        assert_eq!(ze.bound(DI), 37);
    }

    #[test]
    fn known_narrow_source_shrinks_moves() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\txorl\t%eax, %eax", true);
        assert_eq!(ze.bound(AX), 0);
        // 64-bit register-to-register move of a 32-bit value.
        assert_eq!(
            feed(&mut ze, "\tmovq\t%rax, %rbx", true).as_deref(),
            Some("\tmov\t%eax,%ebx")
        );
        assert_eq!(ze.bound(BX), 0);
        // movzbl of an already-narrow register becomes a plain move...
        feed(&mut ze, "\txorl\t%ecx, %ecx", true);
        feed(&mut ze, "\tmovb\t$3, %cl", true);
        assert_eq!(ze.bound(CX), 8);
        assert_eq!(
            feed(&mut ze, "\tmovzbl\t%cl, %edx", true).as_deref(),
            Some("\tmov\t%ecx,%edx")
        );
        // ... and disappears when source and destination agree.
        assert_eq!(
            feed(&mut ze, "\tmovzbl\t%cl, %ecx", true).as_deref(),
            Some("")
        );
    }

    #[test]
    fn redundant_same_register_move_is_deleted() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\tmovl\t$7, %eax", false);
        assert_eq!(feed(&mut ze, "\tmov\t%eax, %eax", true).as_deref(), Some(""));
    }

    #[test]
    fn movslq_of_provably_non_negative_value() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\tmovl\t$100, %ecx", false);
        assert_eq!(
            feed(&mut ze, "\tmovslq\t%ecx, %rdx", false).as_deref(),
            Some("\tmov\t%ecx,%edx")
        );
        // Unknown sign bit: the extension must stay.
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(feed(&mut ze, "\tmovslq\t%ecx, %rdx", false), None);
        assert_eq!(ze.bound(DX), 64);
    }

    #[test]
    fn xor_forms() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(
            feed(&mut ze, "\txorq\t%rbx, %rbx", true).as_deref(),
            Some("\txor\t%ebx,%ebx")
        );
        assert_eq!(ze.bound(BX), 0);
        // Re-zeroing an already-zero register with dead flags is a no-op.
        assert_eq!(feed(&mut ze, "\txorl\t%ebx, %ebx", true).as_deref(), Some(""));
        // xor of distinct registers is plain arithmetic.
        assert_eq!(feed(&mut ze, "\txorl\t%ebx, %ecx", true), None);
        assert_eq!(ze.bound(CX), 32);
    }

    #[test]
    fn xor_mask_becomes_not() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\txorl\t%eax, %eax", true);
        assert_eq!(
            feed(&mut ze, "\txorl\t$65535, %eax", true).as_deref(),
            Some("\tnot\t%ax")
        );
        assert_eq!(ze.bound(AX), 16);
    }

    #[test]
    fn masking_becomes_zero_extension() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(
            feed(&mut ze, "\tandl\t$255, %esi", true).as_deref(),
            Some("\tmovzbl\t%sil,%esi")
        );
        assert_eq!(ze.bound(SI), 8);
        // Already narrower than the mask: the and disappears.
        assert_eq!(feed(&mut ze, "\tandl\t$255, %esi", true).as_deref(), Some(""));
        // With live flags the and must stay an and.
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(feed(&mut ze, "\tandl\t$255, %esi", false), None);
        assert_eq!(ze.bound(SI), 8);
    }

    #[test]
    fn and_immediate_narrows_64_bit_form() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(
            feed(&mut ze, "\tandq\t$15, %rdi", false).as_deref(),
            Some("\tand\t$15,%edi")
        );
        assert_eq!(ze.bound(DI), 4);
        // r8-r15 need the REX byte regardless; no rewrite.
        assert_eq!(feed(&mut ze, "\tandq\t$15, %r9", false), None);
        assert_eq!(ze.bound(R9), 4);
    }

    #[test]
    fn test_and_cmp_forms() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(
            feed(&mut ze, "\ttestl\t$8, %edi", false).as_deref(),
            Some("\ttest\t$8,%dil")
        );
        assert_eq!(
            feed(&mut ze, "\ttestq\t$70000, %rax", false).as_deref(),
            Some("\ttest\t$70000,%eax")
        );
        assert_eq!(
            feed(&mut ze, "\tcmpl\t$0, %eax", false).as_deref(),
            Some("\ttest\t%eax,%eax")
        );
    }

    #[test]
    fn shifts_track_widths() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\tmovl\t$100, %eax", false);
        assert_eq!(ze.bound(AX), 7);
        assert_eq!(
            feed(&mut ze, "\tshlq\t$4, %rax", false).as_deref(),
            Some("\tsall\t$4,%eax")
        );
        assert_eq!(ze.bound(AX), 11);
        // Shifting into bit 31 needs dead flags.
        assert_eq!(feed(&mut ze, "\tshlq\t$21, %rax", false), None);
        assert_eq!(ze.bound(AX), 64);
    }

    #[test]
    fn shl_by_explicit_zero_is_not_a_shift_by_one() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\tmovl\t$0x7fffffff, %eax", false);
        assert_eq!(ze.bound(AX), 31);
        // $0 adds nothing to the bound, so the 32-bit form is fine even
        // with live flags; treating it as the implicit-one form would
        // wrongly refuse and forget the bound.
        assert_eq!(
            feed(&mut ze, "\tshlq\t$0, %rax", false).as_deref(),
            Some("\tsall\t$0,%eax")
        );
        assert_eq!(ze.bound(AX), 31);
        // The countless form really is a shift by one.
        assert_eq!(feed(&mut ze, "\tshlq\t%rax", false), None);
        assert_eq!(ze.bound(AX), 64);
    }

    #[test]
    fn shr_narrow_form() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\tmovl\t$100, %eax", false);
        assert_eq!(
            feed(&mut ze, "\tshrq\t$2, %rax", false).as_deref(),
            Some("\tshr\t$2,%eax")
        );
        assert_eq!(ze.bound(AX), 5);
        // Count in %cl: width semantics differ, leave it alone.
        assert_eq!(feed(&mut ze, "\tshrq\t%cl, %rax", false), None);
    }

    #[test]
    fn calls_preserve_callee_saved_only() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\txorl\t%ebx, %ebx", true);
        feed(&mut ze, "\txorl\t%ecx, %ecx", true);
        feed(&mut ze, "\tcall\tfoo", false);
        assert_eq!(ze.bound(BX), 0);
        assert_eq!(ze.bound(CX), 64);
    }

    #[test]
    fn syscall_clobbers() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\txorl\t%eax, %eax", true);
        feed(&mut ze, "\txorl\t%ebx, %ebx", true);
        feed(&mut ze, "\tsyscall", false);
        assert_eq!(ze.bound(AX), 64);
        assert_eq!(ze.bound(R11), 64);
        assert_eq!(ze.bound(BX), 0);
    }

    #[test]
    fn control_transfers_and_unknowns_reset() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\txorl\t%eax, %eax", true);
        feed(&mut ze, "\tjmp\t.L1", false);
        assert_eq!(ze.bound(AX), 64);

        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\txorl\t%eax, %eax", true);
        feed(&mut ze, "\tfrobnicate\t%eax, %ebx", false);
        assert_eq!(ze.bound(AX), 64);
    }

    #[test]
    fn labels_reset_state() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\txorl\t%eax, %eax", true);
        feed(&mut ze, ".L2:", false);
        assert_eq!(ze.bound(AX), 64);
    }

    #[test]
    fn bits_results_are_narrow() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\tpopcntq\t%rdi, %rax", false);
        assert_eq!(ze.bound(AX), 7);
    }

    #[test]
    fn cltq_of_narrow_value_is_dead() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\tmovl\t$100, %eax", false);
        assert_eq!(feed(&mut ze, "\tcltq", false).as_deref(), Some(""));
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(feed(&mut ze, "\tcltq", false), None);
        assert_eq!(ze.bound(AX), 64);
    }

    #[test]
    fn memory_destinations_change_nothing() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\txorl\t%eax, %eax", true);
        assert_eq!(feed(&mut ze, "\tmovl\t%ecx, 8(%rdi)", false), None);
        assert_eq!(ze.bound(AX), 0);
    }

    #[test]
    fn cmov_narrows_when_both_sides_known() {
        let mut ze = ZeroExtend::new(Abi::Lp64, b"");
        feed(&mut ze, "\txorl\t%eax, %eax", true);
        feed(&mut ze, "\tmovl\t$5, %ebx", false);
        assert_eq!(
            feed(&mut ze, "\tcmove\t%rbx, %rax", false).as_deref(),
            Some("\tcmove\t%ebx,%eax")
        );
        assert_eq!(ze.bound(AX), 3);
        // One side unknown: no narrowing, and the 64-bit bound sticks.
        feed(&mut ze, "\tcmove\t%rcx, %rax", false);
        assert_eq!(ze.bound(AX), 64);
    }

    #[test]
    fn x32_single_register_addressing_widens() {
        let mut ze = ZeroExtend::new(Abi::X32, b"");
        feed(&mut ze, "\txorl\t%edi, %edi", true);
        assert_eq!(
            feed(&mut ze, "\tmovl\t(%edi), %eax", false).as_deref(),
            Some("\tmovl\t(%rdi), %eax")
        );
        // Full 32-bit bound: fine with a plain displacement...
        feed(&mut ze, "\tmovl\t%ecx, %edi", false);
        assert_eq!(ze.bound(DI), 32);
        assert_eq!(
            feed(&mut ze, "\tmovl\t8(%edi), %eax", false).as_deref(),
            Some("\tmovl\t8(%rdi), %eax")
        );
        // ... but not with a symbolic one, which could wrap.
        feed(&mut ze, "\tmovl\t%ecx, %edi", false);
        assert_eq!(feed(&mut ze, "\tmovl\tarray(%edi), %eax", false), None);
    }

    #[test]
    fn x32_stack_pointer_starts_narrow() {
        let ze = ZeroExtend::new(Abi::X32, b"");
        assert_eq!(ze.bound(SP), 32);
        let ze = ZeroExtend::new(Abi::Lp64, b"");
        assert_eq!(ze.bound(SP), 64);
    }
}

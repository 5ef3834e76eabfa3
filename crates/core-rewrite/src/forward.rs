//! The single forward walk over the document.
//!
//! Runs the zero-extension tracker on every line and, in the same pass, the
//! flag-driven fusions: branch-pair condition rewrites, `cmp $k`/`bt`
//! immediate-range conversions, operand-swapped compares, and sign-flag
//! simplifications. Each fusion collects its flag users first and mutates
//! only after the whole walk has been proven safe.

use std::sync::LazyLock;

use regex::bytes::{Captures, Regex};

use core_lines::{LineKind, Lines};
use core_x86::Abi;
use core_zeroextend::ZeroExtend;

// Fusable branch pairs as (previous cc, current cc, fused cc). Only pairs
// that read the same hardware flag bits may appear here; the arithmetic
// reading of the pair is NOT sufficient (it breaks on ucomis* and
// pcmp*str*, which set C/Z in their own way). ('a','ae')->'e' is wrong for
// exactly that reason: jae tests C while je tests Z.
const JMP_PAIRS: [(&str, &str, &str); 6] = [
    ("e", "be", "b"),
    ("b", "be", "e"),
    ("e", "a", "ae"),
    ("e", "le", "l"),
    ("l", "le", "e"),
    ("e", "g", "ge"),
];

fn fused_pair(prev: &[u8], cur: &[u8]) -> Option<&'static [u8]> {
    JMP_PAIRS
        .iter()
        .find(|(p, c, _)| p.as_bytes() == prev && c.as_bytes() == cur)
        .map(|(_, _, fused)| fused.as_bytes())
}

static ANDQ_ORQ_MEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A\t(and|or)q\t\$(-?\d+), ?-?\d*\([^;]+$").unwrap());

// GCC always spells an immediate compare with its width suffix.
static CMP_IMM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A\tcmp([bwlq])\t\$(-?[1-9][0-9]*) ?(,[^;]+)$").unwrap());

const ADDRESSING_CONST: &str = r"\d+|0x[\da-fA-F]+|[A-Za-z_.][\w.@]*";
fn addressing_pattern() -> String {
    format!(r"[-+]?(?:{ADDRESSING_CONST})?(?:[-+](?:{ADDRESSING_CONST}))*\((?:,?%\w+)+(?:,\d)?\)")
}

// "cmp reg,mem" and "cmp mem,reg" both exist, but comis* takes no memory
// second operand, so the register-only and reg/mem forms stay separate.
static CMP_REG_REG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A\t(cmp[bwlq]?|v?comis[sd])\t(%\w+), ?(%\w+)$").unwrap());
static CMP_REG_MEM: LazyLock<Regex> = LazyLock::new(|| {
    let addressing = addressing_pattern();
    Regex::new(&format!(
        r"\A\t(cmp[bwlq]?)\t(%\w+|{addressing}), ?(%\w+|{addressing})$"
    ))
    .unwrap()
});

static A_BE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A\t(j|cmov|set)(a|be)(\t[^;]+)$").unwrap());
static B_AE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A\t(j|cmov|set)(b|ae)(\t[^;]+)$").unwrap());
static BT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A\tbt([bwlq]?)\t\$(\d+), ?([^;]+)").unwrap());
static CMP_ZERO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\A\t(?:test[bwlq]?\t%(\w+), ?%(\w+)|cmp[bwlq]?\t\$(?:0x)?0,[^;]*)$").unwrap()
});
static JL_JGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\A\t(cmov|j)(l|ge)\t").unwrap());

fn width_bits(suffix: u8) -> u8 {
    match suffix {
        b'b' => 8,
        b'w' => 16,
        b'l' => 32,
        _ => 64,
    }
}

// Immediates for which $k -> $(k+1) loses the short encoding (or, for q,
// overflows the sign-extended 32-bit field).
fn skip_a_be_conversion(suffix: u8, imm: i128) -> bool {
    match suffix {
        b'b' => imm == 0xff,
        b'w' => imm == 0x7f || imm == 0xffff,
        b'l' => imm == 0x7f || imm == 0xffff_ffff,
        _ => {
            imm == 0x7f
                || imm == 0x7fff_ffff
                || imm == 0xffff_ffff
                || imm == 0xffff_ffff_ffff_ffff
        }
    }
}

fn swap_cc(caps: &Captures<'_>, table: &[(&str, &str)]) -> Vec<u8> {
    let replacement = table
        .iter()
        .find(|(from, _)| from.as_bytes() == &caps[2])
        .map(|(_, to)| *to)
        .expect("pattern alternation matches the table");
    let mut out = b"\t".to_vec();
    out.extend_from_slice(&caps[1]);
    out.extend_from_slice(replacement.as_bytes());
    out.extend_from_slice(&caps[3]);
    out
}

fn rewrite_users(lines: &mut Lines, users: &[usize], re: &Regex, table: &[(&str, &str)]) {
    for &j in users {
        let line = lines.get(j).to_vec();
        if let Some(caps) = re.captures(&line) {
            lines.set(j, swap_cc(&caps, table));
        }
    }
}

fn parse_int(text: &[u8]) -> Option<i128> {
    let s = std::str::from_utf8(text).ok()?;
    let (sign, digits) = match s.as_bytes().first() {
        Some(b'-') => (-1i128, &s[1..]),
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

fn split_key(line: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
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
    Some((key.to_vec(), operand.to_vec()))
}

struct Cursor {
    line: Vec<u8>,
    key: Vec<u8>,
    operand: Vec<u8>,
}

impl Cursor {
    fn load(line: Vec<u8>) -> Self {
        let (key, operand) = split_key(&line).unwrap_or_default();
        Self { line, key, operand }
    }

    fn reassign(&mut self, lines: &mut Lines, i: usize, new: Vec<u8>) {
        lines.set(i, new.clone());
        *self = Cursor::load(new);
    }
}

/// One pass: zero-extension rewrites plus every flag-driven fusion.
pub(crate) fn forward_pass(contents: &[u8], abi: Abi) -> Vec<u8> {
    let mut lines = Lines::parse(contents);
    let mut ze = ZeroExtend::new(abi, contents);

    // Previous conditional branch's cc, valid while flags stay preserved.
    let mut last_jmp: Vec<u8> = Vec::new();
    // Previous real instruction, for the rep-ret fix only.
    let mut last_instruction: Vec<u8> = Vec::new();

    for i in 0..lines.len() {
        if let Some(new) = {
            let current = lines.get(i).to_vec();
            ze.feed(&current, || lines.flag_never_used(i))
        } {
            lines.set(i, new);
        }

        let mut cur = Cursor::load(lines.get(i).to_vec());

        if cur.line.contains(&b';') {
            last_jmp.clear();
            last_instruction.clear();
            continue;
        }
        if cur.key.is_empty() {
            continue;
        }
        if cur.key == b"lock" && !cur.operand.is_empty() {
            if let Some((sub, rest)) = split_key(&cur.operand) {
                let mut merged = b"lock\t".to_vec();
                merged.extend_from_slice(&sub);
                cur.key = merged;
                cur.operand = rest;
            }
        }

        // A quoted .file is debug clutter; a numbered one is referenced by
        // .loc and must stay.
        if cur.key == b".file" {
            if cur.operand.first() == Some(&b'"') {
                cur.reassign(&mut lines, i, Vec::new());
            }
            continue;
        }

        // Overuse of the rep prefix (openssl does this) costs a byte after
        // instructions that don't need the return-branch padding. The
        // inverse fix, inserting `rep` before a `ret` that follows a
        // branch, is retired: current CPUs no longer want the padding.
        if cur.key == b"rep" && cur.operand == b"ret" {
            const NO_PAD_NEEDED: [&[u8]; 10] = [
                b"add", b"cltq", b"cmov", b"lea", b"mov", b"or", b"pop", b"pxor", b"xor", b"sub",
            ];
            if NO_PAD_NEEDED
                .iter()
                .any(|prefix| last_instruction.starts_with(prefix))
            {
                cur.reassign(&mut lines, i, b"\tret".to_vec());
            }
        }
        if !cur.key.starts_with(b".cfi_") && !cur.key.starts_with(b".p2align") {
            last_instruction = cur.key.clone();
        }

        // Branch-pair fusion: a second branch over the same flags can often
        // test a strictly stronger condition.
        //   je L1            je L1
        //   jbe L2    ==>    jb L2
        if cur.key.first() == Some(&b'j') && core_x86::is_cc(&cur.key[1..]) {
            let cur_cc = cur.key[1..].to_vec();
            if let Some(fused) = fused_pair(&last_jmp, &cur_cc) {
                let mut new = b"\tj".to_vec();
                new.extend_from_slice(fused);
                new.push(b'\t');
                new.extend_from_slice(&cur.operand);
                cur.reassign(&mut lines, i, new);
            }
            last_jmp = cur_cc;
        } else if !last_jmp.is_empty() && !lines.preserve_flags(i) {
            last_jmp.clear();
        }

        // andq/orq on memory with an immediate whose top half is all-ones /
        // all-zeros only needs the 32-bit form (flags change, so they must
        // be dead).
        if cur.key.starts_with(b"and") || cur.key.starts_with(b"or") {
            let line = cur.line.clone();
            if let Some(caps) = ANDQ_ORQ_MEM.captures(&line) {
                if lines.flag_never_used(i) {
                    let imm = parse_int(&caps[2]).map(|v| {
                        if v < 0 { v + (1i128 << 64) } else { v }
                    });
                    if let Some(imm) = imm {
                        let and_form = &caps[1] == b"and";
                        let new = if and_form && (imm >> 32) == 0xffff_ffff {
                            Some(replace_once(&line, b"andq", b"andl"))
                        } else if !and_form && (imm >> 32) == 0 {
                            Some(replace_once(&line, b"orq", b"orl"))
                        } else {
                            None
                        };
                        if let Some(new) = new {
                            cur.reassign(&mut lines, i, new);
                        }
                    }
                }
            }
        }

        // add/sub $1 -> inc/dec, only in front of an instruction that sets
        // flags without reading them (inc/dec leave C alone).
        if (cur.key.starts_with(b"add")
            || cur.key.starts_with(b"sub")
            || cur.key.starts_with(b"lock\tadd")
            || cur.key.starts_with(b"lock\tsub"))
            && cur.operand.starts_with(b"$1,")
        {
            let next_sets = match lines_kind(&mut lines, i + 1) {
                Some(LineKind::NotUseSet) => true,
                Some(LineKind::Label) => {
                    matches!(lines_kind(&mut lines, i + 2), Some(LineKind::NotUseSet))
                }
                _ => false,
            };
            if next_sets {
                let newkey = replace_once(&replace_once(&cur.key, b"add", b"inc"), b"sub", b"dec");
                let mut new = b"\t".to_vec();
                new.extend_from_slice(&newkey);
                new.push(b'\t');
                new.extend_from_slice(trim(&cur.operand[3..]));
                cur.reassign(&mut lines, i, new);
            }
        }

        // cmp $k; ja/jbe ... -> cmp $(k+1); jae/jb when every flag user is
        // an a/be form and k+1 still encodes.
        if cur.key.starts_with(b"cmp") && cur.operand.first() == Some(&b'$') {
            if let Some(caps) = CMP_IMM.captures(&cur.line.clone()) {
                let suffix = caps[1][0];
                let Some(mut imm) = parse_int(&caps[2]) else {
                    continue;
                };
                if imm < 0 {
                    imm += 1i128 << width_bits(suffix);
                }
                if skip_a_be_conversion(suffix, imm) {
                    continue;
                }
                let mut users = Vec::new();
                let ok = lines.visit_flag_users(i, |j, line| {
                    if A_BE.is_match(line) {
                        users.push(j);
                        true
                    } else {
                        false
                    }
                });
                if !ok {
                    continue;
                }
                if users.is_empty() {
                    // No one reads the flags: the compare itself is dead
                    // (usually fallout of __builtin_unreachable).
                    cur.reassign(&mut lines, i, Vec::new());
                    continue;
                }
                let mut new = format!("\tcmp{}\t${}", suffix as char, imm + 1).into_bytes();
                new.extend_from_slice(&caps[3]);
                cur.reassign(&mut lines, i, new);
                rewrite_users(&mut lines, &users, &A_BE, &[("a", "ae"), ("be", "b")]);
                continue;
            }
        }

        // cmp %r1,%r2; ja/jbe -> cmp %r2,%r1; jb/jae. Works for comis* too.
        if (cur.key.starts_with(b"cmp")
            || cur.key.starts_with(b"comis")
            || cur.key.starts_with(b"vcomis"))
            && cur.operand.first() == Some(&b'%')
        {
            if let Some(caps) = CMP_REG_REG.captures(&cur.line.clone()) {
                let mut users = Vec::new();
                let ok = lines.visit_flag_users(i, |j, line| {
                    if A_BE.is_match(line) {
                        users.push(j);
                        true
                    } else {
                        false
                    }
                });
                if !ok || users.is_empty() {
                    continue;
                }
                let mut new = b"\t".to_vec();
                new.extend_from_slice(&caps[1]);
                new.push(b'\t');
                new.extend_from_slice(&caps[3]);
                new.push(b',');
                new.extend_from_slice(&caps[2]);
                cur.reassign(&mut lines, i, new);
                rewrite_users(&mut lines, &users, &A_BE, &[("a", "b"), ("be", "ae")]);
                continue;
            }
        }

        // The same swap for the reg/mem forms.
        if cur.key.starts_with(b"cmp") {
            if let Some(caps) = CMP_REG_MEM.captures(&cur.line.clone()) {
                let mut users = Vec::new();
                let ok = lines.visit_flag_users(i, |j, line| {
                    if A_BE.is_match(line) {
                        users.push(j);
                        true
                    } else {
                        false
                    }
                });
                if !ok || users.is_empty() {
                    continue;
                }
                let mut new = b"\t".to_vec();
                new.extend_from_slice(&caps[1]);
                new.push(b'\t');
                new.extend_from_slice(&caps[3]);
                new.push(b',');
                new.extend_from_slice(&caps[2]);
                cur.reassign(&mut lines, i, new);
                rewrite_users(&mut lines, &users, &A_BE, &[("a", "b"), ("be", "ae")]);
                continue;
            }
        }

        // bt $k; jb/jae -> test $(1<<k); jne/je (shorter, no flags beyond
        // C/Z involved). Hand-written openssl assembly is full of these.
        if cur.key.starts_with(b"bt") {
            if let Some(caps) = BT.captures(&cur.line.clone()) {
                let mut suffix = caps[1].to_vec();
                let Some(bit) = parse_int(&caps[2]) else {
                    continue;
                };
                let mut dst = caps[3].to_vec();
                if suffix.is_empty() {
                    if let Some(name) = dst.strip_prefix(b"%") {
                        if let Some(bits) = core_x86::reg_bits(name) {
                            suffix = core_x86::width_suffix(bits).to_vec();
                        }
                    }
                }
                if suffix.is_empty() {
                    continue;
                }
                let limit = width_bits(suffix[0]).min(32);
                if !(0..limit as i128).contains(&bit) {
                    continue;
                }
                let mut users = Vec::new();
                let ok = lines.visit_flag_users(i, |j, line| {
                    if B_AE.is_match(line) {
                        users.push(j);
                        true
                    } else {
                        false
                    }
                });
                if !ok || users.is_empty() {
                    continue;
                }
                if bit < 8 && suffix != b"b" {
                    if let Some(reg8) = dst
                        .strip_prefix(b"%")
                        .and_then(|name| core_x86::reg_to_width(name, 8))
                    {
                        suffix = b"b".to_vec();
                        dst = b"%".to_vec();
                        dst.extend_from_slice(reg8);
                    }
                }
                let mut new = b"\ttest".to_vec();
                new.extend_from_slice(&suffix);
                new.extend_from_slice(format!("\t${},", 1i64 << bit).as_bytes());
                new.extend_from_slice(&dst);
                cur.reassign(&mut lines, i, new);
                rewrite_users(&mut lines, &users, &B_AE, &[("b", "ne"), ("ae", "e")]);
                continue;
            }
        }

        // After cmp $0 / test %r,%r the sign flag alone decides l/ge.
        if (cur.key.starts_with(b"cmp") || cur.key.starts_with(b"test"))
            && matches!(cur.operand.first(), Some(&b'$') | Some(&b'%'))
        {
            let matches_zero_test = match CMP_ZERO.captures(&cur.line) {
                Some(caps) => match (caps.get(1), caps.get(2)) {
                    (Some(r1), Some(r2)) => r1.as_bytes() == r2.as_bytes(),
                    _ => true,
                },
                None => false,
            };
            if matches_zero_test {
                let Some(users) = lines.flag_users(i) else {
                    continue;
                };
                if users.is_empty() {
                    continue;
                }
                for &j in &users {
                    let line = lines.get(j).to_vec();
                    if let Some(caps) = JL_JGE.captures(&line) {
                        let conv: &[u8] = if &caps[2] == b"l" { b"s" } else { b"ns" };
                        let mut new = b"\t".to_vec();
                        new.extend_from_slice(&caps[1]);
                        new.extend_from_slice(conv);
                        new.push(b' ');
                        new.extend_from_slice(&line[caps.get(0).unwrap().end()..]);
                        lines.set(j, new);
                    }
                }
                continue;
            }
        }
    }

    lines.join()
}

fn lines_kind(lines: &mut Lines, i: usize) -> Option<LineKind> {
    if i < lines.len() {
        Some(lines.line_kind(i))
    } else {
        None
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |pos| pos + 1);
    &bytes[start..end]
}

fn replace_once(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if let Some(pos) = haystack
        .windows(needle.len())
        .position(|window| window == needle)
    {
        let mut out = haystack[..pos].to_vec();
        out.extend_from_slice(replacement);
        out.extend_from_slice(&haystack[pos + needle.len()..]);
        out
    } else {
        haystack.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> String {
        String::from_utf8(forward_pass(text.as_bytes(), Abi::Lp64)).unwrap()
    }

    #[test]
    fn cmp_imm_range_fusion() {
        assert_eq!(
            run("\tcmpb\t$2,%al\n\tjbe\t.L1\n.L1:\n\tret\n"),
            "\tcmpb\t$3,%al\n\tjb\t.L1\n.L1:\n\tret\n"
        );
        // 0xff cannot become 0x100 in the byte form.
        assert_eq!(
            run("\tcmpb\t$255,%al\n\tjbe\t.L1\n.L1:\n\tret\n"),
            "\tcmpb\t$255,%al\n\tjbe\t.L1\n.L1:\n\tret\n"
        );
        // A non-a/be user blocks the conversion.
        assert_eq!(
            run("\tcmpb\t$2,%al\n\tje\t.L1\n.L1:\n\tret\n"),
            "\tcmpb\t$2,%al\n\tje\t.L1\n.L1:\n\tret\n"
        );
    }

    #[test]
    fn dead_compare_is_deleted() {
        assert_eq!(run("\tcmpb\t$2,%al\n\tret\n"), "\tret\n");
    }

    #[test]
    fn cmp_reg_swap_fusion() {
        assert_eq!(
            run("\tcmpq\t%rsi,%rdi\n\tja\t.L1\n.L1:\n\tret\n"),
            "\tcmpq\t%rdi,%rsi\n\tjb\t.L1\n.L1:\n\tret\n"
        );
        assert_eq!(
            run("\tcomisd\t%xmm1,%xmm0\n\tjbe\t.L1\n.L1:\n\tret\n"),
            "\tcomisd\t%xmm0,%xmm1\n\tjae\t.L1\n.L1:\n\tret\n"
        );
    }

    #[test]
    fn cmp_mem_swap_fusion() {
        assert_eq!(
            run("\tcmpq\t8(%rdi),%rax\n\tja\t.L1\n.L1:\n\tret\n"),
            "\tcmpq\t%rax,8(%rdi)\n\tjb\t.L1\n.L1:\n\tret\n"
        );
    }

    #[test]
    fn bt_becomes_test() {
        assert_eq!(
            run("\tbtl\t$3, %eax\n\tjb\t.L1\n.L1:\n\tret\n"),
            "\ttestb\t$8,%al\n\tjne\t.L1\n.L1:\n\tret\n"
        );
        // Bit 9 needs the wide form.
        assert_eq!(
            run("\tbtl\t$9, %eax\n\tjae\t.L1\n.L1:\n\tret\n"),
            "\ttestl\t$512,%eax\n\tje\t.L1\n.L1:\n\tret\n"
        );
    }

    #[test]
    fn sign_flag_fusion() {
        assert_eq!(
            run("\ttestl\t%eax, %eax\n\tjl\t.L1\n.L1:\n\tret\n"),
            "\ttestl\t%eax, %eax\n\tjs .L1\n.L1:\n\tret\n"
        );
        assert_eq!(
            run("\tcmpq\t$0,8(%rsp)\n\tjge\t.L1\n.L1:\n\tret\n"),
            "\tcmpq\t$0,8(%rsp)\n\tjns .L1\n.L1:\n\tret\n"
        );
    }

    #[test]
    fn branch_pair_fusion() {
        assert_eq!(
            run("\tcmpl\t%esi, %edi\n\tje\t.L1\n\tjbe\t.L2\n.L1:\n.L2:\n\tret\n"),
            "\tcmpl\t%esi, %edi\n\tje\t.L1\n\tjb\t.L2\n.L1:\n.L2:\n\tret\n"
        );
        // An intervening flag-setting instruction kills the pairing.
        assert_eq!(
            run("\tje\t.L1\n\taddl\t$2, %eax\n\tjbe\t.L2\n.L1:\n.L2:\n\tret\n"),
            "\tje\t.L1\n\taddl\t$2, %eax\n\tjbe\t.L2\n.L1:\n.L2:\n\tret\n"
        );
    }

    #[test]
    fn andq_orq_memory_narrowing() {
        assert_eq!(
            run("\tandq\t$-2, 8(%rsp)\n\tret\n"),
            "\tandl\t$-2, 8(%rsp)\n\tret\n"
        );
        assert_eq!(
            run("\torq\t$255, 8(%rsp)\n\tret\n"),
            "\torl\t$255, 8(%rsp)\n\tret\n"
        );
        // Live flags: untouched.
        assert_eq!(
            run("\tandq\t$-2, 8(%rsp)\n\tje\t.L1\n.L1:\n\tret\n"),
            "\tandq\t$-2, 8(%rsp)\n\tje\t.L1\n.L1:\n\tret\n"
        );
    }

    #[test]
    fn add_one_becomes_inc_before_flag_setter() {
        assert_eq!(
            run("\taddq\t$1, %rax\n\tcmpq\t%rbx, %rax\n\tret\n"),
            "\tincq\t%rax\n\tcmpq\t%rbx, %rax\n\tret\n"
        );
        // Followed by a flag reader: must keep add (carry differs).
        assert_eq!(
            run("\tsubq\t$1, %rax\n\tjbe\t.L1\n.L1:\n\tret\n"),
            "\tsubq\t$1, %rax\n\tjbe\t.L1\n.L1:\n\tret\n"
        );
    }

    #[test]
    fn rep_ret_demoted_after_simple_instruction() {
        assert_eq!(
            run("\tmovl\t$1, %eax\n\trep\tret\n"),
            "\tmovl\t$1, %eax\n\tret\n"
        );
        assert_eq!(
            run("\tje\t.L1\n.L1:\n\trep\tret\n"),
            "\tje\t.L1\n.L1:\n\trep\tret\n"
        );
    }

    #[test]
    fn quoted_file_lines_are_dropped() {
        assert_eq!(run("\t.file\t\"x.c\"\n\tret\n"), "\tret\n");
        assert_eq!(
            run("\t.file\t1 \"x.c\"\n\tret\n"),
            "\t.file\t1 \"x.c\"\n\tret\n"
        );
    }

    #[test]
    fn zero_extension_rewrites_flow_through() {
        assert_eq!(run("\tmovl\t$0, %eax\n\tret\n"), "\txor\t%eax,%eax\n\tret\n");
    }
}

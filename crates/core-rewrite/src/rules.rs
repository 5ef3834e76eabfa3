//! Pattern-substitution rule lists.
//!
//! Two families: one-time rules applied exactly once, and repeat rules the
//! scheduler iterates to a fixed point. Rules that need arithmetic or a
//! same-group check in the replacement use a callback; a callback that
//! cannot prove its conditions returns the match unchanged.

use std::sync::LazyLock;

use regex::bytes::{Captures, Regex};

use core_x86::Abi;

pub(crate) enum Rep {
    Text(&'static [u8]),
    Func(fn(&Captures<'_>) -> Vec<u8>),
}

pub(crate) struct Rule {
    pub re: Regex,
    pub rep: Rep,
}

impl Rule {
    fn text(pattern: &str, rep: &'static [u8]) -> Self {
        Self {
            re: Regex::new(pattern).unwrap(),
            rep: Rep::Text(rep),
        }
    }

    fn func(pattern: &str, rep: fn(&Captures<'_>) -> Vec<u8>) -> Self {
        Self {
            re: Regex::new(pattern).unwrap(),
            rep: Rep::Func(rep),
        }
    }
}

pub(crate) fn apply_rules(contents: &[u8], rules: &[Rule]) -> Vec<u8> {
    let mut contents = contents.to_vec();
    for rule in rules {
        contents = match &rule.rep {
            Rep::Text(rep) => rule.re.replace_all(&contents, *rep).into_owned(),
            Rep::Func(f) => rule.re.replace_all(&contents, f).into_owned(),
        };
    }
    contents
}

fn keep(caps: &Captures<'_>) -> Vec<u8> {
    caps[0].to_vec()
}

fn parse_i128(text: &[u8]) -> Option<i128> {
    let s = std::str::from_utf8(text).ok()?;
    let (sign, digits) = match s.as_bytes().first() {
        Some(b'-') => (-1i128, &s[1..]),
        Some(b'+') => (1, &s[1..]),
        _ => (1, s),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i128>().ok()?
    };
    Some(sign * value)
}

// movq %r1,%r2 feeding a 32-bit mask only needs the 32-bit move.
fn shrink_mov_before_and(caps: &Captures<'_>) -> Vec<u8> {
    if caps[2] != caps[4] {
        return keep(caps);
    }
    let mut out = b"\tmovl\t%e".to_vec();
    out.extend_from_slice(&caps[1]);
    out.extend_from_slice(b",%e");
    out.extend_from_slice(&caps[2]);
    out.extend_from_slice(&caps[3]);
    out
}

// mov %r1,%r2; test %r2,%r2 -> test the source instead, so the move can die.
fn retarget_test_after_mov(caps: &Captures<'_>) -> Vec<u8> {
    if caps[5] != caps[3] || caps[6] != caps[3] {
        return keep(caps);
    }
    let mut out = caps[1].to_vec();
    out.extend_from_slice(b"\ttest");
    out.extend_from_slice(&caps[4]);
    out.extend_from_slice(b"\t%");
    out.extend_from_slice(&caps[2]);
    out.extend_from_slice(b",%");
    out.extend_from_slice(&caps[2]);
    out
}

// add $imm,%r1; mov off(%r1),%r2 -> fold the addend into the displacement.
fn hoist_mov_over_add(caps: &Captures<'_>) -> Vec<u8> {
    if caps[4] != caps[2] {
        return keep(caps);
    }
    let r1 = &caps[2];
    let r2 = &caps[5];
    if r2.starts_with(r1) || (r2.starts_with(b"mm") && r2.get(2).is_some_and(u8::is_ascii_digit)) {
        return keep(caps);
    }
    let Some(imm) = parse_i128(&caps[1]) else {
        return keep(caps);
    };
    let off = if caps[3].is_empty() {
        0
    } else {
        match parse_i128(&caps[3]) {
            Some(off) => off,
            None => return keep(caps),
        }
    };
    let mut out = format!("\tmov\t{}(%", imm + off).into_bytes();
    out.extend_from_slice(r1);
    out.extend_from_slice(b"),%");
    out.extend_from_slice(r2);
    // The add survives unless the load overwrote its register family.
    if core_x86::reg_to_width(r1, 64) != core_x86::reg_to_width(r2, 64) {
        out.extend_from_slice(format!("\n\tadd\t${imm},%").as_bytes());
        out.extend_from_slice(r1);
    }
    out
}

// testl with a one-byte mask in the upper bytes reads the same flag from a
// byte probe at the shifted offset.
fn narrow_testl_to_testb(caps: &Captures<'_>) -> Vec<u8> {
    let (Some(imm), Some(off)) = (parse_i128(&caps[1]), parse_i128(&caps[2])) else {
        return keep(caps);
    };
    let (imm, off) = if imm < 0x100 {
        return keep(caps);
    } else if (imm & 0xff00) == imm {
        (imm >> 8, off + 1)
    } else if (imm & 0xff_0000) == imm {
        (imm >> 16, off + 2)
    } else if (imm & 0xff00_0000) == imm {
        (imm >> 24, off + 3)
    } else {
        return keep(caps);
    };
    format!("\ttestb\t${imm},{off}(").into_bytes()
}

// shr $k; shl $k == clear the low k bits.
fn shr_shl_to_and(caps: &Captures<'_>) -> Vec<u8> {
    if caps[3] != caps[1] || caps[4] != caps[2] {
        return keep(caps);
    }
    let Some(bits) = parse_i128(&caps[1]) else {
        return keep(caps);
    };
    let mask = -1i64 << bits;
    let mut out = format!("\tand\t${mask},").into_bytes();
    out.extend_from_slice(&caps[2]);
    out
}

fn shr1_shl1_to_and(caps: &Captures<'_>) -> Vec<u8> {
    if caps[2] != caps[1] {
        return keep(caps);
    }
    let mut out = b"\tand\t$-2,".to_vec();
    out.extend_from_slice(&caps[1]);
    out
}

// xor $IMM; and $IMM == not; and $IMM (IMM is typically 1).
fn xor_and_to_not(caps: &Captures<'_>) -> Vec<u8> {
    if caps[5] != caps[2] || caps[6] != caps[3] {
        return keep(caps);
    }
    let mut out = b"\tnot".to_vec();
    out.extend_from_slice(&caps[1]);
    out.push(b'\t');
    out.extend_from_slice(&caps[3]);
    out.push(b'\n');
    out.extend_from_slice(&caps[4]);
    out
}

// 0(%rbp,%r,1) -> (%r,%rbp): drops both the displacement byte and the scale.
fn swap_rbp_base(caps: &Captures<'_>) -> Vec<u8> {
    let index = &caps[3];
    if index.starts_with(b"bp") || index.starts_with(b"13") {
        return keep(caps);
    }
    let mut out = caps[1].to_vec();
    out.extend_from_slice(b"(%r");
    out.extend_from_slice(index);
    out.extend_from_slice(b",%r");
    out.extend_from_slice(&caps[2]);
    out.push(b')');
    out
}

// GCC occasionally emits the same prefetch line twice in a row.
fn dedup_prefetch(caps: &Captures<'_>) -> Vec<u8> {
    let first = &caps[1];
    let mut out = first.to_vec();
    let mut rest = &caps[2][..];
    while rest.starts_with(first) {
        rest = &rest[first.len()..];
    }
    out.extend_from_slice(rest);
    out
}

// vmovdqa mem,%x; ...; vpcmpeq %y,%x,%x -> compare straight from memory.
fn fuse_vector_load_compare(caps: &Captures<'_>) -> Vec<u8> {
    let dst = &caps[2];
    if caps[6] != *dst || caps[7] != *dst {
        return keep(caps);
    }
    if caps[5].starts_with(dst) {
        return keep(caps);
    }
    let mut out = b"\t".to_vec();
    out.extend_from_slice(&caps[4]);
    out.extend_from_slice(&caps[1]);
    out.push(b',');
    out.extend_from_slice(&caps[5]);
    out.push(b',');
    out.extend_from_slice(dst);
    out.push(b'\n');
    out.extend_from_slice(&caps[3]);
    out
}

// Store to the stack then reload: keep the store, satisfy the reload from
// the register. (Common when returning padded structures.)
fn forward_stack_store(caps: &Captures<'_>) -> Vec<u8> {
    if caps[4] != caps[1] || caps[5] != caps[3] {
        return keep(caps);
    }
    let mut out = b"\tmov".to_vec();
    out.extend_from_slice(&caps[1]);
    out.push(b'\t');
    out.extend_from_slice(&caps[2]);
    out.push(b',');
    out.extend_from_slice(&caps[3]);
    out.extend_from_slice(b"\n\tmov\t");
    out.extend_from_slice(&caps[2]);
    out.push(b',');
    out.extend_from_slice(&caps[6]);
    out.push(b'\n');
    out
}

fn forward_vector_stack_store(caps: &Captures<'_>) -> Vec<u8> {
    if caps[4] != caps[3] {
        return keep(caps);
    }
    let mut out = caps[1].to_vec();
    out.extend_from_slice(b"\tvmovd\t%xmm");
    out.extend_from_slice(&caps[2]);
    out.extend_from_slice(b",%");
    out.extend_from_slice(&caps[5]);
    out.push(b'\n');
    out
}

// mov %rX,%rX (8/16/64-bit) is a no-op; the 32-bit form zero-extends and
// must stay.
fn drop_self_move(caps: &Captures<'_>) -> Vec<u8> {
    if caps[1] != caps[2] {
        return keep(caps);
    }
    match core_x86::reg_bits(&caps[1]) {
        Some(8) | Some(16) | Some(64) => Vec::new(),
        _ => keep(caps),
    }
}

fn free_null_check_call(caps: &Captures<'_>) -> Vec<u8> {
    if caps[3] != caps[1] {
        return keep(caps);
    }
    caps[2].to_vec()
}

fn free_null_check_tail(caps: &Captures<'_>) -> Vec<u8> {
    if caps[3] != caps[1] {
        return keep(caps);
    }
    caps[2].to_vec()
}

fn x32_free_null_check_call(caps: &Captures<'_>) -> Vec<u8> {
    if caps[3] != caps[1] {
        return keep(caps);
    }
    caps[2].to_vec()
}

fn x32_free_null_check_move(caps: &Captures<'_>) -> Vec<u8> {
    if caps[2] != caps[1] || caps[5] != caps[1] || caps[6] != caps[3] {
        return keep(caps);
    }
    caps[4].to_vec()
}

pub(crate) static ONETIME: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // ".p2align 1" right before ".p2align 4" achieves nothing.
        Rule::text(r"(?m)^\t\.p2align 1\n(\t\.p2align 4)$", b"${1}"),
        // pslld $1 is a doubling; padd is one byte shorter and faster.
        Rule::text(
            r"(?m)^\tpslld\t\$1, ?(%[xy]mm\d\d?)$",
            b"\tpaddd\t${1},${1}",
        ),
        Rule::text(
            r"(?m)^\tvpslld\t\$1, ?(%[xy]mm\d\d?), ?(%[xy]mm\d\d?)$",
            b"\tvpaddd\t${1},${1},${2}",
        ),
        Rule::text(
            r"(?m)^\tpsllq\t\$1, ?(%[xy]mm\d\d?)$",
            b"\tpaddq\t${1},${1}",
        ),
        Rule::text(
            r"(?m)^\tvpsllq\t\$1, ?(%[xy]mm\d\d?), ?(%[xy]mm\d\d?)$",
            b"\tvpaddq\t${1},${1},${2}",
        ),
        // Replacing pd with ps would also be legal for the bitwise ops and
        // is what ICC does, but it misfired on AVX inputs where the two
        // encodings are the same length anyway; left off.
        // Rule::text(r"(?m)^\t(mov[alhu]|andn?|x?or)pd\t", b"\t${1}ps\t"),
        //
        // Removing "insertps $15/$0xe, %x, %x" after a movd looked safe but
        // is not when the upper lanes are observed; left off.
        // Rule::func(r"(?m)^(\tv?movd\t%\w+, ?(%xmm\d\d?))\n\tv?insertps\t\$(?:15|0xe), ?...", drop_insertps),
        Rule::func(
            r"(?m)^\tmovq?\t%r([a-z]+), ?%r([a-z]+)(\n\tandl?\t\$\d+, ?%e([a-z]+))$",
            shrink_mov_before_and,
        ),
        Rule::func(
            r"(?m)^(\tmov[bwlq]?\t%(\w+), ?%(\w+)\n)\ttest([bwlq]?)\t%(\w+), ?%(\w+)$",
            retarget_test_after_mov,
        ),
        Rule::func(
            r"(?m)^\tadd[lq]?\t\$(-?\d+), ?%(\w+)\n\tmov[bwlq]?\t(-?\d*)\(%(\w+)\), ?%(\w+)$",
            hoist_mov_over_add,
        ),
        Rule::func(
            r"(?m)^\ttestl\t\$((?:0x)?[\da-fA-F]{3,}), ?(-?(?:0x)?[\da-fA-F]+)\(",
            narrow_testl_to_testb,
        ),
        // Fusing consecutive byte/word stores into one wider store is now
        // done by GCC itself; the b->w->l->q ladder stays off.
        // Rule::func(r"(?m)^\tmov(b)\t\$(-?\d+), ?(-?\d*)(\([\w%,]+\))\n\tmovb\t...", fuse_consecutive_stores),
        Rule::func(
            r"(?m)^\tshr[bwlq]?\t\$([1-9]|[12][0-9]|3[01]), ?([^$;\n]+)\n\tshl[bwlq]?\t\$(\d+), ?([^$;\n]+)$",
            shr_shl_to_and,
        ),
        Rule::func(
            r"(?m)^\tshr[bwlq]?\t([^$;\n]+)\n\tshl[bwlq]?\t([^$;\n]+)$",
            shr1_shl1_to_and,
        ),
        Rule::func(
            r"(?m)^\txor([bwlq]?)\t\$(\d+), ?(%\w+)\n(\tand[bwlq]?\t\$(\d+), ?(%\w+)\n)",
            xor_and_to_not,
        ),
        Rule::func(
            r"(?m)^([$\w \t,;]*[ \t,])0?\(%r(bp|13),%r(\w+)(?:,1)?\)",
            swap_rbp_base,
        ),
        // An indirect jump followed by data or another function keeps the
        // frontend from decoding past the jump.
        Rule::text(
            r"(?m)^(\tjmp[lq]?[ \t]+\*[^;\n]*\n)(\t\.p2align|\t\.section|\t\.cfi_|[.$\w]+:\n)",
            b"${1}\tud2\n${2}",
        ),
        Rule::func(
            r"(?m)^(\tprefetch\w+\t[^;\n]*\n)((?:\tprefetch\w+\t[^;\n]*\n)+)",
            dedup_prefetch,
        ),
        Rule::func(
            r"(?m)^\tv(?:movdq[au]|mov[au]p[sd])\t([^;\n]*), ?(%[xy]mm\d+)\n((?:\tadd[bwlq]?\t\$\d+, ?%\w+\n){0,2})\t(vpcmpeq[bwdq]\t|vcmpeqp[sd]\t|vcmpneqp[sd]\t|vcmpneq_oqp[sd]\t|vcmpp[sd]\t\$(?:[0347]|12), ?)(%[xy]mm\d+), ?(%[xy]mm\d+), ?(%[xy]mm\d+)\n",
            fuse_vector_load_compare,
        ),
        Rule::func(
            r"(?m)^\tmov([bwlq])\t(%\w+), ?([-\d]*\(%[er]sp\))\n\tmov([bwlq])\t([-\d]*\(%[er]sp\)), ?(%\w+)\n",
            forward_stack_store,
        ),
        Rule::func(
            r"(?m)^(\tvmov(?:[au]ps|dq[au])\t%[x-z]mm(\d+), ?([-\d]*\(%[er]sp\))\n)\tmov[lq]?\t([-\d]*\(%[er]sp\)), ?%(r\d+d?|[er][a-d]x|[er]bp|[er][sd]i)\n",
            forward_vector_stack_store,
        ),
        Rule::func(r"(?m)^\tmov[bwq]?\t%(\w+), ?%(\w+)\n", drop_self_move),
        // mov ...,%rsp immediately overwritten by lea off(%rbp),%rsp.
        Rule::text(
            r"(?m)^\tmovq?\t[^;\n]+, ?%rsp\n((?:[.\w]+:\n)*\tleaq?\t-?\d*\(%rbp\), ?%rsp\n)",
            b"${1}",
        ),
        // vbroadcast+vinsert and vpunpcklqdq+vinserti128 fusions produced
        // wrong lanes on at least one input; both stay off.
        // Rule::text(r"(?m)^\t(vp?broadcast([bwdq]|s[sd]))\t...", b"..."),
        // Rule::text(r"(?m)^\tvpunpcklqdq\t%xmm(\d+), ?%xmm\1, ?%xmm(\d+)\n\tvinserti128\t...", b"..."),
        //
        // Collapsing _Rb_tree_increment(PK...) onto the non-const prototype
        // upset LTO symbol resolution; off.
        // Rule::text(r"(?m)^\t(call[lq]?|jmp[lq]?)\t_ZSt18_Rb_tree_(de|in)crementPKSt18_Rb_tree_node_base$", b"..."),
        //
        // std::exception::~exception is a no-op.
        Rule::text(r"(?m)^\tcall[lq]?\t_ZNSt9exceptionD2Ev(@PLT)?\n", b""),
        Rule::text(r"(?m)^\tjmp[lq]?\t_ZNSt9exceptionD2Ev(@PLT)?$", b"\tret"),
    ]
});

pub(crate) static ONETIME_LP64: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // fopen64 and fopen alias each other on LP64.
        Rule::text(
            r"(?m)^(\t(?:jmp|call)q?\tfopen)64((?:@PLT|@plt)?)$",
            b"${1}${2}",
        ),
        // free/delete accept null; the guard is pure overhead.
        Rule::func(
            r"(?m)^\ttestq?\t%rdi, ?%rdi\n\tje\t([.\w]+)\n(\tcallq?\t(?:c?free|_Zd[al]Pv)(?:@PLT)?\n([.\w]+):\n)",
            free_null_check_call,
        ),
        Rule::func(
            r"(?m)^\ttestq?\t%rdi, ?%rdi\n\tje\t([.\w]+)\n(\tjmpq?\t(?:c?free|_Zd[al]Pv)(?:@PLT)?\n(?:\t\.p2align [ ,\d]+\n)*([.\w]+):\n\t(?:rep\t)?retq?\n)",
            free_null_check_tail,
        ),
    ]
});

pub(crate) static ONETIME_X32: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule::func(
            r"(?m)^\ttestl?\t%edi, ?%edi\n\tje\t([.\w]+)\n(\tcalll?\t(?:c?free|_Zd[al]Pv)(?:@PLT)?\n([.\w]+):\n)",
            x32_free_null_check_call,
        ),
        Rule::func(
            r"(?m)^\ttestl?\t(%\w+), ?(%\w+)\n\tje\t([.\w]+)\n(\tmovl?\t(%\w+), ?%edi\n\tcalll?\t(?:c?free|_Zd[al]Pv)(?:@PLT)?\n([.\w]+):\n)",
            x32_free_null_check_move,
        ),
    ]
});

pub(crate) fn onetime_rules_for(abi: Abi) -> Vec<&'static [Rule]> {
    let mut lists: Vec<&'static [Rule]> = vec![&ONETIME];
    match abi {
        Abi::Lp64 => lists.push(&ONETIME_LP64),
        Abi::X32 => lists.push(&ONETIME_X32),
    }
    lists
}

pub(crate) static REPEAT: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // Alignment travels in front of its label so a dead label takes the
        // padding with it.
        Rule::text(r"(?m)^(\.L\w+:\n)((?:\t\.p2align [,\d]+\n)+)", b"${2}${1}"),
        // Stronger alignment first.
        Rule::text(
            r"(?m)^(\t\.p2align 3\n)(\t\.p2align 4(?:,[,\d]+)?\n)",
            b"${2}${1}",
        ),
        Rule::text(
            r"(?m)^(\t\.p2align 4,,[1-9]\d)\n\t\.p2align 4,,\d$",
            b"${1}",
        ),
        Rule::text(r"(?m)^(\t\.p2align 3)\n\t\.p2align 2$", b"${1}"),
        // Two rets separated only by alignment and a label need one ret.
        Rule::text(
            r"(?m)^\t(?:rep\t)?ret\n((?:\t\.p2align [,\d]+\n)*\.L\w+:\n\t(?:rep\t)?ret\n)",
            b"${1}",
        ),
        Rule::text(
            r"(?m)^\tvzeroupper\n\t(?:rep\t)?ret\n((?:\t\.p2align [,\d]+\n)*\.L\w+:\n\tvzeroupper\n\t(?:rep\t)?ret\n)",
            b"${1}",
        ),
        // Everything after an unconditional exit up to the next label is
        // dead (jump-chain and free-guard removals leave these behind).
        Rule::text(
            r"(?m)^\t((?:rep\t)?ret|jmp\t[^\n]*)\n(?:(?:\t\.p2align [,\d]+\n)*(?:\tjmp\t[^;\n]+\n|\t(?:rep\t)?ret\n))+",
            b"\t${1}\n",
        ),
    ]
});

#[cfg(test)]
mod tests {
    use super::*;

    fn one(text: &str, abi: Abi) -> String {
        let mut out = text.as_bytes().to_vec();
        for rules in onetime_rules_for(abi) {
            out = apply_rules(&out, rules);
        }
        String::from_utf8(out).unwrap()
    }

    fn rep(text: &str) -> String {
        String::from_utf8(apply_rules(text.as_bytes(), &REPEAT)).unwrap()
    }

    #[test]
    fn pslld_by_one_becomes_padd() {
        assert_eq!(one("\tpslld\t$1, %xmm3\n", Abi::Lp64), "\tpaddd\t%xmm3,%xmm3\n");
        assert_eq!(
            one("\tvpsllq\t$1, %xmm2, %xmm1\n", Abi::Lp64),
            "\tvpaddq\t%xmm2,%xmm2,%xmm1\n"
        );
    }

    #[test]
    fn mov_test_retargets_source() {
        assert_eq!(
            one("\tmovq\t%rdi, %rax\n\ttestq\t%rax, %rax\n", Abi::Lp64),
            "\tmovq\t%rdi, %rax\n\ttestq\t%rdi,%rdi\n"
        );
        // Different register tested: untouched.
        assert_eq!(
            one("\tmovq\t%rdi, %rax\n\ttestq\t%rbx, %rbx\n", Abi::Lp64),
            "\tmovq\t%rdi, %rax\n\ttestq\t%rbx, %rbx\n"
        );
    }

    #[test]
    fn add_mov_reorders_displacement() {
        assert_eq!(
            one("\taddq\t$8, %rdi\n\tmovq\t16(%rdi), %rax\n", Abi::Lp64),
            "\tmov\t24(%rdi),%rax\n\tadd\t$8,%rdi\n"
        );
        // Same family: the add result is dead after the load.
        assert_eq!(
            one("\taddq\t$8, %rdi\n\tmovl\t(%rdi), %edi\n", Abi::Lp64),
            "\tmov\t8(%rdi),%edi\n"
        );
    }

    #[test]
    fn testl_narrows_to_byte_probe() {
        assert_eq!(
            one("\ttestl\t$0x100,4(%rsp)\n", Abi::Lp64),
            "\ttestb\t$1,5(%rsp)\n"
        );
        assert_eq!(
            one("\ttestl\t$255,4(%rsp)\n", Abi::Lp64),
            "\ttestl\t$255,4(%rsp)\n"
        );
    }

    #[test]
    fn shr_shl_pair_is_a_mask() {
        assert_eq!(
            one("\tshrq\t$3, %rax\n\tshlq\t$3, %rax\n", Abi::Lp64),
            "\tand\t$-8,%rax\n"
        );
        assert_eq!(
            one("\tshrl\t%eax\n\tshll\t%eax\n", Abi::Lp64),
            "\tand\t$-2,%eax\n"
        );
    }

    #[test]
    fn xor_then_and_flips_in_place() {
        assert_eq!(
            one("\txorl\t$1, %eax\n\tandl\t$1, %eax\n\tret\n", Abi::Lp64),
            "\tnotl\t%eax\n\tandl\t$1, %eax\n\tret\n"
        );
    }

    #[test]
    fn rbp_base_swap() {
        assert_eq!(
            one("\tmovq\t$1, 0(%rbp,%rax,1)\n", Abi::Lp64),
            "\tmovq\t$1, (%rax,%rbp)\n"
        );
        // %r13 as index cannot lose the displacement byte; keep as-is.
        assert_eq!(
            one("\tmovq\t$1, 0(%rbp,%r13,1)\n", Abi::Lp64),
            "\tmovq\t$1, 0(%rbp,%r13,1)\n"
        );
    }

    #[test]
    fn indirect_jump_gets_ud2() {
        assert_eq!(
            one("\tjmp\t*%rax\n\t.p2align 4\n", Abi::Lp64),
            "\tjmp\t*%rax\n\tud2\n\t.p2align 4\n"
        );
    }

    #[test]
    fn duplicate_prefetch_collapses() {
        assert_eq!(
            one(
                "\tprefetcht0\t(%rdi)\n\tprefetcht0\t(%rdi)\n\tprefetcht0\t(%rdi)\n",
                Abi::Lp64
            ),
            "\tprefetcht0\t(%rdi)\n"
        );
    }

    #[test]
    fn self_moves_vanish_except_32_bit() {
        assert_eq!(one("\tmovq\t%rax, %rax\n", Abi::Lp64), "");
        // The 32-bit self-move zero-extends; it stays.
        assert_eq!(one("\tmovl\t%eax, %eax\n", Abi::Lp64), "\tmovl\t%eax, %eax\n");
    }

    #[test]
    fn exception_dtor_calls_vanish() {
        assert_eq!(one("\tcall\t_ZNSt9exceptionD2Ev@PLT\n", Abi::Lp64), "");
        assert_eq!(one("\tjmp\t_ZNSt9exceptionD2Ev\n", Abi::Lp64), "\tret\n");
    }

    #[test]
    fn lp64_free_guard_removed() {
        let src = "\ttestq\t%rdi, %rdi\n\tje\t.L3\n\tcall\tfree@PLT\n.L3:\n";
        assert_eq!(one(src, Abi::Lp64), "\tcall\tfree@PLT\n.L3:\n");
        // Not on x32, where the pointer test is 32-bit.
        assert_eq!(one(src, Abi::X32), src);
    }

    #[test]
    fn lp64_tail_jump_guard_removed() {
        let src = "\ttestq\t%rdi, %rdi\n\tje\t.L9\n\tjmp\tfree@PLT\n\t.p2align 4,,10\n.L9:\n\tret\n";
        assert_eq!(
            one(src, Abi::Lp64),
            "\tjmp\tfree@PLT\n\t.p2align 4,,10\n.L9:\n\tret\n"
        );
    }

    #[test]
    fn x32_free_guard_removed() {
        let src = "\ttestl\t%edi, %edi\n\tje\t.L3\n\tcall\tfree@PLT\n.L3:\n";
        assert_eq!(one(src, Abi::X32), "\tcall\tfree@PLT\n.L3:\n");
        let moved =
            "\ttestl\t%ebx, %ebx\n\tje\t.L4\n\tmovl\t%ebx, %edi\n\tcall\tfree@PLT\n.L4:\n";
        assert_eq!(
            one(moved, Abi::X32),
            "\tmovl\t%ebx, %edi\n\tcall\tfree@PLT\n.L4:\n"
        );
    }

    #[test]
    fn fopen64_aliases_fopen() {
        assert_eq!(one("\tcall\tfopen64@PLT\n", Abi::Lp64), "\tcall\tfopen@PLT\n");
    }

    #[test]
    fn repeat_moves_alignment_before_label() {
        assert_eq!(
            rep(".L1:\n\t.p2align 4\n\tret\n"),
            "\t.p2align 4\n.L1:\n\tret\n"
        );
    }

    #[test]
    fn repeat_collapses_adjacent_rets() {
        assert_eq!(
            rep("\tret\n\t.p2align 4\n.L2:\n\tret\n"),
            "\t.p2align 4\n.L2:\n\tret\n"
        );
    }

    #[test]
    fn repeat_sweeps_dead_tail() {
        assert_eq!(
            rep("\tret\n\tjmp\t.L5\n\tret\n.L6:\n\tret\n"),
            "\tret\n.L6:\n\tret\n"
        );
    }

    #[test]
    fn vector_load_compare_fuses() {
        assert_eq!(
            one(
                "\tvmovdqa\t(%rsi), %xmm0\n\tvpcmpeqb\t%xmm1, %xmm0, %xmm0\n",
                Abi::Lp64
            ),
            "\tvpcmpeqb\t(%rsi),%xmm1,%xmm0\n"
        );
    }

    #[test]
    fn stack_store_forwarding() {
        assert_eq!(
            one("\tmovq\t%rax, 8(%rsp)\n\tmovq\t8(%rsp), %rbx\n", Abi::Lp64),
            "\tmovq\t%rax,8(%rsp)\n\tmov\t%rax,%rbx\n"
        );
    }
}

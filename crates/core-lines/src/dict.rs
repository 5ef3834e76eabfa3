//! The mnemonic dictionary.
//!
//! Maps every mnemonic the classifier knows (including operand-size suffixes
//! and SSE/AVX/FMA/BMI spellings) to its [`LineKind`]. The families are
//! enumerated by small cartesian products so the table stays exhaustive
//! without listing thousands of spellings by hand. Anything absent here is
//! classified [`LineKind::Unknown`], which makes every analysis around it
//! conservative.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::LineKind;

/// Concatenating cartesian product: `product(&[&["a"], &["x","y"]])` yields
/// `ax`, `ay`.
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

/// Each mnemonic with the optional b/w/l/q operand-size suffix.
fn bwlq(ins: &[&str]) -> Vec<Vec<u8>> {
    product(&[ins, &["", "b", "w", "l", "q"]])
}

/// Scalar/packed float ops, with and without the AVX `v` prefix.
fn simd_float(ins: &[&str]) -> Vec<Vec<u8>> {
    product(&[&["", "v"], ins, &["ps", "pd", "ss", "sd"]])
}

/// Packed-only float ops.
fn simd_floatp(ins: &[&str]) -> Vec<Vec<u8>> {
    product(&[&["", "v"], ins, &["ps", "pd"]])
}

/// Packed integer ops over the four element widths.
fn simd_int(ins: &[&str]) -> Vec<Vec<u8>> {
    product(&[&["p", "vp"], ins, &["b", "w", "d", "q"]])
}

/// A mnemonic and its AVX spelling.
fn avx(ins: &[&str]) -> Vec<Vec<u8>> {
    product(&[&["", "v"], ins])
}

fn notuse_preserve() -> Vec<Vec<u8>> {
    let mut v: Vec<Vec<u8>> = Vec::new();
    let mut one = |s: &str| v.push(s.as_bytes().to_vec());
    one(".p2align"); // alignment (implicit NOPs)
    one(".loc");
    one("cpuid");
    one("pause");
    one("xgetbv");
    one("movabs");
    one("movabsq");
    one("movbe");
    one("movzx");
    one("movsx");
    one("rdtsc");
    one("rdtscp");
    one("vzeroupper");
    one("vzeroall");
    for s in [
        "bswap", "bswapl", "bswapq", "lea", "leal", "leaq", "leave", "leavel", "leaveq", "lfence",
        "mfence", "sfence", "movzbw", "movzbl", "movzwl", "movsbw", "movsbl", "movsbq", "movswl",
        "movswq", "movslq", "mulx", "salx", "sarx", "shlx", "shrx", "rorx", "pdep", "pext",
        "prefetch", "prefetchnta", "prefetcht0", "prefetcht1", "prefetcht2",
    ] {
        one(s);
    }
    v.extend(bwlq(&["mov", "nop", "xchg", "not", "crc32"]));
    // string instructions
    v.extend(bwlq(&["movs", "stos"]));
    v.extend(product(&[&["push", "pop"], &["", "l", "q"]]));

    // Most SIMD instructions.
    v.extend(simd_float(&[
        "abs", "add", "sub", "max", "min", "mul", "div", "rcp", "sqrt", "round",
    ]));
    v.extend(simd_floatp(&["and", "andn", "or", "xor", "hadd", "hsub", "dp"]));
    v.extend(avx(&["movss", "movsd", "movaps", "movapd", "movups", "movupd"]));
    v.extend(avx(&["movdqa", "movdqu", "movd", "movq"]));
    v.extend(avx(&["movsldup", "movshdup", "movddup"]));
    v.extend(avx(&["movlps", "movlpd", "movhps", "movhpd"]));
    v.extend(avx(&["movlhps", "movhlps"]));
    v.extend(simd_int(&["insr", "extr"]));
    v.extend(simd_int(&["abs", "add", "sub", "maxs", "mins", "maxu", "minu"]));
    v.extend(simd_int(&["cmpgt", "cmpeq", "blend", "blendv"]));
    v.extend(avx(&["blendvps", "blendvpd", "blendps", "blendpd"]));
    v.extend(product(&[
        &["", "v"],
        &["phadd", "phsub", "phsubs"],
        &["d", "w"],
    ]));
    v.extend(simd_int(&["sll", "srl", "sra"]));
    v.extend(avx(&["pmaddwd", "pmaddubsw", "pmulld", "palignr"]));
    v.extend(product(&[
        &["", "v"],
        &["pmovsx", "pmovzx"],
        &["bw", "bd", "bq", "wd", "wq", "dq"],
    ]));
    v.extend(simd_floatp(&["movmsk"]));
    v.extend(avx(&["pmovmskb"]));
    v.extend(avx(&["pxor", "por", "pand", "pandn"]));
    v.extend(product(&[&["", "v"], &["unpcklp", "unpckhp"], &["s", "d"]]));
    v.extend(product(&[
        &["", "v"],
        &["punpckl", "punpckh"],
        &["bw", "wd", "dq", "qdq"],
    ]));
    v.extend(product(&[&["", "v"], &["packus", "packss"], &["wb", "dw"]]));
    v.extend(avx(&["lddqu"]));
    v.extend(avx(&["insertps", "extractps"]));
    v.extend(simd_floatp(&["shuf"]));
    v.extend(avx(&["pshufb", "pshufd"]));
    v.extend(product(&[&["", "v"], &["cvt", "cvtt"], &["ps2dq", "pd2dq"]]));
    v.extend(avx(&["cvtdq2pd", "cvtdq2ps"]));
    v.extend(product(&[
        &["", "v"],
        &["cvtsi2ss", "cvtsi2sd"],
        &["", "l", "q"],
    ]));
    v.extend(product(&[
        &["", "v"],
        &["cvt", "cvtt"],
        &["sd2si", "ss2si"],
        &["", "l", "q"],
    ]));
    // cvtpd2ps & co. may carry an x/y/z width suffix
    v.extend(product(&[
        &["", "v"],
        &["cvtpd2ps", "cvtps2pd", "cvtss2sd", "cvtsd2ss"],
        &["", "x", "y", "z"],
    ]));
    v.extend(product(&[&["vbroadcast"], &["i128", "f128", "ss", "sd"]]));
    v.extend(product(&[&["vpbroadcast"], &["b", "w", "d", "q"]]));
    v.extend(product(&[&["vextract", "vinsert"], &["i128", "f128"]]));
    v.extend(product(&[&["vperm"], &["2f128", "ilps", "ilpd"]]));
    // FMA3/FMA4 grid
    v.extend(product(&[
        &["vfm", "vfnm"],
        &["add", "sub"],
        &["", "132", "213", "231"],
        &["p", "s"],
        &["s", "d"],
    ]));
    v
}

fn use_preserve() -> Vec<Vec<u8>> {
    let mut v = vec![b"pushf".to_vec()];
    let ccs: Vec<&str> = core_x86::all_cc_spellings().collect();
    v.extend(product(&[&["cmov", "set"], &ccs]));
    // jcc is deliberately not here; branches get their own kind
    v
}

fn notuse_set() -> Vec<Vec<u8>> {
    let mut v = bwlq(&[
        "add", "sub", "mul", "imul", "div", "idiv", "cmp", "test", "and", "andn", "neg", "or",
        "xor", "bsf", "bsr", "bextr", "tzcnt", "lzcnt", "blsr", "blsi", "blsmsk", "bzhi", "inc",
        "dec", "shl", "sal", "shr", "sar", "rol", "ror",
    ]);
    v.push(b"popf".to_vec());
    // syscall could touch flags in theory; Linux preserves none we care about
    v.push(b"syscall".to_vec());
    v.push(b"cmpxchg8b".to_vec());
    v.push(b"cmpxchg16b".to_vec());
    v.push(b"vtestps".to_vec());
    v.push(b"vtestpd".to_vec());
    v.extend(avx(&["ptest"]));
    v.extend(product(&[
        &["", "v"],
        &["pcmpistr", "pcmpestr"],
        &["i", "m"],
    ]));
    v.extend(product(&[&["", "v"], &["", "u"], &["comiss", "comisd"]]));
    v.extend(bwlq(&["bt", "btc", "btr", "bts", "cmpxchg"]));
    v.extend(product(&[&["popcnt"], &["", "w", "l", "q"]]));
    v
}

fn use_set() -> Vec<Vec<u8>> {
    bwlq(&["adc", "sbb"])
}

pub(crate) static MNEMONIC_KINDS: LazyLock<HashMap<Vec<u8>, LineKind>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    let mut insert_all = |mnemonics: Vec<Vec<u8>>, kind: LineKind| {
        for m in mnemonics {
            map.insert(m, kind);
        }
    };
    insert_all(use_preserve(), LineKind::UsePreserve);
    insert_all(notuse_preserve(), LineKind::NotUsePreserve);
    insert_all(use_set(), LineKind::UseSet);
    insert_all(notuse_set(), LineKind::NotUseSet);
    insert_all(
        vec![b"call".to_vec(), b"calll".to_vec(), b"callq".to_vec()],
        LineKind::Call,
    );
    insert_all(
        vec![b"jmp".to_vec(), b"jmpl".to_vec(), b"jmpq".to_vec()],
        LineKind::Jmp,
    );
    let jcc: Vec<&str> = core_x86::all_cc_spellings().collect();
    insert_all(product(&[&["j"], &jcc]), LineKind::Jcc);
    insert_all(
        vec![b"hlt".to_vec(), b"ud2".to_vec(), b"ud2a".to_vec()],
        LineKind::Halt,
    );
    insert_all(
        vec![b"ret".to_vec(), b"retl".to_vec(), b"retq".to_vec()],
        LineKind::Ret,
    );
    map
});

pub(crate) fn mnemonic_kind(mnemonic: &[u8]) -> Option<LineKind> {
    MNEMONIC_KINDS.get(mnemonic).copied()
}

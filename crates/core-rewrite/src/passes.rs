//! Whole-document structural passes: label bookkeeping, jump propagation,
//! branch streamlining, section cleanup, and identical-code folding.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::bytes::{Captures, Regex};

static LABEL_USE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.L\w+").unwrap());
static LABEL_DEFINITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\.L\w+):\n").unwrap());

/// Remove local labels nothing references. Definitions sit at line starts;
/// every other occurrence of `.L...` counts as a use.
pub(crate) fn remove_unused_labels(contents: &[u8]) -> Vec<u8> {
    let mut used: HashSet<&[u8]> = HashSet::new();
    for m in LABEL_USE.find_iter(contents) {
        let at_line_start = m.start() > 0 && contents[m.start() - 1] == b'\n';
        let inside_symbol = m.start() > 0
            && (contents[m.start() - 1].is_ascii_alphanumeric() || contents[m.start() - 1] == b'_');
        if !at_line_start && !inside_symbol {
            used.insert(m.as_bytes());
        }
    }
    LABEL_DEFINITION
        .replace_all(contents, |caps: &Captures<'_>| {
            if used.contains(&caps[1]) {
                caps[0].to_vec()
            } else {
                Vec::new()
            }
        })
        .into_owned()
}

static RET_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\.\w+):\n\t(?:rep\t)?ret[lq]?$").unwrap());

/// `jmp .Lx` where `.Lx:` is a lone `ret` is just a `ret`.
pub(crate) fn convert_jmp_ret(contents: &[u8]) -> Vec<u8> {
    let labels: Vec<String> = RET_LABEL
        .captures_iter(contents)
        .filter_map(|caps| String::from_utf8(caps[1].to_vec()).ok())
        .collect();
    if labels.is_empty() {
        return contents.to_vec();
    }
    let alternation = labels
        .iter()
        .map(|l| regex::escape(l))
        .collect::<Vec<_>>()
        .join("|");
    let convert = Regex::new(&format!(r"(?m)^\tjmp[lq]?\t(?:{alternation})$")).unwrap();
    convert.replace_all(contents, &b"\tret"[..]).into_owned()
}

static UNREACHABLE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\.L\w+):\n\t\.cfi_endproc\n").unwrap());

/// A label directly followed by `.cfi_endproc` marks an unreachable point;
/// branches to it can go.
pub(crate) fn optimize_for_unreachable(contents: &[u8]) -> Vec<u8> {
    let labels: Vec<String> = UNREACHABLE_LABEL
        .captures_iter(contents)
        .filter_map(|caps| String::from_utf8(caps[1].to_vec()).ok())
        .collect();
    if labels.is_empty() {
        return contents.to_vec();
    }
    let ccs = core_x86::CC_OPPOSITES
        .iter()
        .map(|&(cc, _)| cc)
        .collect::<Vec<_>>()
        .join("|");
    let alternation = labels
        .iter()
        .map(|l| regex::escape(l))
        .collect::<Vec<_>>()
        .join("|");
    let eliminate = Regex::new(&format!(
        r"(?m)^\tj(?:mp[lq]?|{ccs})\t(?:{alternation})\n"
    ))
    .unwrap();
    eliminate.replace_all(contents, &b""[..]).into_owned()
}

static SECTION_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^((?:\t\.section\t[\w.]+\n|\t\.data\n|\t\.text\n){2,})").unwrap()
});
static TEXT_SECTION_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^((?:\t\.section\t\.text(?:\.[\w.]+)?\n|\t\.text|\.(?:b|p2)?align [\d,]+\n)+)(\t\.text|\t\.section)",
    )
    .unwrap()
});

/// Keep only the last of a run of section directives. A directive with
/// attributes (`"ax",@progbits`) never matches and always survives.
pub(crate) fn remove_empty_sections(contents: &[u8]) -> Vec<u8> {
    let contents = SECTION_RUN.replace_all(contents, |caps: &Captures<'_>| {
        let run = &caps[1];
        let start = run[..run.len() - 1]
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        run[start..].to_vec()
    });
    TEXT_SECTION_RUN
        .replace_all(&contents, &b"${2}"[..])
        .into_owned()
}

static CONSEC_LABELS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([._A-Za-z][.\w]*):\n((?:(?:\t\.p2align [,\d]+|[._A-Za-z][.\w]*:)\n)+)")
        .unwrap()
});
static LABEL_IMMEDIATE_JUMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([._A-Za-z][.\w]*):\n\tjmp\t([._A-Za-z][.\w]*)$").unwrap()
});
// uleb128 is absent on purpose: rewriting gcc_except_table ranges is unsafe.
// A retargeted reference is an address, and landing on the forwarding label
// executes the same jump; pc-relative address materialization is covered by
// the optional (%rip) suffix.
static LABEL_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(\t(?:jmp|jn?[espo]|j[abgl]e?|\.quad|\.long|mov[lq]?)\t\$?)([._A-Za-z][.\w]*)((?:\(%rip\))?(?:,[^;\n]*)?)$",
    )
    .unwrap()
});

/// Retarget references to a label that merely forwards to another label,
/// either by adjacency or via `jmp`.
pub(crate) fn propagate_jumps(contents: &[u8]) -> Vec<u8> {
    let mut forward: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    // Labels stacked on the same spot all mean the first one.
    for caps in CONSEC_LABELS.captures_iter(contents) {
        let dst = &caps[1];
        for line in caps[2].split(|&b| b == b'\n') {
            if line.last() == Some(&b':') {
                forward.insert(line[..line.len() - 1].to_vec(), dst.to_vec());
            }
        }
    }
    // A label whose only content is `jmp L2` forwards to L2.
    for caps in LABEL_IMMEDIATE_JUMP.captures_iter(contents) {
        let src = caps[1].to_vec();
        let dst = caps[2].to_vec();
        let resolved = forward.get(&dst).cloned().unwrap_or(dst);
        forward.insert(src, resolved);
    }
    // No label may be both a source and a target, or chains could loop.
    let targets: HashSet<Vec<u8>> = forward.values().cloned().collect();
    forward.retain(|src, _| !targets.contains(src));

    LABEL_REF
        .replace_all(contents, |caps: &Captures<'_>| {
            let mut out = caps[1].to_vec();
            match forward.get(&caps[2]) {
                Some(dst) => out.extend_from_slice(dst),
                None => out.extend_from_slice(&caps[2]),
            }
            out.extend_from_slice(&caps[3]);
            out
        })
        .into_owned()
}

static BRANCH_TO_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\tj(?:n?[espo]|[abgl]e?|mp[lq]?)\t(\.L\w+)\n").unwrap()
});
static P2ALIGN_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A\t\.p2align [,\d]+\n").unwrap());
static LOCAL_LABEL_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\A\.L\w+:\n").unwrap());

// Does `rest` consist of alignment lines, then label lines, with `label:`
// somewhere in the label run (or right after the alignment)?
fn falls_through_to(rest: &[u8], label: &[u8]) -> bool {
    let mut rest = rest;
    while let Some(m) = P2ALIGN_LINE.find(rest) {
        rest = &rest[m.end()..];
    }
    loop {
        if let Some(stripped) = rest.strip_prefix(label) {
            if let Some(stripped) = stripped.strip_prefix(b":") {
                if stripped.is_empty() || stripped[0] == b'\n' {
                    return true;
                }
            }
        }
        match LOCAL_LABEL_LINE.find(rest) {
            Some(m) => rest = &rest[m.end()..],
            None => return false,
        }
    }
}

/// Drop a branch whose target is the very next instruction (allowing for
/// alignment and other labels in between). `__builtin_unreachable()` and
/// hand-written assembly both produce these.
pub(crate) fn remove_branch_to_next(contents: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(contents.len());
    let mut copied = 0;
    for caps in BRANCH_TO_LABEL.captures_iter(contents) {
        let m = caps.get(0).unwrap();
        if falls_through_to(&contents[m.end()..], &caps[1]) {
            out.extend_from_slice(&contents[copied..m.start()]);
            copied = m.end();
        }
    }
    out.extend_from_slice(&contents[copied..]);
    out
}

static JCC_OVER_JMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\tj([agbl]e?|n?[espo])\t(\.L\w+)\n\tjmp\t([.\w]+)$").unwrap()
});

/// `jcc .L2; jmp .L3` with `.L2:` next collapses to the opposite branch
/// straight to `.L3`.
pub(crate) fn streamline_branches(contents: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(contents.len());
    let mut copied = 0;
    for caps in JCC_OVER_JMP.captures_iter(contents) {
        let m = caps.get(0).unwrap();
        let rest = &contents[m.end()..];
        let Some(rest) = rest.strip_prefix(b"\n") else {
            continue;
        };
        if !falls_through_to(rest, &caps[2]) {
            continue;
        }
        let Some(opposite) = core_x86::cc_opposite(&caps[1]) else {
            continue;
        };
        out.extend_from_slice(&contents[copied..m.start()]);
        out.extend_from_slice(b"\tj");
        out.extend_from_slice(opposite);
        out.push(b'\t');
        out.extend_from_slice(&caps[3]);
        copied = m.end();
    }
    out.extend_from_slice(&contents[copied..]);
    out
}

static FUNCTION_REGION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\t(\.section\t\.text\.[.\w]+|\.text)\n\t(\.(?:p2|b)?align [\d,]+)\n\t\.type[ \t]([\w.]+),\s*@function\n([\w.]+):\n((?:\n|\t\.cfi[\w,\-. \t]+\n|[\w.]+:\n|\t[^.\n][^\n]*\n){1,20})\t\.size[ \t]([\w.]+), \.-([\w.]+)\n",
    )
    .unwrap()
});

/// Identical code folding: emit one copy of byte-identical function bodies
/// and alias the original names to it. Assumes function addresses are never
/// compared for identity. Not part of the default schedule.
pub fn icf(contents: &[u8]) -> Vec<u8> {
    type Key = (Vec<u8>, Vec<u8>, Vec<u8>);
    let mut buckets: HashMap<Key, Vec<(Vec<u8>, std::ops::Range<usize>)>> = HashMap::new();
    for caps in FUNCTION_REGION.captures_iter(contents) {
        let name = &caps[3];
        if caps[4] != *name || caps[6] != *name || caps[7] != *name {
            continue;
        }
        let key = (caps[1].to_vec(), caps[2].to_vec(), caps[5].to_vec());
        let m = caps.get(0).unwrap();
        buckets
            .entry(key)
            .or_default()
            .push((name.to_vec(), m.start()..m.end()));
    }

    let mut splices: Vec<(std::ops::Range<usize>, Vec<u8>)> = Vec::new();
    for ((section, align, code), members) in &buckets {
        if members.len() < 2 {
            continue;
        }
        let mut hashed = section.clone();
        hashed.extend_from_slice(align);
        hashed.extend_from_slice(code);
        let identifier = format!(".L_hackasICF_{:x}", md5::compute(&hashed)).into_bytes();

        let mut replacement = b"\t".to_vec();
        replacement.extend_from_slice(section);
        replacement.extend_from_slice(b"\n\t");
        replacement.extend_from_slice(align);
        replacement.extend_from_slice(b"\n\t.type\t");
        replacement.extend_from_slice(&identifier);
        replacement.extend_from_slice(b", @function\n");
        replacement.extend_from_slice(&identifier);
        replacement.extend_from_slice(b":\n");
        replacement.extend_from_slice(code);
        replacement.extend_from_slice(b"\t.size\t");
        replacement.extend_from_slice(&identifier);
        replacement.extend_from_slice(b", .-");
        replacement.extend_from_slice(&identifier);
        replacement.push(b'\n');
        for (name, _) in members {
            replacement.extend_from_slice(b"\t.set\t");
            replacement.extend_from_slice(name);
            replacement.push(b',');
            replacement.extend_from_slice(&identifier);
            replacement.push(b'\n');
        }
        let mut replacement = Some(replacement);
        for (_, span) in members {
            splices.push((span.clone(), replacement.take().unwrap_or_default()));
        }
    }
    if splices.is_empty() {
        return contents.to_vec();
    }
    splices.sort_by_key(|(span, _)| span.start);
    let mut out = Vec::with_capacity(contents.len());
    let mut copied = 0;
    for (span, replacement) in splices {
        out.extend_from_slice(&contents[copied..span.start]);
        out.extend_from_slice(&replacement);
        copied = span.end;
    }
    out.extend_from_slice(&contents[copied..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn unused_labels_go_away() {
        let src = b".L1:\n\tjmp\t.L1\n.L2:\n\tret\n";
        assert_eq!(s(remove_unused_labels(src)), ".L1:\n\tjmp\t.L1\n\tret\n");
    }

    #[test]
    fn label_uses_inside_operands_count() {
        let src = b".L1:\n\tmovl\t.L1(%rip), %eax\n\t.quad\t.L1\n";
        assert_eq!(s(remove_unused_labels(src)), String::from_utf8_lossy(src));
    }

    #[test]
    fn jmp_to_ret_label_is_ret() {
        let src = b"\tjmp\t.L4\n.L4:\n\tret\n";
        assert_eq!(s(convert_jmp_ret(src)), "\tret\n.L4:\n\tret\n");
    }

    #[test]
    fn branches_to_unreachable_labels_vanish() {
        let src = b"\tje\t.L7\n\tret\n.L7:\n\t.cfi_endproc\n";
        assert_eq!(s(optimize_for_unreachable(src)), "\tret\n.L7:\n\t.cfi_endproc\n");
    }

    #[test]
    fn section_runs_keep_last() {
        let src = b"\t.text\n\t.section\t.rodata\n\t.long\t1\n";
        // Two adjacent section switches: only the second matters.
        assert_eq!(
            s(remove_empty_sections(src)),
            "\t.section\t.rodata\n\t.long\t1\n"
        );
    }

    #[test]
    fn jump_propagation_follows_chain() {
        let src = b"\tjne\t.L1\n\tret\n.L1:\n\tjmp\t.L2\n.L2:\n\tret\n";
        let out = s(propagate_jumps(src));
        assert!(out.contains("\tjne\t.L2\n"), "got {out:?}");
    }

    #[test]
    fn jump_propagation_aliases_stacked_labels() {
        let src = b"\tjne\t.L5\n.L4:\n.L5:\n\tret\n";
        let out = s(propagate_jumps(src));
        assert!(out.contains("\tjne\t.L4\n"), "got {out:?}");
    }

    #[test]
    fn jump_propagation_cuts_chains_per_round() {
        // .L2 is both a target (of .L1) and a source (to .L3); its own
        // mapping is dropped this round so no reference can chase a loop.
        let src = b"\tjne\t.L1\n\tret\n.L1:\n\tjmp\t.L2\n.L2:\n\tjmp\t.L3\n.L3:\n\tret\n";
        let out = s(propagate_jumps(src));
        assert!(out.contains("\tjne\t.L2\n"), "got {out:?}");
        assert!(out.contains(".L2:\n\tjmp\t.L3\n"), "got {out:?}");
    }

    #[test]
    fn data_references_propagate_too() {
        let src = b"\tmovl\t.L1(%rip), %eax\n.L1:\n\tjmp\t.L2\n.L2:\n\tret\n";
        let out = s(propagate_jumps(src));
        assert!(out.contains("\tmovl\t.L2(%rip), %eax"), "got {out:?}");
    }

    #[test]
    fn branch_to_next_is_removed() {
        let src = b"\tje\t.L3\n\t.p2align 4\n.L8:\n.L3:\n\tret\n";
        assert_eq!(
            s(remove_branch_to_next(src)),
            "\t.p2align 4\n.L8:\n.L3:\n\tret\n"
        );
        // A real instruction in between keeps the branch.
        let src = b"\tje\t.L3\n\tnop\n.L3:\n\tret\n";
        assert_eq!(s(remove_branch_to_next(src)), String::from_utf8_lossy(src));
    }

    #[test]
    fn streamline_inverts_branch_over_jump() {
        let src = b"\tjne\t.L2\n\tjmp\t.L3\n\t.p2align 4\n.L2:\n\tret\n";
        assert_eq!(
            s(streamline_branches(src)),
            "\tje\t.L3\n\t.p2align 4\n.L2:\n\tret\n"
        );
    }

    #[test]
    fn icf_folds_identical_bodies() {
        let f = |name: &str| {
            format!(
                "\t.section\t.text.{name}\n\t.p2align 4\n\t.type\t{name}, @function\n{name}:\n\tmovl\t$1, %eax\n\tret\n\t.size\t{name}, .-{name}\n"
            )
        };
        let src = format!("{}{}", f("f"), f("g"));
        // The two bodies differ only by section name, so nothing folds.
        assert_eq!(s(icf(src.as_bytes())), src);

        let same = |name: &str| {
            format!(
                "\t.text\n\t.p2align 4\n\t.type\t{name}, @function\n{name}:\n\tmovl\t$1, %eax\n\tret\n\t.size\t{name}, .-{name}\n"
            )
        };
        let src = format!("{}{}", same("f"), same("g"));
        let out = s(icf(src.as_bytes()));
        assert!(out.contains("\t.set\tf,.L_hackasICF_"), "got {out:?}");
        assert!(out.contains("\t.set\tg,.L_hackasICF_"), "got {out:?}");
        assert_eq!(out.matches("movl\t$1, %eax").count(), 1, "got {out:?}");
    }
}

//! Line-addressed document model for assembly text.
//!
//! [`Lines`] splits a byte-string document into individually rewritable
//! lines, builds the label table once, and classifies each line into a
//! [`LineKind`] on demand. On top of the classification it offers the two
//! flag-liveness walks every downstream rewrite relies on:
//! [`Lines::flag_never_used`] and [`Lines::visit_flag_users`].

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::bytes::Regex;

mod dict;

/// Semantic category of a single line.
///
/// The `Use`/`NotUse` half says whether the instruction reads the ALU flags;
/// the `Preserve`/`Set` half says whether it leaves them intact or produces
/// new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Label,
    Ret,
    Call,
    Jmp,
    Jcc,
    UsePreserve,
    NotUsePreserve,
    UseSet,
    NotUseSet,
    Halt,
    Unknown,
}

fn is_label_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

/// `<name>:` with nothing but label characters before the colon.
pub fn is_label_line(line: &[u8]) -> bool {
    line.last() == Some(&b':') && line[..line.len() - 1].iter().copied().all(is_label_byte)
}

/// Split off the first whitespace-delimited token; the remainder has its
/// leading whitespace stripped. `None` for blank lines.
pub fn split_mnemonic(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace())?;
    let rest = &line[start..];
    let end = rest
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(rest.len());
    let (token, mut tail) = rest.split_at(end);
    while let Some((&b, t)) = tail.split_first() {
        if b.is_ascii_whitespace() {
            tail = t;
        } else {
            break;
        }
    }
    Some((token, tail))
}

/// Second whitespace-delimited token (e.g. a branch destination).
pub fn second_token(line: &[u8]) -> Option<&[u8]> {
    let (_, rest) = split_mnemonic(line)?;
    let (token, _) = split_mnemonic(rest)?;
    Some(token)
}

fn classify(line: &[u8]) -> LineKind {
    // ';' separates statements; refuse to reason about such lines.
    if line.contains(&b';') {
        return LineKind::Unknown;
    }
    if is_label_line(line) {
        return LineKind::Label;
    }
    let Some((key, rest)) = split_mnemonic(line) else {
        return LineKind::NotUsePreserve;
    };
    if matches!(key, b"lock" | b"rep" | b"repz" | b"repnz") {
        if rest.is_empty() {
            return if matches!(key, b"lock" | b"rep") {
                LineKind::NotUsePreserve
            } else {
                LineKind::Unknown
            };
        }
        let inner = classify(rest);
        // repz/repnz terminate on ZF, so the prefix itself reads flags.
        if matches!(key, b"repz" | b"repnz") {
            return match inner {
                LineKind::NotUsePreserve => LineKind::UsePreserve,
                LineKind::NotUseSet => LineKind::UseSet,
                other => other,
            };
        }
        return inner;
    }
    if key.starts_with(b".cfi_") {
        return LineKind::NotUsePreserve;
    }
    dict::mnemonic_kind(key).unwrap_or(LineKind::Unknown)
}

static SET_ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\t\.set\t([.\w]*),([.\w]*)$").unwrap());

/// The document: an indexed sequence of byte-string lines with a label table
/// and a lazily populated classification cache.
///
/// The label table is built once from the construction-time text; callers
/// that restructure the document re-parse instead of patching it.
pub struct Lines {
    lines: Vec<Vec<u8>>,
    labels: HashMap<Vec<u8>, usize>,
    cache: Vec<Option<LineKind>>,
}

impl Lines {
    pub fn parse(contents: &[u8]) -> Self {
        let mut lines: Vec<Vec<u8>> = contents.split(|&b| b == b'\n').map(<[u8]>::to_vec).collect();
        if lines.last().is_some_and(Vec::is_empty) {
            lines.pop();
        }

        let mut labels: HashMap<Vec<u8>, usize> = HashMap::new();
        for (i, line) in lines.iter().enumerate() {
            if is_label_line(line) {
                labels.insert(line[..line.len() - 1].to_vec(), i);
            }
        }
        // `.set new,old` introduces an alias for an existing label.
        for caps in SET_ALIAS.captures_iter(contents) {
            let newname = &caps[1];
            let oldname = &caps[2];
            if let Some(&target) = labels.get(oldname) {
                if !labels.contains_key(newname) {
                    labels.insert(newname.to_vec(), target);
                }
            }
        }

        let cache = vec![None; lines.len()];
        Self {
            lines,
            labels,
            cache,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, i: usize) -> &[u8] {
        &self.lines[i]
    }

    /// Overwrite line `i`. An empty replacement deletes the line from the
    /// joined output. The classification cache entry is invalidated.
    pub fn set(&mut self, i: usize, line: Vec<u8>) {
        self.lines[i] = line;
        self.cache[i] = None;
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.lines.iter().map(Vec::as_slice)
    }

    /// Line index a label resolves to, if known.
    pub fn label_target(&self, name: &[u8]) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// Concatenate all non-empty lines, each terminated by a newline.
    pub fn join(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            if !line.is_empty() {
                out.extend_from_slice(line);
                out.push(b'\n');
            }
        }
        out
    }

    pub fn line_kind(&mut self, i: usize) -> LineKind {
        if let Some(kind) = self.cache[i] {
            return kind;
        }
        let kind = classify(&self.lines[i]);
        self.cache[i] = Some(kind);
        kind
    }

    pub fn preserve_flags(&mut self, i: usize) -> bool {
        matches!(
            self.line_kind(i),
            LineKind::UsePreserve | LineKind::NotUsePreserve
        )
    }

    /// Whether the flag value produced at line `i` can never be observed.
    ///
    /// Walks forward from `i + 1`, following unconditional jumps through the
    /// label table. Re-entering an already-visited label is a dead loop and
    /// proves non-use. Anything unprovable answers `false`.
    pub fn flag_never_used(&mut self, mut i: usize) -> bool {
        let mut visited: HashSet<Vec<u8>> = HashSet::new();
        let len = self.lines.len();
        while i + 1 < len {
            i += 1;
            match self.line_kind(i) {
                LineKind::Jmp => {
                    let Some(dest) = second_token(&self.lines[i]).map(<[u8]>::to_vec) else {
                        return false;
                    };
                    if visited.contains(&dest) {
                        return true;
                    }
                    let Some(&target) = self.labels.get(&dest) else {
                        return false;
                    };
                    visited.insert(dest);
                    i = target;
                }
                LineKind::Label => {
                    let name = self.lines[i][..self.lines[i].len() - 1].to_vec();
                    visited.insert(name);
                }
                LineKind::Ret | LineKind::Call | LineKind::Halt | LineKind::NotUseSet => {
                    return true;
                }
                LineKind::NotUsePreserve => {}
                _ => return false,
            }
        }
        // Fell off the end of the document.
        false
    }

    /// Visit every line that may consume the flag value produced at line `i`.
    ///
    /// `i` must not itself be a branch. The callback receives each candidate
    /// index with its text and answers whether the caller's rewrite is
    /// acceptable there. A `false` return value means the whole attempt is
    /// invalid: the caller must not have mutated anything yet, and must
    /// abandon the rewrite.
    pub fn visit_flag_users(
        &mut self,
        mut i: usize,
        mut callback: impl FnMut(usize, &[u8]) -> bool,
    ) -> bool {
        let len = self.lines.len();
        while i + 1 < len {
            i += 1;
            match self.line_kind(i) {
                // No return value or argument is carried in flags.
                LineKind::Ret | LineKind::Call | LineKind::Halt => break,
                LineKind::Jcc => {
                    let line = self.lines[i].clone();
                    if !callback(i, &line) {
                        return false;
                    }
                    // The flag lives across the branch; its destination must
                    // provably not read it.
                    let Some(dest) = second_token(&line) else {
                        return false;
                    };
                    let Some(&target) = self.labels.get(dest) else {
                        return false;
                    };
                    if !self.flag_never_used(target) {
                        return false;
                    }
                }
                LineKind::Jmp => {
                    let Some(dest) = second_token(&self.lines[i]).map(<[u8]>::to_vec) else {
                        return false;
                    };
                    let Some(&target) = self.labels.get(&dest) else {
                        return false;
                    };
                    if self.flag_never_used(target) {
                        break;
                    }
                    return false;
                }
                LineKind::Label => {
                    // Control may enter here from elsewhere.
                    if self.flag_never_used(i) {
                        break;
                    }
                    return false;
                }
                LineKind::UsePreserve => {
                    if !callback(i, &self.lines[i].clone()) {
                        return false;
                    }
                }
                LineKind::UseSet => {
                    if !callback(i, &self.lines[i].clone()) {
                        return false;
                    }
                    break; // the flag dies here
                }
                LineKind::NotUsePreserve => {}
                LineKind::NotUseSet => break, // flag dies unused
                LineKind::Unknown => return false,
            }
        }
        true
    }

    /// All possible flag users of line `i`, or `None` when the walk cannot
    /// prove the set is complete.
    pub fn flag_users(&mut self, i: usize) -> Option<Vec<usize>> {
        let mut users = Vec::new();
        if self.visit_flag_users(i, |j, _| {
            users.push(j);
            true
        }) {
            Some(users)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Lines {
        Lines::parse(text.as_bytes())
    }

    #[test]
    fn classifies_labels_and_directives() {
        let mut l = lines(".L1:\n\t.cfi_def_cfa_offset 16\n\tmovl\t$1, %eax\n\taddl\t%eax, %ebx\n\tfrob\t%eax\n");
        assert_eq!(l.line_kind(0), LineKind::Label);
        assert_eq!(l.line_kind(1), LineKind::NotUsePreserve);
        assert_eq!(l.line_kind(2), LineKind::NotUsePreserve);
        assert_eq!(l.line_kind(3), LineKind::NotUseSet);
        assert_eq!(l.line_kind(4), LineKind::Unknown);
    }

    #[test]
    fn classifies_prefixes() {
        let mut l = lines(
            "\tlock\taddl\t$1, (%rdi)\n\trepz\tcmpsb\n\trep\tstosq\n\tlock\n\trepz\n\tmovl\t$1, %eax; movl $2, %ebx\n",
        );
        // lock add: still set-without-use
        assert_eq!(l.line_kind(0), LineKind::NotUseSet);
        // repz upgrades the non-use classification to a use
        assert_eq!(l.line_kind(1), LineKind::UseSet);
        assert_eq!(l.line_kind(2), LineKind::NotUsePreserve);
        assert_eq!(l.line_kind(3), LineKind::NotUsePreserve);
        assert_eq!(l.line_kind(4), LineKind::Unknown);
        assert_eq!(l.line_kind(5), LineKind::Unknown);
    }

    #[test]
    fn cache_invalidated_on_overwrite() {
        let mut l = lines("\tret\n");
        assert_eq!(l.line_kind(0), LineKind::Ret);
        l.set(0, b"\tjmp\t.L1".to_vec());
        assert_eq!(l.line_kind(0), LineKind::Jmp);
    }

    #[test]
    fn join_elides_deleted_lines() {
        let mut l = lines("\tmovl\t$1, %eax\n\tret\n");
        l.set(0, Vec::new());
        assert_eq!(l.join(), b"\tret\n");
    }

    #[test]
    fn set_directive_adds_alias() {
        let l = lines(".L1:\n\tret\n\t.set\talias,.L1\n");
        assert_eq!(l.label_target(b".L1"), Some(0));
        assert_eq!(l.label_target(b"alias"), Some(0));
        // aliases never shadow a real definition
        let l2 = lines(".L1:\n.L2:\n\t.set\t.L2,.L1\n");
        assert_eq!(l2.label_target(b".L2"), Some(1));
    }

    #[test]
    fn flag_dead_at_ret_call_halt_and_setters() {
        for tail in ["\tret", "\tcall\tfoo", "\tud2", "\taddl\t$1, %eax"] {
            let mut l = lines(&format!("\tcmpl\t$1, %eax\n{tail}\n"));
            assert!(l.flag_never_used(0), "tail {tail:?}");
        }
    }

    #[test]
    fn flag_live_at_consumers_and_unknowns() {
        for tail in ["\tje\t.L1", "\tcmovne\t%eax, %ebx", "\tadcl\t$0, %eax", "\tfrob"] {
            let mut l = lines(&format!("\tcmpl\t$1, %eax\n{tail}\n.L1:\n\tret\n"));
            assert!(!l.flag_never_used(0), "tail {tail:?}");
        }
        // Falling off the end proves nothing.
        let mut l = lines("\tcmpl\t$1, %eax\n\tmovl\t$2, %ebx\n");
        assert!(!l.flag_never_used(0));
    }

    #[test]
    fn flag_walk_follows_jumps_and_detects_dead_loops() {
        let mut l = lines("\tcmpl\t$1, %eax\n\tjmp\t.L2\n.L3:\n\tret\n.L2:\n\tjmp\t.L2\n");
        // .L2 jumps back to itself: a dead loop never reads the flag.
        assert!(l.flag_never_used(0));
        // Unknown destination is conservative.
        let mut l = lines("\tcmpl\t$1, %eax\n\tjmp\t.Lmissing\n");
        assert!(!l.flag_never_used(0));
    }

    #[test]
    fn flag_users_collects_conditional_chain() {
        let mut l = lines(
            "\tcmpl\t$1, %eax\n\tje\t.Lout\n\tcmovne\t%ecx, %edx\n\taddl\t$1, %ebx\n.Lout:\n\tret\n",
        );
        // je (branch target .Lout is flag-dead: ret) then cmovne, then addl kills.
        assert_eq!(l.flag_users(0), Some(vec![1, 2]));
    }

    #[test]
    fn flag_users_fails_on_label_with_live_flags() {
        let mut l = lines("\tcmpl\t$1, %eax\n.Lmid:\n\tje\t.Lout\n.Lout:\n\tret\n");
        // .Lmid can be entered from elsewhere and flags are read after it.
        assert_eq!(l.flag_users(0), None);
    }

    #[test]
    fn flag_users_aborts_on_rejection_callback() {
        let mut l = lines("\tcmpl\t$1, %eax\n\tje\t.Lout\n.Lout:\n\tret\n");
        let ok = l.visit_flag_users(0, |_, _| false);
        assert!(!ok);
    }
}

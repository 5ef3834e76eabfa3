//! Canonicalization of assembler text.
//!
//! Two jobs, both meant to shrink the pattern space the rewrite passes have
//! to cover:
//!
//! * Contiguous constant-data runs are lifted out and replaced with a
//!   single opaque placeholder line, so code passes never scan data.
//! * Whitespace, comments, alignment directives and instruction-alias
//!   spellings are normalized to one canonical form.
//!
//! [`Preprocessor::restore`] undoes the spellings the downstream assembler
//! prefers and splices the stashed data back in. Every operation here is
//! idempotent after its first application.

use std::sync::LazyLock;

use regex::bytes::{Captures, Regex};
use thiserror::Error;

/// The opaque stand-in for an extracted data block.
pub const PLACEHOLDER: &[u8] = b"\t.COMPRESSED";

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("found {found} data placeholders but {stashed} stashed blocks")]
    PlaceholderMismatch { found: usize, stashed: usize },
}

// Constant data or strings only; "common" implies a label and stays put.
static DATA_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^(\s*\.(byte|value|long|quad|zero|string|ascii)\s+(-?\d+|-?0x[\da-fA-F]+|"[^\n]*")\n)+"#,
    )
    .unwrap()
});

static TRAILING_WS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)[ \t]+$").unwrap());
static LEADING_WS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]+").unwrap());
static COMMENT_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^((\t?#.*)?\n)+").unwrap());
static MNEMONIC_GAP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^(\t\w+)[ \t]+").unwrap());
static ALIGN_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\t\.b?align[ \t]+(\d+)$").unwrap());
// Lines a data directive may hide behind when deciding whether an .align
// belongs to a data section.
static DATA_AFTER_ALIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\A(?:\t\.(?:size|type|b?align|p2align)[ \t][^\n]*\n|[.\w]+:\n)*\t\.(?:COMPRESSED|byte|string|ascii|value|long|quad|zero)",
    )
    .unwrap()
});
static P2ALIGN_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\t\.p2align[ \t]+").unwrap());
static P2ALIGN_4_15: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\t\.p2align 4,,15$").unwrap());
static REPE_REPNE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\t(repn?)e[;\s]").unwrap());
static REP_LOCK_SEMI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\t(rep(n?z)?|lock)[;\n\t ]+").unwrap());
static CC_ALIAS_SPELLING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\t(j|cmov|set)(nae|nbe|nge|nle|na|nb|nc|ng|nl|nz|pe|po|c|z)\t").unwrap()
});
static SAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\tsal([bwlq]?\t)").unwrap());

static BACK_REP_LOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\t(rep|lock)\t").unwrap());
static BACK_SHL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\tshl([bwlq]?)\t").unwrap());

fn replace_align(caps: &Captures<'_>, after: &[u8]) -> Option<Vec<u8>> {
    // Leave data-section alignment alone; only code alignment becomes an
    // implicit-NOP p2align.
    if let Some(rest) = after.strip_prefix(b"\n") {
        if DATA_AFTER_ALIGN.is_match(rest) {
            return None;
        }
    }
    let n: u64 = std::str::from_utf8(&caps[1]).ok()?.parse().ok()?;
    if n == 0 || !n.is_power_of_two() {
        return None;
    }
    Some(format!("\t.p2align {}", n.trailing_zeros()).into_bytes())
}

fn canonicalize_aligns(contents: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(contents.len());
    let mut copied = 0;
    for caps in ALIGN_LINE.captures_iter(contents) {
        let m = caps.get(0).unwrap();
        if let Some(replacement) = replace_align(&caps, &contents[m.end()..]) {
            out.extend_from_slice(&contents[copied..m.start()]);
            out.extend_from_slice(&replacement);
            copied = m.end();
        }
    }
    out.extend_from_slice(&contents[copied..]);
    out
}

fn canonicalize_cc(caps: &Captures<'_>) -> Vec<u8> {
    let canon = core_x86::cc_canonicalize(&caps[2]).expect("alias table covers the alternation");
    let mut line = b"\t".to_vec();
    line.extend_from_slice(&caps[1]);
    line.extend_from_slice(canon);
    line.push(b'\t');
    line
}

fn canonicalize(contents: &[u8]) -> Vec<u8> {
    let contents = TRAILING_WS.replace_all(contents, &b""[..]);
    // Any leading indent becomes one tab; every pattern below assumes it.
    let contents = LEADING_WS.replace_all(&contents, &b"\t"[..]);
    let contents = COMMENT_LINES.replace_all(&contents, &b""[..]);
    // One tab between mnemonic and operands.
    let contents = MNEMONIC_GAP.replace_all(&contents, &b"${1}\t"[..]);
    let contents = canonicalize_aligns(&contents);
    let contents = P2ALIGN_GAP.replace_all(&contents, &b"\t.p2align "[..]);
    let contents = P2ALIGN_4_15.replace_all(&contents, &b"\t.p2align 4"[..]);
    let contents = REPE_REPNE.replace_all(&contents, &b"\t${1}z\t"[..]);
    let contents = REP_LOCK_SEMI.replace_all(&contents, &b"\t${1}\t"[..]);
    let contents = CC_ALIAS_SPELLING.replace_all(&contents, |caps: &Captures<'_>| {
        canonicalize_cc(caps)
    });
    let contents = SAL.replace_all(&contents, &b"\tshl${1}"[..]);
    contents.into_owned()
}

/// Holds the extracted data blocks until [`Preprocessor::restore`].
pub struct Preprocessor {
    stash: Vec<Vec<u8>>,
}

/// Extract data blocks and canonicalize. Returns the rewritable text and the
/// state needed to restore it.
pub fn apply(contents: &[u8]) -> (Vec<u8>, Preprocessor) {
    let mut stash = Vec::new();
    let compressed = DATA_BLOCK.replace_all(contents, |caps: &Captures<'_>| {
        stash.push(caps[0].to_vec());
        let mut placeholder = PLACEHOLDER.to_vec();
        placeholder.push(b'\n');
        placeholder
    });
    (canonicalize(&compressed), Preprocessor { stash })
}

fn split_on(haystack: &[u8], needle: &[u8]) -> Vec<Vec<u8>> {
    let mut parts = Vec::new();
    let mut rest = haystack;
    while let Some(pos) = rest
        .windows(needle.len())
        .position(|window| window == needle)
    {
        parts.push(rest[..pos].to_vec());
        rest = &rest[pos + needle.len()..];
    }
    parts.push(rest.to_vec());
    parts
}

impl Preprocessor {
    /// Revert assembler-preferred spellings and splice the data blocks back.
    pub fn restore(&self, contents: &[u8]) -> Result<Vec<u8>, RestoreError> {
        let contents = BACK_REP_LOCK.replace_all(contents, &b"\t${1} "[..]);
        let contents = BACK_SHL.replace_all(&contents, &b"\tsal${1}\t"[..]);

        let mut marker = PLACEHOLDER.to_vec();
        marker.push(b'\n');
        let parts = split_on(&contents, &marker);
        if parts.len() != self.stash.len() + 1 {
            return Err(RestoreError::PlaceholderMismatch {
                found: parts.len() - 1,
                stashed: self.stash.len(),
            });
        }
        let mut out = Vec::with_capacity(contents.len());
        for (part, data) in parts.iter().zip(&self.stash) {
            out.extend_from_slice(part);
            out.extend_from_slice(data);
        }
        out.extend_from_slice(parts.last().expect("split yields at least one part"));
        Ok(out)
    }
}

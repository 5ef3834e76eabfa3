//! Pointer-parameter discovery from mangled C++ symbols.
//!
//! On x32, pointers are 32-bit, so a function's pointer parameters arrive
//! zero-extended in their System-V argument registers. One `c++filt`
//! invocation demangles every `_Z*` symbol in the document; prototypes whose
//! parameter lists parse completely contribute registers, everything else
//! contributes nothing.

use std::collections::HashMap;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use regex::bytes::Regex;
use thiserror::Error;
use tracing::warn;

use core_x86::{CX, DI, DX, R8, R9, SI};

/// System-V integer argument registers, in order.
const X32_PARAM_REGS: [usize; 6] = [DI, SI, DX, CX, R8, R9];

#[derive(Debug, Error)]
pub enum DemangleError {
    #[error("failed to run c++filt: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("c++filt returned {returned} lines for {sent} symbols")]
    LineMismatch { sent: usize, returned: usize },
}

static MANGLED_SYMBOL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(_Z\w+)").unwrap());
static ANON_NAMESPACE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:\w+::)*__ANONYMOUS_NAMESPACE__::").unwrap());
// Backreferences are checked in code: group 2 must equal group 3.
static DTOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^((?:\w+::)*)(\w+)::~(\w+)\(\)$").unwrap());
static CTOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^((?:\w+::)*)(\w+)::(\w+)\(\)$").unwrap());
static PARAMETER_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\w+::)*\w+\((.*)\)(?: const)?$").unwrap());
static NON_THISCALL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w+\(").unwrap());
static POINTER_TYPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w: ]+(?:\*|&+)$").unwrap());

const INTEGRAL_KEYWORDS: [&[u8]; 10] = [
    b"unsigned", b"signed", b"char", b"short", b"int", b"long", b"bool", b"wchar_t", b"char16_t",
    b"char32_t",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    Pointer,
    Gpr,
    Xmm,
    Unknown,
}

fn storage_type(parameter: &[u8]) -> Storage {
    if POINTER_TYPE.is_match(parameter) {
        return Storage::Pointer;
    }
    if parameter
        .split(|&b| b.is_ascii_whitespace())
        .filter(|part| !part.is_empty())
        .all(|part| INTEGRAL_KEYWORDS.contains(&part))
    {
        return Storage::Gpr;
    }
    if parameter == b"float" || parameter == b"double" {
        return Storage::Xmm;
    }
    Storage::Unknown
}

fn run_demangler(symbols: &[Vec<u8>]) -> Result<Vec<u8>, DemangleError> {
    let mut child = Command::new("c++filt")
        .arg("-sgnu-v3")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    {
        let stdin = child.stdin.as_mut().expect("stdin was piped");
        let mut input = Vec::new();
        for symbol in symbols {
            input.extend_from_slice(symbol);
            input.push(b'\n');
        }
        stdin.write_all(&input)?;
    }
    let output = child.wait_with_output()?;
    Ok(output.stdout)
}

/// The per-document map from mangled symbol to x32 pointer registers.
pub struct PointerParams {
    demangled: HashMap<Vec<u8>, Vec<u8>>,
    // Longest first, so the most specific namespace prefix strips first.
    namespace_prefixes: Vec<Vec<u8>>,
}

/// Demangle every `_Z*` symbol in `contents`. `None` when there is nothing
/// to demangle or the demangler is unavailable (the tracker then simply
/// learns nothing from labels).
pub fn analyze(contents: &[u8]) -> Option<PointerParams> {
    let symbols: Vec<Vec<u8>> = MANGLED_SYMBOL
        .captures_iter(contents)
        .map(|caps| caps[1].to_vec())
        .collect();
    if symbols.is_empty() {
        return None;
    }
    let out = match run_demangler(&symbols) {
        Ok(out) => out,
        Err(err) => {
            warn!(target: "zeroextend.cxx", %err, "demangler_unavailable");
            return None;
        }
    };
    // The parentheses would confuse prototype parsing.
    let out = replace_all_bytes(&out, b"(anonymous namespace)", b"__ANONYMOUS_NAMESPACE__");
    let lines: Vec<&[u8]> = split_lines(&out);
    if lines.len() != symbols.len() {
        let err = DemangleError::LineMismatch {
            sent: symbols.len(),
            returned: lines.len(),
        };
        warn!(target: "zeroextend.cxx", %err, "demangler_output_mismatch");
        return None;
    }
    let demangled: HashMap<Vec<u8>, Vec<u8>> = symbols
        .into_iter()
        .zip(lines.iter().map(|l| l.to_vec()))
        .collect();
    Some(PointerParams::from_demangled(demangled))
}

fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = data.split(|&b| b == b'\n').collect();
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

fn replace_all_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest
        .windows(needle.len())
        .position(|window| window == needle)
    {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(replacement);
        rest = &rest[pos + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}

impl PointerParams {
    pub(crate) fn from_demangled(demangled: HashMap<Vec<u8>, Vec<u8>>) -> Self {
        // Names seen before __ANONYMOUS_NAMESPACE__ are known namespaces.
        let mut corpus = Vec::new();
        for name in demangled.values() {
            corpus.extend_from_slice(name);
            corpus.push(b'\n');
        }
        let mut prefixes: Vec<Vec<u8>> = Vec::new();
        for m in ANON_NAMESPACE_PREFIX.find_iter(&corpus) {
            let prefix = m.as_bytes();
            let mut pos = 0;
            while let Some(sep) = find_from(prefix, b"::", pos) {
                let candidate = prefix[..sep + 2].to_vec();
                if !prefixes.contains(&candidate) {
                    prefixes.push(candidate);
                }
                pos = sep + 2;
            }
        }
        prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));
        Self {
            demangled,
            namespace_prefixes: prefixes,
        }
    }

    fn strip_namespace<'a>(&self, name: &'a [u8]) -> &'a [u8] {
        for prefix in &self.namespace_prefixes {
            if let Some(stripped) = name.strip_prefix(prefix.as_slice()) {
                return stripped;
            }
        }
        name
    }

    /// Registers certain to hold 32-bit zero-extended pointers on entry to
    /// the function `label` names.
    pub fn z32_registers(&self, label: &[u8]) -> Vec<usize> {
        if !label.starts_with(b"_Z") {
            if label == b"main" {
                // argv, environ
                return vec![SI, DX];
            }
            return Vec::new();
        }
        let Some(name) = self.demangled.get(label) else {
            return Vec::new();
        };
        // Clone suffixes like .constprop / .isra carry no prototype.
        if name.contains(&b'.') {
            return Vec::new();
        }
        if name.starts_with(b"_Z") {
            // Did not actually demangle.
            return Vec::new();
        }
        let name = self.strip_namespace(name);

        if let Some(caps) = DTOR.captures(name) {
            if caps[2] == caps[3] {
                // Destructor: %rdi = object.
                return vec![DI];
            }
        }

        let Some(caps) = PARAMETER_LIST.captures(name) else {
            return Vec::new();
        };
        let list = caps.get(1).unwrap().as_bytes().to_vec();
        let mut pointer_args: Vec<bool> = Vec::new();
        for parameter in list.split(|&b| b == b',') {
            if count_byte(parameter, b'(') != count_byte(parameter, b')') {
                // Some complicated type did not split cleanly.
                break;
            }
            match storage_type(parameter) {
                Storage::Pointer => pointer_args.push(true),
                Storage::Gpr => pointer_args.push(false),
                Storage::Xmm => {}
                Storage::Unknown => break,
            }
        }

        let is_ctor = CTOR
            .captures(name)
            .is_some_and(|caps| caps[2] == caps[3]);
        if name.ends_with(b") const") || is_ctor {
            // Non-static: `this` in the first register.
            pointer_args.insert(0, true);
        } else if NON_THISCALL.is_match(name) {
            // Static or global; arguments line up as parsed.
        } else {
            // Unknown staticness: a register qualifies only under both
            // interpretations.
            if pointer_args.is_empty() {
                return Vec::new();
            }
            let shifted: Vec<bool> = std::iter::once(true)
                .chain(pointer_args.iter().copied())
                .take(pointer_args.len())
                .collect();
            pointer_args = shifted
                .iter()
                .zip(&pointer_args)
                .map(|(&a, &b)| a && b)
                .collect();
        }

        X32_PARAM_REGS
            .iter()
            .zip(&pointer_args)
            .filter_map(|(&reg, &is_pointer)| is_pointer.then_some(reg))
            .collect()
    }
}

fn count_byte(haystack: &[u8], needle: u8) -> usize {
    haystack.iter().filter(|&&b| b == needle).count()
}

fn find_from(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    haystack[start..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> PointerParams {
        PointerParams::from_demangled(
            pairs
                .iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
                .collect(),
        )
    }

    #[test]
    fn main_marks_argv_and_environ() {
        let p = params(&[]);
        assert_eq!(p.z32_registers(b"main"), vec![SI, DX]);
        assert!(p.z32_registers(b"other").is_empty());
    }

    #[test]
    fn global_function_pointer_parameters() {
        let p = params(&[("_Z3fooPci", "foo(char*, int)")]);
        assert_eq!(p.z32_registers(b"_Z3fooPci"), vec![DI]);
    }

    #[test]
    fn const_member_gets_this_pointer() {
        let p = params(&[("_ZNK1S3getEi", "S::get(int) const")]);
        assert_eq!(p.z32_registers(b"_ZNK1S3getEi"), vec![DI]);
    }

    #[test]
    fn destructor_marks_object() {
        let p = params(&[("_ZN1SD2Ev", "S::~S()")]);
        assert_eq!(p.z32_registers(b"_ZN1SD2Ev"), vec![DI]);
    }

    #[test]
    fn unknown_staticness_needs_both_interpretations() {
        // S::f(char*, int): a register qualifies only if it holds a pointer
        // under both the static and the member reading, so the int in the
        // second slot disqualifies %rsi either way.
        let p = params(&[("_ZN1S1fEPci", "S::f(char*, int)")]);
        assert_eq!(p.z32_registers(b"_ZN1S1fEPci"), vec![DI]);
    }

    #[test]
    fn float_parameters_do_not_consume_gprs() {
        let p = params(&[("_Z3foofPc", "foo(float, char*)")]);
        assert_eq!(p.z32_registers(b"_Z3foofPc"), vec![DI]);
    }

    #[test]
    fn unparseable_types_stop_contributing() {
        let p = params(&[("_Z3fooP1XPc", "foo(X*, void (*)(int), char*)")]);
        // X* parses; the function-pointer type aborts the scan.
        assert_eq!(p.z32_registers(b"_Z3fooP1XPc"), vec![DI]);
    }

    #[test]
    fn clone_suffixes_are_ignored() {
        let p = params(&[("_Z3barPc", "bar(char*) [clone .constprop.0]")]);
        assert!(p.z32_registers(b"_Z3barPc").is_empty());
    }

    #[test]
    fn anonymous_namespace_prefixes_strip() {
        let p = params(&[(
            "_ZN12_GLOBAL__N_13fooEPc",
            "__ANONYMOUS_NAMESPACE__::foo(char*)",
        )]);
        assert_eq!(p.z32_registers(b"_ZN12_GLOBAL__N_13fooEPc"), vec![DI]);
    }
}

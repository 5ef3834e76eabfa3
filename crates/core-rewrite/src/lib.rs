//! The rewrite engine: scheduling of the peephole passes.
//!
//! A run is a pure function over the canonicalized document:
//!
//! 1. drop labels nothing references (helps every later analysis),
//! 2. the one-time substitutions plus the single forward pass
//!    (zero-extension tracking and flag-driven fusions),
//! 3. the repeat substitutions, jump propagation and label cleanup,
//!    iterated until the document stops changing.
//!
//! [`passes::icf`] is exposed for callers that want identical-code folding
//! but is not part of the default schedule.

use std::time::Instant;

use tracing::debug;

use core_x86::Abi;

mod forward;
mod rules;
pub mod passes;

pub use passes::icf;

/// Drives every pass over one document.
pub struct GenericRewriter {
    abi: Abi,
}

impl GenericRewriter {
    pub fn new(abi: Abi) -> Self {
        Self { abi }
    }

    fn onetime_fix(&self, contents: &[u8]) -> Vec<u8> {
        let mut contents = contents.to_vec();
        for rules in rules::onetime_rules_for(self.abi) {
            contents = rules::apply_rules(&contents, rules);
        }
        contents = passes::remove_branch_to_next(&contents);
        contents = passes::convert_jmp_ret(&contents);
        contents = passes::optimize_for_unreachable(&contents);
        contents = passes::remove_empty_sections(&contents);
        // Identical-code folding belongs here but stays disabled: it only
        // pays off under LTO and has produced hard-to-debug assembler input.
        // contents = passes::icf(&contents);
        forward::forward_pass(&contents, self.abi)
    }

    fn fix_round(&self, contents: &[u8]) -> Vec<u8> {
        let contents = rules::apply_rules(contents, &rules::REPEAT);
        let contents = passes::streamline_branches(&contents);
        let contents = passes::propagate_jumps(&contents);
        passes::remove_unused_labels(&contents)
    }

    /// Rewrite until a fixed point.
    pub fn apply(&self, contents: &[u8]) -> Vec<u8> {
        let start = Instant::now();
        let mut contents = passes::remove_unused_labels(contents);
        contents = self.onetime_fix(&contents);
        debug!(
            target: "hackas::profile",
            stage = "onetime",
            elapsed_us = start.elapsed().as_micros() as u64,
            "stage_complete"
        );

        let mut rounds = 0usize;
        loop {
            let round_start = Instant::now();
            let next = self.fix_round(&contents);
            rounds += 1;
            let changed = next != contents;
            debug!(
                target: "hackas::profile",
                stage = "repeat",
                round = rounds,
                elapsed_us = round_start.elapsed().as_micros() as u64,
                changed,
                "round_complete"
            );
            if next == contents {
                break;
            }
            contents = next;
        }
        debug!(
            target: "hackas::profile",
            stage = "total",
            rounds,
            bytes_out = contents.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "rewrite_complete"
        );
        contents
    }
}

/// Rewrite a canonicalized document for the given ABI.
pub fn rewrite(contents: &[u8], abi: Abi) -> Vec<u8> {
    GenericRewriter::new(abi).apply(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> String {
        String::from_utf8(rewrite(text.as_bytes(), Abi::Lp64)).unwrap()
    }

    #[test]
    fn fixpoint_chains_rewrites() {
        // jne over jmp collapses, then the dead label disappears.
        let src = "\tcmpl\t%esi, %edi\n\tjne\t.L2\n\tjmp\t.L3\n.L2:\n\tret\n.L3:\n\tmovl\t$1, %eax\n\tret\n";
        let out = run(src);
        assert!(out.contains("\tje\t.L3\n"), "got {out:?}");
        assert!(!out.contains(".L2"), "got {out:?}");
    }

    #[test]
    fn runs_are_idempotent() {
        let src =
            "\tmovl\t$0, %eax\n\tcmpb\t$2, %al\n\tjbe\t.L1\n\tmovl\t$5, %edx\n.L1:\n\tret\n";
        let once = run(src);
        assert_eq!(
            once,
            "\txor\t%eax,%eax\n\tcmpb\t$3, %al\n\tjb\t.L1\n\tmovl\t$5, %edx\n.L1:\n\tret\n"
        );
        let twice = run(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn unknown_lines_pass_through_unscathed()  {
        let src = "\tfrobnicate\t%eax, %ebx\n\tmystery\n";
        assert_eq!(run(src), src);
    }
}

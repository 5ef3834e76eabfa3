use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use core_rewrite::rewrite;
use core_x86::Abi;

// A representative compiler-output shape: prologue, compare ladder, a
// couple of forwarding labels and a null-guarded free.
fn sample_unit() -> Vec<u8> {
    let function = "\t.text\n\t.p2align 4\nfunc_NNN:\n\t.cfi_startproc\n\tmovl\t$0, %eax\n\tcmpb\t$2, %al\n\tjbe\t.LaNNN\n\tmovq\t%rdi, %rbx\n\ttestq\t%rdi, %rdi\n\tje\t.LbNNN\n\tcall\tfree@PLT\n.LbNNN:\n\tmovl\t.LcNNN(%rip), %eax\n\tret\n.LaNNN:\n\tjne\t.LdNNN\n\tjmp\t.LeNNN\n.LdNNN:\n\tret\n.LcNNN:\n\tjmp\t.LeNNN\n.LeNNN:\n\tret\n\t.cfi_endproc\n";
    let mut out = Vec::new();
    for i in 0..64 {
        out.extend_from_slice(function.replace("NNN", &i.to_string()).as_bytes());
    }
    out
}

fn bench_rewrite(c: &mut Criterion) {
    let input = sample_unit();
    c.bench_function("rewrite_64_functions", |b| {
        b.iter(|| rewrite(black_box(&input), Abi::Lp64))
    });
}

criterion_group!(benches, bench_rewrite);
criterion_main!(benches);

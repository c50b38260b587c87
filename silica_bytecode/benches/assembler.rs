use criterion::{black_box, criterion_group, criterion_main, Criterion};
use silica_bytecode::{r, Assembler, Cond, InterpMachine, Label};

fn assemble_loop(a: &mut Assembler) {
    a.mov_imm(r(0), 0);
    a.mov_imm(r(1), black_box(1000));
    let mut top = Label::new();
    a.bind(&mut top);
    a.add(r(0), r(1));
    a.add_imm(r(1), -1);
    a.test(r(1), -1);
    a.jmpc(&mut top, Cond::NZ);
    a.ret();
}

fn bench_assembler(c: &mut Criterion) {
    c.bench_function("assemble_countdown_loop", |b| {
        let mut a = Assembler::new(InterpMachine::get());
        b.iter(|| {
            assemble_loop(&mut a);
            black_box(a.finish());
        });
    });
}

criterion_group!(benches, bench_assembler);
criterion_main!(benches);

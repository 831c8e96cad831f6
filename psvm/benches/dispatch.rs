//! Dispatch and allocator fast paths.
//!
//! Run with: cargo bench --bench dispatch

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use psvm::{
    Bank, EntityKind, EntityTag, Memory, NoRoots, Object, Scheduler, Vm, VmCreateInfo, VmSettings,
};

fn bench_dispatch(c: &mut Criterion) {
    let mut vm = Vm::new(&VmCreateInfo::default()).expect("vm");
    let mut host = Scheduler::new();
    let mut context = vm.new_context(&mut host).expect("context");
    let mut out = Vec::new();
    let add = vm.opcode("add").expect("add");

    let mut group = c.benchmark_group("dispatch");
    for (label, a, b) in [
        ("int_int", Object::int(3), Object::int(4)),
        ("int_real", Object::int(3), Object::real(4.5)),
    ] {
        group.bench_with_input(BenchmarkId::new("add", label), &(a, b), |bench, &(a, b)| {
            bench.iter(|| {
                let operands = &mut context.stacks.operands;
                operands.push(black_box(a)).expect("push");
                operands.push(black_box(b)).expect("push");
                vm.dispatch(add, &mut context, &mut host, &mut out)
                    .expect("add");
                black_box(context.stacks.operands.pop())
            })
        });
    }
    group.finish();
}

fn bench_allocator(c: &mut Criterion) {
    let mut memory = Memory::new(Bank::Local, &VmSettings::default()).expect("memory");
    let tag = EntityTag::new(EntityKind::String);

    c.bench_function("allocate_free_reuse", |bench| {
        bench.iter(|| {
            let id = memory
                .allocate(black_box(48), tag, &NoRoots)
                .expect("allocate");
            memory.free(id).expect("free");
        })
    });
}

criterion_group!(benches, bench_dispatch, bench_allocator);
criterion_main!(benches);

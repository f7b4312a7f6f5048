use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fiber::Fiber;
use fiber::stack::DefaultFiberStack;

fn fiber_switch(c: &mut Criterion) {
    let stack = DefaultFiberStack::default();
    let mut identity = Fiber::with_stack(stack, |mut input: usize, suspend, _local: &()| {
        loop {
            input = suspend.suspend(input)
        }
    });

    c.bench_function("fiber_switch", |b| b.iter(|| identity.resume(black_box(0usize))));

    unsafe {
        identity.force_reset();
    }
}

fn fiber_call(c: &mut Criterion) {
    let mut stack = DefaultFiberStack::default();

    c.bench_function("fiber_call", move |b| {
        b.iter(|| {
            let mut identity = Fiber::<usize, (), usize, (), _>::with_stack(
                &mut stack,
                |input, _suspend, _local| input,
            );
            identity.resume(black_box(0usize))
        })
    });
}

criterion_group!(benches, fiber_switch, fiber_call);
criterion_main!(benches);

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use reagent::{blocking_molecule, molecule, site, InputPattern, Reaction, ReactionPool};

/// One blocking request/response through a two-molecule reaction: emit the
/// payload, then a blocking call that the reaction answers.
fn round_trip(c: &mut Criterion) {
    let pool = ReactionPool::new("bench", None);
    let m = molecule::<u64>("m");
    let f = blocking_molecule::<(), u64>("f");

    let echo = Reaction::new(|inputs| {
        let n: u64 = inputs.cloned(0)?;
        inputs.reply(1, n)
    })
    .consumes(&m, InputPattern::var("n"))
    .consumes(&f, InputPattern::wildcard());
    let _site = site(&pool, [echo]).unwrap();

    let mut group = c.benchmark_group("round_trip");
    group.throughput(Throughput::Elements(1));
    group.bench_function("blocking echo", |b| {
        b.iter(|| {
            m.emit(1).unwrap();
            f.emit(()).unwrap()
        })
    });
    group.finish();
}

/// Non-blocking emission throughput through a counter-style decrement
/// chain, ending with one blocking read once the chain drains.
fn decrement_chain(c: &mut Criterion) {
    let pool = ReactionPool::new("bench-chain", None);
    let counter = molecule::<i64>("counter");
    let tick = molecule::<()>("tick");
    let read = blocking_molecule::<(), i64>("read");

    let step = {
        let counter2 = counter.clone();
        Reaction::new(move |inputs| {
            let n: i64 = inputs.cloned(0)?;
            counter2.emit(n - 1)?;
            Ok(())
        })
        .consumes(&counter, InputPattern::var("n"))
        .consumes(&tick, InputPattern::wildcard())
        .emits(&counter)
    };
    let report = Reaction::new(|inputs| {
        let n: i64 = inputs.cloned(0)?;
        inputs.reply(1, n)
    })
    .consumes(&counter, InputPattern::constant(0i64))
    .consumes(&read, InputPattern::wildcard());
    let _site = site(&pool, [step, report]).unwrap();

    const TICKS: i64 = 100;
    let mut group = c.benchmark_group("decrement_chain");
    group.throughput(Throughput::Elements(TICKS as u64));
    group.bench_function("100 ticks", |b| {
        b.iter(|| {
            counter.emit(TICKS).unwrap();
            for _ in 0..TICKS {
                tick.emit(()).unwrap();
            }
            read.emit(()).unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, round_trip, decrement_chain);
criterion_main!(benches);

//! Recompute benchmarks over a few graph shapes.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use scigraph_core::{
    ArrayBuffer, ComputationError, ComputationSpec, DataItemId, Document, DocumentConfig,
    ItemUpdate, Metadata, OperationInput, OperationOutput, OperationRegistry, Parameters,
};

fn scale(
    inputs: &[OperationInput],
    params: &Parameters,
) -> Result<OperationOutput, ComputationError> {
    let factor = params.get("factor").and_then(|v| v.as_f64()).unwrap_or(1.0);
    let mut out = vec![0.0; inputs[0].buffer.len()];
    for input in inputs {
        for (o, v) in out.iter_mut().zip(input.buffer.values().to_f64_vec()) {
            *o += v * factor;
        }
    }
    Ok(OperationOutput::new(ArrayBuffer::from_f64(out)))
}

fn document() -> Document {
    let registry = OperationRegistry::new().with("scale", scale);
    Document::new(DocumentConfig::default(), registry).unwrap()
}

fn source(doc: &mut Document, len: usize) -> DataItemId {
    doc.create_item(ArrayBuffer::from_f64(vec![1.0; len]), Metadata::new())
        .unwrap()
}

fn touch(doc: &mut Document, id: DataItemId, len: usize, value: f64) {
    doc.update_item(id, ItemUpdate::buffer(ArrayBuffer::from_f64(vec![value; len])))
        .unwrap();
}

/// Linear chain: every edit reruns every link.
fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    for links in [10usize, 100] {
        let mut doc = document();
        let head = source(&mut doc, 64);
        let mut previous = head;
        for _ in 0..links {
            let id = doc
                .add_computation(ComputationSpec::new("scale").input(previous).param("factor", 1.0))
                .unwrap();
            previous = doc.computation(id).unwrap().output();
        }

        let mut value = 0.0;
        group.bench_with_input(BenchmarkId::from_parameter(links), &links, |b, _| {
            b.iter(|| {
                value += 1.0;
                touch(&mut doc, head, 64, value);
                black_box(doc.item(previous).unwrap().modified());
            });
        });
    }
    group.finish();
}

/// One source fanned out to many computations joined by a final sum.
fn bench_diamond(c: &mut Criterion) {
    let mut group = c.benchmark_group("diamond");
    for width in [8usize, 64] {
        let mut doc = document();
        let head = source(&mut doc, 256);
        let mut join = ComputationSpec::new("scale");
        for _ in 0..width {
            let id = doc
                .add_computation(ComputationSpec::new("scale").input(head).param("factor", 2.0))
                .unwrap();
            join = join.input(doc.computation(id).unwrap().output());
        }
        doc.add_computation(join).unwrap();

        let mut value = 0.0;
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                value += 1.0;
                touch(&mut doc, head, 256, value);
            });
        });
    }
    group.finish();
}

/// Settle with nothing to do: the cost of planning alone.
fn bench_settle_noop(c: &mut Criterion) {
    let mut doc = document();
    let head = source(&mut doc, 16);
    for _ in 0..100 {
        doc.add_computation(ComputationSpec::new("scale").input(head))
            .unwrap();
    }
    c.bench_function("settle_noop", |b| {
        b.iter(|| black_box(doc.settle().unwrap().executed));
    });
}

/// Undo and redo of an edit that reran a fan-out.
fn bench_undo_redo(c: &mut Criterion) {
    let mut doc = document();
    let head = source(&mut doc, 256);
    for _ in 0..32 {
        doc.add_computation(ComputationSpec::new("scale").input(head).param("factor", 3.0))
            .unwrap();
    }
    touch(&mut doc, head, 256, 5.0);
    c.bench_function("undo_redo_fanout", |b| {
        b.iter(|| {
            doc.undo().unwrap();
            doc.redo().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_chain,
    bench_diamond,
    bench_settle_noop,
    bench_undo_redo
);
criterion_main!(benches);

//! Benchmarks for the convolutional recurrent cells.

use convgate::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_conv2d_gru_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv2d_gru_forward");

    for size in [8, 16, 32].iter() {
        let store = VarStore::new();
        let root = store.root();
        let cfg = Conv2dConfig::conv2d_gru();
        let x = Tensor::full(&[1, *size, *size, 8], 0.1);
        conv2d_gru(&root, &x, 8, true, false, &cfg).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| no_grad(|| conv2d_gru(&root, black_box(&x), 8, true, true, &cfg).unwrap()));
        });
    }

    group.finish();
}

fn bench_conv2d_gru_causal(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv2d_gru_left_padding");

    for dilation in [1, 2, 4].iter() {
        let store = VarStore::new();
        let root = store.root();
        let cfg = Conv2dConfig::conv2d_gru()
            .with_filter_size((3, 1))
            .with_dilation((*dilation, 1))
            .with_padding(Padding::Left);
        let x = Tensor::full(&[1, 32, 1, 16], 0.1);
        conv2d_gru(&root, &x, 16, true, false, &cfg).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(dilation), dilation, |b, _| {
            b.iter(|| no_grad(|| conv2d_gru(&root, black_box(&x), 16, true, true, &cfg).unwrap()));
        });
    }

    group.finish();
}

fn bench_conv2d_lstm_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv2d_lstm_forward");

    for size in [8, 16, 32].iter() {
        let store = VarStore::new();
        let root = store.root();
        let cfg = Conv2dConfig::conv2d_lstm();
        let x = Tensor::full(&[1, *size, *size, 4], 0.1);
        let (_, state) = conv2d_lstm(&root, &x, None, 8, true, false, &cfg).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                no_grad(|| conv2d_lstm(&root, black_box(&x), Some(&state), 8, true, true, &cfg).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_conv2d_gru_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv2d_gru_backward");

    for size in [8, 16].iter() {
        let store = VarStore::new();
        let root = store.root();
        let cfg = Conv2dConfig::conv2d_gru();
        let x = Tensor::full(&[1, *size, *size, 4], 0.1).requires_grad();
        conv2d_gru(&root, &x, 4, true, false, &cfg).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                clear_graph();
                let y = conv2d_gru(&root, black_box(&x), 4, true, true, &cfg).unwrap();
                y.sum().backward();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_conv2d_gru_forward,
    bench_conv2d_gru_causal,
    bench_conv2d_lstm_forward,
    bench_conv2d_gru_backward
);
criterion_main!(benches);

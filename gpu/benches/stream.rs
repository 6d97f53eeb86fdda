// SPDX-License-Identifier: MPL-2.0

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use umbra_gpu::{
    backend::null::{CompletionMode, NullBackend},
    shader::WgslPassthrough,
    Capabilities, GpuConfig, GraphicsContext,
};

fn context() -> GraphicsContext {
    let (backend, control) = NullBackend::new(Capabilities::default());
    control.set_completion_mode(CompletionMode::Immediate);

    GraphicsContext::new(Box::new(backend), GpuConfig::default(), Box::new(WgslPassthrough))
        .unwrap()
}

fn push_vertices(c: &mut Criterion) {
    let mut ctx = context();
    let quad = [[0u8; 32]; 4];

    c.bench_function("stream::push_vertices", |b| {
        b.iter(|| ctx.push_vertices(black_box(&quad)))
    });
}

fn push_uniforms(c: &mut Criterion) {
    let mut ctx = context();
    let block = [0.5f32; 16];

    c.bench_function("stream::push_uniforms", |b| {
        b.iter(|| ctx.push_uniforms(black_box(&block)))
    });
}

fn map_index_buffer(c: &mut Criterion) {
    let mut ctx = context();

    c.bench_function("stream::map_index_buffer", |b| {
        b.iter(|| {
            let (base, indices) = ctx.map_index_buffer(6);
            indices.fill(1);
            ctx.unmap_index_buffer(6);
            base
        })
    });
}

criterion_group!(benches, push_vertices, push_uniforms, map_index_buffer);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use drybox_core::bearer::{Bearer, ScenarioBearerParams};

fn benchmark_send_poll_cycle(c: &mut Criterion) {
    let params = ScenarioBearerParams {
        loss_rate: Some(0.05),
        reorder_rate: Some(0.02),
        jitter_ms: Some(15),
        latency_ms: Some(60),
        ..Default::default()
    };

    c.bench_function("volte_evs_send_poll_1000_ticks", |b| {
        b.iter(|| {
            let mut bearer =
                Bearer::make("telco_volte_evs", &params, ChaCha8Rng::seed_from_u64(1)).unwrap();
            for t in 0..1000u64 {
                bearer.send(black_box(b"payload"), t * 20);
                black_box(bearer.poll_deliver(t * 20));
            }
            black_box(bearer.stats())
        })
    });
}

fn benchmark_bearer_kinds(c: &mut Criterion) {
    let mut group = c.benchmark_group("bearer_kinds");
    for kind in ["telco_volte_evs", "telco_cs_gsm", "telco_pstn_g711", "ott_udp"] {
        group.bench_with_input(BenchmarkId::from_parameter(kind), kind, |b, &kind| {
            let params = ScenarioBearerParams::default();
            b.iter(|| {
                let mut bearer = Bearer::make(kind, &params, ChaCha8Rng::seed_from_u64(2)).unwrap();
                for t in 0..500u64 {
                    bearer.send(black_box(b"x"), t * 20);
                    black_box(bearer.poll_deliver(t * 20));
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_send_poll_cycle, benchmark_bearer_kinds);
criterion_main!(benches);

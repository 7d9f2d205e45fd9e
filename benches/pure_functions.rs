use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ha_eink_screenshot_engine::config::AppConfig;
use ha_eink_screenshot_engine::request::{self, DitherMethod, Palette};
use ha_eink_screenshot_engine::scheduler::normalize_cron;
use std::collections::HashMap;
use std::time::Duration;

fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("default", |b| {
        b.iter(|| {
            let config = AppConfig::default();
            black_box(config);
        });
    });

    group.finish();
}

fn benchmark_request_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_parse");
    configure_fast_group(&mut group);

    let mut params = HashMap::new();
    params.insert("viewport".to_string(), "800x480".to_string());
    params.insert("zoom".to_string(), "1.5".to_string());
    params.insert("rotate".to_string(), "180".to_string());
    params.insert("format".to_string(), "jpeg".to_string());
    params.insert("crop".to_string(), "0,0,400,300".to_string());
    params.insert("dither".to_string(), "1".to_string());
    params.insert("dither_method".to_string(), "ordered".to_string());
    params.insert("palette".to_string(), "gray16".to_string());

    group.bench_function("full_query_string", |b| {
        b.iter(|| {
            let result = request::parse("/lovelace/0", black_box(&params));
            black_box(result)
        });
    });

    group.finish();
}

fn benchmark_dither_and_palette_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("dither_palette_parse");
    configure_fast_group(&mut group);

    group.bench_function("dither_method", |b| {
        b.iter(|| black_box(DitherMethod::parse(black_box("ordered"))));
    });

    group.bench_function("palette_hex_colors", |b| {
        b.iter(|| black_box(Palette::parse(black_box("color7a")).hex_colors()));
    });

    group.finish();
}

fn benchmark_normalize_cron(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize_cron");
    configure_fast_group(&mut group);

    group.bench_function("five_field", |b| {
        b.iter(|| black_box(normalize_cron(black_box("*/5 * * * *"))));
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_config_creation,
    benchmark_request_parse,
    benchmark_dither_and_palette_parse,
    benchmark_normalize_cron
);
criterion_main!(benches);

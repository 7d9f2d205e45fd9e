//! Full Serializer -> Browser Driver -> Image Pipeline round trip.
//!
//! Gated behind `integration_benchmarks` (see Cargo.toml) since it spawns a
//! Tokio runtime per iteration and exercises the same admission/capture path
//! production traffic takes, unlike `pure_functions.rs`'s allocation-free
//! parsing benchmarks.

#![cfg(feature = "integration_benchmarks")]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ha_eink_screenshot_engine::browser_driver::BrowserDriver;
use ha_eink_screenshot_engine::config::AppConfig;
use ha_eink_screenshot_engine::facade::BrowserFacade;
use ha_eink_screenshot_engine::request;
use ha_eink_screenshot_engine::serializer::RequestSerializer;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn mock_serializer() -> Arc<RequestSerializer> {
    let config = Arc::new(AppConfig { mock_ha: true, ..AppConfig::default() });
    let driver = Arc::new(BrowserDriver::new(config.clone()));
    let facade = Arc::new(BrowserFacade::new(driver.clone()));
    RequestSerializer::new(config, driver, facade)
}

fn benchmark_mock_screenshot_round_trip(c: &mut Criterion) {
    let runtime = Runtime::new().expect("tokio runtime");
    let serializer = mock_serializer();
    let params: HashMap<String, String> = [("viewport".to_string(), "800x480".to_string())].into();
    let req = request::parse("/lovelace/0", &params).expect("valid request");

    c.bench_function("mock_screenshot_round_trip", |b| {
        b.to_async(&runtime).iter(|| {
            let serializer = serializer.clone();
            let req = req.clone();
            async move { black_box(serializer.screenshot(&req).await) }
        });
    });
}

criterion_group!(benches, benchmark_mock_screenshot_round_trip);
criterion_main!(benches);

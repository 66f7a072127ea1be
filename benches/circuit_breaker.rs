use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lifeline::cache::{CacheConfig, ResultCache};
use lifeline::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use lifeline::gateway::{CallRequest, Gateway};
use lifeline::sleeper::InstantSleeper;
use lifeline::RtlConfig;
use std::time::Duration;

fn circuit_breaker_admission_closed(c: &mut Criterion) {
    let config = CircuitBreakerConfig::new(10, 2, Duration::from_secs(30)).unwrap();
    let breaker = CircuitBreaker::new("polly", config);

    c.bench_function("circuit_breaker_admit_and_record_success", |b| {
        b.iter(|| {
            let guard = breaker.try_admit();
            breaker.record_success();
            black_box(guard.is_ok())
        });
    });
}

fn circuit_breaker_rejection_open(c: &mut Criterion) {
    let config = CircuitBreakerConfig::new(1, 2, Duration::from_secs(30)).unwrap();
    let breaker = CircuitBreaker::new("polly", config);
    breaker.record_failure(); // open on first failure

    c.bench_function("circuit_breaker_reject_when_open", |b| {
        b.iter(|| black_box(breaker.try_admit().is_err()));
    });
}

fn cache_hit_and_eviction(c: &mut Criterion) {
    let cache: ResultCache<u64> = ResultCache::new(CacheConfig { capacity: 1024, ..CacheConfig::default() });
    for i in 0..1024u64 {
        cache.set(format!("polly:audio:{i}"), i, None);
    }

    c.bench_function("cache_get_hit", |b| {
        b.iter(|| black_box(cache.get(black_box("polly:audio:512"))));
    });

    let mut next = 1024u64;
    c.bench_function("cache_set_with_lru_eviction", |b| {
        b.iter(|| {
            next += 1;
            cache.set(format!("polly:audio:{next}"), next, None);
        });
    });
}

fn gateway_cached_call(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let gateway: Gateway<Vec<u8>> =
        Gateway::builder(RtlConfig::default()).provider("polly").sleeper(InstantSleeper).build();

    c.bench_function("gateway_execute_cache_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let request = CallRequest::new("polly", "synthesize").cached("polly:audio:hello");
            let out = gateway
                .execute(request, |_| async { Ok::<_, std::io::Error>(vec![0u8; 64]) })
                .await;
            black_box(out.is_ok())
        });
    });
}

criterion_group!(
    benches,
    circuit_breaker_admission_closed,
    circuit_breaker_rejection_open,
    cache_hit_and_eviction,
    gateway_cached_call
);
criterion_main!(benches);

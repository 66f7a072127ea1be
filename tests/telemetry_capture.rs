use lifeline::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use lifeline::clock::ManualClock;
use lifeline::pool::PoolConfig;
use lifeline::registry::ProviderRegistry;
use lifeline::telemetry::{AlertKind, MemorySink, RtlEvent, Telemetry};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture() -> (Arc<Mutex<Vec<u8>>>, tracing::subscriber::DefaultGuard) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(SharedWriter(buf.clone())))
        .with_target(true)
        .with_max_level(tracing::Level::DEBUG)
        .without_time()
        .with_ansi(false)
        .finish();
    (buf, tracing::subscriber::set_default(subscriber))
}

fn output(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(buf.lock().unwrap().clone()).unwrap()
}

#[test]
fn registry_warns_when_provider_is_replaced() {
    let (buf, _guard) = capture();

    let registry = ProviderRegistry::default();
    registry.register("polly", PoolConfig::default());
    registry.register("polly", PoolConfig::default());

    let logs = output(&buf);
    assert!(logs.contains("lifeline::registry"), "logs: {logs}");
    assert!(logs.contains("last registration wins"), "logs: {logs}");
}

#[test]
fn breaker_transitions_reach_logs_sinks_and_alerts() {
    let (buf, _guard) = capture();
    let alerts = Arc::new(Mutex::new(Vec::new()));
    let seen = alerts.clone();
    let sink = MemorySink::new();
    let telemetry = Telemetry::new()
        .with_sink(sink.clone())
        .with_alert_hook(move |kind: AlertKind, provider: &str, _message: &str| {
            seen.lock().unwrap().push((kind, provider.to_string()));
        });

    let clock = ManualClock::new();
    let config = CircuitBreakerConfig::new(2, 1, Duration::from_secs(30)).unwrap();
    let breaker = CircuitBreaker::with_parts("azure", config, Arc::new(clock.clone()), telemetry);

    breaker.record_failure();
    breaker.record_failure();
    clock.advance(Duration::from_secs(30));
    assert!(breaker.can_execute().is_allowed());
    breaker.record_success();

    assert_eq!(
        sink.events(),
        vec![
            RtlEvent::CircuitOpened { provider: "azure".into(), failure_count: 2 },
            RtlEvent::CircuitHalfOpen { provider: "azure".into() },
            RtlEvent::CircuitClosed { provider: "azure".into() },
        ]
    );
    assert_eq!(alerts.lock().unwrap().len(), 1);
    let logs = output(&buf);
    assert!(logs.contains("circuit breaker → open"), "logs: {logs}");
}

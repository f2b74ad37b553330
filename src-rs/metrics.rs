use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

pub static ADMISSION_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "admission_requests_total",
        "Requests evaluated by the admission gate",
        &["verdict"]
    )
    .expect("admission_requests_total registers once")
});

pub static SWEEP_EVICTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "admission_sweep_evicted_total",
        "Idle client entries evicted by the sweeper"
    )
    .expect("admission_sweep_evicted_total registers once")
});

pub static TRACKED_KEYS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "admission_tracked_keys",
        "Client keys held by the limiter after the last sweep"
    )
    .expect("admission_tracked_keys registers once")
});

pub fn record_verdict(allowed: bool) {
    let verdict = if allowed { "allowed" } else { "denied" };
    ADMISSION_REQUESTS.with_label_values(&[verdict]).inc();
}

pub fn record_sweep(evicted: usize, tracked: usize) {
    SWEEP_EVICTED.inc_by(evicted as u64);
    TRACKED_KEYS.set(tracked as i64);
}

pub fn render() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#![allow(dead_code)]

use mediafetch_core::{EngineConfig, TransferEngine};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::{Request, Respond, ResponseTemplate};

pub const MIB: usize = 1024 * 1024;

/// Deterministic, non-repeating-looking payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect()
}

/// Engine config rooted in `dir` with fast retries
pub fn engine_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(dir.join("meta"), dir.join("temp"));
    config.retry_delay = Duration::from_millis(10);
    config.max_retries = 2;
    config
}

/// Serves `body`, honouring `Range: bytes=N-` with a 206
pub struct RangeResponder {
    pub body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len();
        let start = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());

        match start {
            Some(start) if start < total => ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {}-{}/{}", start, total - 1, total).as_str(),
                )
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(self.body[start..].to_vec()),
            Some(_) => ResponseTemplate::new(416),
            None => ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(self.body.clone()),
        }
    }
}

/// Serves `body` after `delay`, recording when each request arrived
pub struct ArrivalLog {
    pub body: Vec<u8>,
    pub delay: Duration,
    pub arrivals: Arc<Mutex<Vec<Instant>>>,
}

impl ArrivalLog {
    pub fn new(body: Vec<u8>, delay: Duration) -> Self {
        Self {
            body,
            delay,
            arrivals: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Respond for ArrivalLog {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.arrivals.lock().unwrap().push(Instant::now());
        ResponseTemplate::new(200)
            .set_body_bytes(self.body.clone())
            .set_delay(self.delay)
    }
}

/// Most arrivals falling inside any span shorter than `window`
pub fn peak_overlap(arrivals: &[Instant], window: Duration) -> usize {
    let mut sorted = arrivals.to_vec();
    sorted.sort();
    (0..sorted.len())
        .map(|i| {
            sorted[i..]
                .iter()
                .take_while(|t| t.duration_since(sorted[i]) < window)
                .count()
        })
        .max()
        .unwrap_or(0)
}

/// Highest `active_count` seen until `done` fires
pub async fn peak_active(engine: TransferEngine, done: CancellationToken) -> usize {
    let mut peak = 0;
    while !done.is_cancelled() {
        peak = peak.max(engine.active_count().await);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    peak
}

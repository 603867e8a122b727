use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

#[cfg(feature = "sampler")]
use std::sync::Mutex;

/// Bytes of controller-owned buffers currently allocated, and the high water
/// mark since the last reset.
///
/// Clones share the same counters, so a sampler can read what the controller
/// writes without touching any buffer.
#[derive(Clone, Debug, Default)]
pub struct MemoryGauge {
    inner: Arc<GaugeCounters>,
}

#[derive(Debug, Default)]
struct GaugeCounters {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, size: usize) {
        let now = self.inner.current.fetch_add(size, Ordering::AcqRel) + size;
        self.inner.peak.fetch_max(now, Ordering::AcqRel);
    }

    pub fn release(&self, size: usize) {
        self.inner.current.fetch_sub(size, Ordering::AcqRel);
    }

    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }

    /// Starts a new high water mark at the current level.
    pub fn reset_peak(&self) {
        self.inner.peak.store(self.current(), Ordering::Release);
    }
}

/// What a layer was waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitPhase {
    Input,
    Permission,
    FanOutReceive,
}

/// Hooks the controller calls at fixed points of every layer. All methods
/// default to doing nothing.
pub trait LayerObserver {
    fn layer_started(&mut self, _layer: usize) {}

    fn waited(&mut self, _layer: usize, _phase: WaitPhase, _elapsed: Duration) {}

    fn layer_finished(&mut self, _layer: usize, _elapsed: Duration) {}

    fn inference_finished(&mut self, _elapsed: Duration) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl LayerObserver for NoopObserver {}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LayerProfile {
    pub layer: usize,
    pub elapsed: Duration,
    pub waited: Duration,
    pub peak_memory: usize,
}

/// Records per-layer timings and the memory high water mark of each layer.
#[derive(Clone, Debug)]
pub struct Profiler {
    gauge: MemoryGauge,
    current_wait: Duration,
    layers: Vec<LayerProfile>,
    total: Option<Duration>,
}

impl Profiler {
    pub fn new(gauge: MemoryGauge) -> Self {
        Self {
            gauge,
            current_wait: Duration::ZERO,
            layers: Vec::new(),
            total: None,
        }
    }

    pub fn layers(&self) -> &[LayerProfile] {
        &self.layers
    }

    pub fn total(&self) -> Option<Duration> {
        self.total
    }

    pub fn total_wait(&self) -> Duration {
        self.layers.iter().map(|l| l.waited).sum()
    }
}

impl LayerObserver for Profiler {
    fn layer_started(&mut self, _layer: usize) {
        self.current_wait = Duration::ZERO;
        self.gauge.reset_peak();
    }

    fn waited(&mut self, _layer: usize, _phase: WaitPhase, elapsed: Duration) {
        self.current_wait += elapsed;
    }

    fn layer_finished(&mut self, layer: usize, elapsed: Duration) {
        self.layers.push(LayerProfile {
            layer,
            elapsed,
            waited: self.current_wait,
            peak_memory: self.gauge.peak(),
        });
    }

    fn inference_finished(&mut self, elapsed: Duration) {
        self.total = Some(elapsed);
    }
}

/// Most samples a [`MemorySampler`] keeps.
#[cfg(feature = "sampler")]
pub const MAX_MEMORY_SAMPLES: usize = 4096;

/// Periodically copies the gauge into a private log from a tokio task. It
/// only ever reads the gauge.
#[cfg(feature = "sampler")]
pub struct MemorySampler {
    samples: Arc<Mutex<Vec<usize>>>,
    task: tokio::task::JoinHandle<()>,
}

#[cfg(feature = "sampler")]
impl MemorySampler {
    /// Must be called from within a tokio runtime.
    pub fn start(gauge: MemoryGauge, period: Duration) -> Self {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let log = samples.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Ok(mut log) = log.lock() else {
                    return;
                };
                if log.len() >= MAX_MEMORY_SAMPLES {
                    return;
                }
                log.push(gauge.current());
            }
        });
        Self { samples, task }
    }

    /// Stops sampling and returns what was collected.
    pub fn stop(self) -> Vec<usize> {
        self.task.abort();
        match self.samples.lock() {
            Ok(mut samples) => std::mem::take(&mut *samples),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_the_high_water_mark() {
        let gauge = MemoryGauge::new();
        gauge.allocate(100);
        gauge.allocate(50);
        gauge.release(100);
        assert_eq!(gauge.current(), 50);
        assert_eq!(gauge.peak(), 150);
        gauge.reset_peak();
        assert_eq!(gauge.peak(), 50);
    }

    #[test]
    fn profiler_records_each_layer() {
        let gauge = MemoryGauge::new();
        let mut profiler = Profiler::new(gauge.clone());

        profiler.layer_started(0);
        gauge.allocate(64);
        profiler.waited(0, WaitPhase::Input, Duration::from_millis(3));
        profiler.waited(0, WaitPhase::Permission, Duration::from_millis(2));
        profiler.layer_finished(0, Duration::from_millis(10));
        gauge.release(64);

        profiler.layer_started(1);
        profiler.layer_finished(1, Duration::from_millis(4));
        profiler.inference_finished(Duration::from_millis(14));

        assert_eq!(
            profiler.layers()[0],
            LayerProfile {
                layer: 0,
                elapsed: Duration::from_millis(10),
                waited: Duration::from_millis(5),
                peak_memory: 64,
            }
        );
        assert_eq!(profiler.layers()[1].peak_memory, 0);
        assert_eq!(profiler.total_wait(), Duration::from_millis(5));
        assert_eq!(profiler.total(), Some(Duration::from_millis(14)));
    }

    #[cfg(feature = "sampler")]
    #[tokio::test]
    async fn sampler_reads_the_gauge() {
        let gauge = MemoryGauge::new();
        gauge.allocate(128);
        let sampler = MemorySampler::start(gauge.clone(), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let samples = sampler.stop();
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|&s| s == 128));
        assert_eq!(gauge.current(), 128);
    }
}

//! Translator metrics through the `metrics` facade.
//!
//! The translator reports deltas of its [`CacheStats`] after every public
//! operation; whichever recorder is installed sees them. The CLI installs
//! [`CliRecorder`] to print a summary on exit.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{
    Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit, counter,
    describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use parking_lot::RwLock;

use crate::cache::CacheStats;

pub const BLOCKS_COMPILED: &str = "drc_blocks_compiled_total";
pub const CACHE_HITS: &str = "drc_cache_hits_total";
pub const CACHE_MISSES: &str = "drc_cache_misses_total";
pub const INVALIDATIONS: &str = "drc_invalidations_total";
pub const RESTORES: &str = "drc_restores_total";
pub const EXPIRED_BLOCKS: &str = "drc_expired_blocks_total";
pub const LINKS_PATCHED: &str = "drc_links_patched_total";
pub const BUFFER_OCCUPANCY: &str = "drc_code_buffer_occupancy";
pub const BLOCK_BYTES: &str = "drc_block_host_bytes";

// ============================================================================
// Descriptions
// ============================================================================

/// Register metric descriptions. Call once at startup.
pub fn init() {
    describe_counter!(BLOCKS_COMPILED, Unit::Count, "Guest blocks translated");
    describe_counter!(CACHE_HITS, Unit::Count, "Lookups answered from the block cache");
    describe_counter!(CACHE_MISSES, Unit::Count, "Lookups that required a compile");
    describe_counter!(INVALIDATIONS, Unit::Count, "Blocks dropped after a guest write");
    describe_counter!(RESTORES, Unit::Count, "Restore candidates reinstated without recompiling");
    describe_counter!(EXPIRED_BLOCKS, Unit::Count, "Blocks reclaimed when the code buffer wrapped");
    describe_counter!(LINKS_PATCHED, Unit::Count, "Jumps patched straight to their target block");
    describe_gauge!(BUFFER_OCCUPANCY, Unit::Percent, "Share of the code buffer holding live blocks");
    describe_histogram!(BLOCK_BYTES, Unit::Bytes, "Host code size per translated block");
}

// ============================================================================
// Recording
// ============================================================================

/// Report what changed between two snapshots of the cache counters.
pub fn record_stats(isa: &str, before: &CacheStats, after: &CacheStats) {
    let labels = [("isa", isa.to_string())];
    let deltas = [
        (BLOCKS_COMPILED, after.compiled - before.compiled),
        (CACHE_HITS, after.hits - before.hits),
        (CACHE_MISSES, after.misses - before.misses),
        (INVALIDATIONS, after.invalidations - before.invalidations),
        (RESTORES, after.restores - before.restores),
        (EXPIRED_BLOCKS, after.expired - before.expired),
        (LINKS_PATCHED, after.links_patched - before.links_patched),
    ];
    for (name, delta) in deltas {
        if delta > 0 {
            counter!(name, &labels).increment(delta);
        }
    }
}

pub fn record_block(isa: &str, host_bytes: usize) {
    histogram!(BLOCK_BYTES, "isa" => isa.to_string()).record(host_bytes as f64);
}

/// Percentage of `capacity` taken by `used` bytes of live code.
pub fn record_occupancy(isa: &str, used: usize, capacity: usize) {
    if capacity > 0 {
        gauge!(BUFFER_OCCUPANCY, "isa" => isa.to_string()).set(used as f64 * 100.0 / capacity as f64);
    }
}

// ============================================================================
// In-memory recorder for the CLI
// ============================================================================

struct Storage<T> {
    values: RwLock<HashMap<String, T>>,
}

impl<T> Default for Storage<T> {
    fn default() -> Self {
        Self { values: RwLock::new(HashMap::new()) }
    }
}

struct Handle<T> {
    key: String,
    storage: Arc<Storage<T>>,
}

impl metrics::CounterFn for Handle<u64> {
    fn increment(&self, value: u64) {
        *self.storage.values.write().entry(self.key.clone()).or_insert(0) += value;
    }

    fn absolute(&self, value: u64) {
        self.storage.values.write().insert(self.key.clone(), value);
    }
}

impl metrics::GaugeFn for Handle<f64> {
    fn increment(&self, value: f64) {
        *self.storage.values.write().entry(self.key.clone()).or_insert(0.0) += value;
    }

    fn decrement(&self, value: f64) {
        *self.storage.values.write().entry(self.key.clone()).or_insert(0.0) -= value;
    }

    fn set(&self, value: f64) {
        self.storage.values.write().insert(self.key.clone(), value);
    }
}

impl metrics::HistogramFn for Handle<Vec<f64>> {
    fn record(&self, value: f64) {
        self.storage.values.write().entry(self.key.clone()).or_default().push(value);
    }
}

/// Recorder keeping every metric in memory.
#[derive(Default)]
pub struct CliRecorder {
    counters: Arc<Storage<u64>>,
    gauges: Arc<Storage<f64>>,
    histograms: Arc<Storage<Vec<f64>>>,
}

impl CliRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install as the global recorder. Returns `None` if one is already set.
    #[must_use]
    pub fn install(self) -> Option<CliRecorderHandle> {
        let handle = CliRecorderHandle {
            counters: Arc::clone(&self.counters),
            gauges: Arc::clone(&self.gauges),
            histograms: Arc::clone(&self.histograms),
        };
        metrics::set_global_recorder(self).ok()?;
        Some(handle)
    }
}

fn key_to_string(key: &Key) -> String {
    let labels: Vec<String> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}{{{}}}", key.name(), labels.join(","))
    }
}

impl Recorder for CliRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(Handle { key: key_to_string(key), storage: Arc::clone(&self.counters) }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(Handle { key: key_to_string(key), storage: Arc::clone(&self.gauges) }))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(Handle { key: key_to_string(key), storage: Arc::clone(&self.histograms) }))
    }
}

/// Read access to what [`CliRecorder`] collected.
pub struct CliRecorderHandle {
    counters: Arc<Storage<u64>>,
    gauges: Arc<Storage<f64>>,
    histograms: Arc<Storage<Vec<f64>>>,
}

impl CliRecorderHandle {
    #[must_use]
    pub fn get_counter(&self, key: &str) -> Option<u64> {
        self.counters.values.read().get(key).copied()
    }

    #[must_use]
    pub fn get_gauge(&self, key: &str) -> Option<f64> {
        self.gauges.values.read().get(key).copied()
    }

    #[must_use]
    pub fn all_counters(&self) -> HashMap<String, u64> {
        self.counters.values.read().clone()
    }

    pub fn print_summary(&self) {
        let counters = self.counters.values.read();
        let gauges = self.gauges.values.read();
        let histograms = self.histograms.values.read();
        if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
            println!("No metrics collected.");
            return;
        }

        println!();
        println!("## Metrics Summary");
        if !counters.is_empty() {
            println!();
            println!("### Counters");
            let mut entries: Vec<_> = counters.iter().collect();
            entries.sort();
            for (key, value) in entries {
                println!("  {key}: {value}");
            }
        }
        if !gauges.is_empty() {
            println!();
            println!("### Gauges");
            let mut keys: Vec<_> = gauges.keys().collect();
            keys.sort();
            for key in keys {
                println!("  {key}: {:.2}", gauges[key]);
            }
        }
        if !histograms.is_empty() {
            println!();
            println!("### Histograms");
            let mut keys: Vec<_> = histograms.keys().collect();
            keys.sort();
            for key in keys {
                let values = &histograms[key];
                if values.is_empty() {
                    continue;
                }
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let avg = values.iter().sum::<f64>() / values.len() as f64;
                println!("  {key}: count={}, min={min:.0}, max={max:.0}, avg={avg:.1}", values.len());
            }
        }
        println!();
    }
}

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Ingest / Buffer Metrics
    // ============================================================================

    /// Records accepted from agents, by listener
    pub static ref INGEST_RECORDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tracehouse_ingest_records_total", "Total records accepted from agents"),
        &["listener"]
    ).expect("metric can be created");

    /// Frames appended to the buffer log
    pub static ref BUFFER_WRITES_TOTAL: IntCounter = IntCounter::new(
        "tracehouse_buffer_writes_total",
        "Total frames appended to the buffer log"
    ).expect("metric can be created");

    /// Bytes appended to the buffer log (frame headers included)
    pub static ref BUFFER_BYTES_TOTAL: IntCounter = IntCounter::new(
        "tracehouse_buffer_bytes_total",
        "Total bytes appended to the buffer log"
    ).expect("metric can be created");

    /// Failed buffer appends; the record was dropped
    pub static ref BUFFER_WRITE_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "tracehouse_buffer_write_errors_total",
        "Total failed buffer log appends"
    ).expect("metric can be created");

    /// Data file rotations
    pub static ref BUFFER_ROTATIONS_TOTAL: IntCounter = IntCounter::new(
        "tracehouse_buffer_rotations_total",
        "Total buffer data file rotations"
    ).expect("metric can be created");

    /// Records replayed by the buffer reader
    pub static ref BUFFER_RECORDS_READ_TOTAL: IntCounter = IntCounter::new(
        "tracehouse_buffer_records_read_total",
        "Total records read back from the buffer log"
    ).expect("metric can be created");

    /// Frames skipped by the reader (CRC mismatch, undecodable payload)
    pub static ref BUFFER_CORRUPT_FRAMES_TOTAL: IntCounter = IntCounter::new(
        "tracehouse_buffer_corrupt_frames_total",
        "Total corrupt buffer frames skipped"
    ).expect("metric can be created");

    // ============================================================================
    // Worker Metrics
    // ============================================================================

    /// Items rejected or overwritten by channel admission
    pub static ref CHANNEL_DROPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tracehouse_channel_dropped_total", "Total items dropped by channel admission"),
        &["worker", "policy"]
    ).expect("metric can be created");

    /// Records handed to worker handlers
    pub static ref WORKER_RECORDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tracehouse_worker_records_total", "Total records processed by workers"),
        &["worker"]
    ).expect("metric can be created");

    /// Errors raised while forwarding worker output
    pub static ref WORKER_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tracehouse_worker_errors_total", "Total worker processing errors"),
        &["worker"]
    ).expect("metric can be created");

    // ============================================================================
    // Persistence Metrics
    // ============================================================================

    /// Persistence cycle ticks
    pub static ref PERSISTENCE_TICKS_TOTAL: IntCounter = IntCounter::new(
        "tracehouse_persistence_ticks_total",
        "Total persistence cycle ticks"
    ).expect("metric can be created");

    /// Write ops submitted, by kind (insert/update)
    pub static ref PERSISTENCE_OPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tracehouse_persistence_ops_total", "Total write ops submitted to the DAO"),
        &["kind"]
    ).expect("metric can be created");

    /// DAO failures, by stage (get/prepare/batch/flush)
    pub static ref PERSISTENCE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tracehouse_persistence_errors_total", "Total persistence failures"),
        &["stage"]
    ).expect("metric can be created");

    /// Wall time of one persistence tick
    pub static ref PERSISTENCE_TICK_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("tracehouse_persistence_tick_seconds", "Persistence tick latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).expect("metric can be created");

    // ============================================================================
    // Cluster Metrics
    // ============================================================================

    /// Records sent to remote members
    pub static ref REMOTE_SENDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tracehouse_remote_sends_total", "Total records sent to remote workers"),
        &["peer"]
    ).expect("metric can be created");

    /// Remote sends that failed or timed out
    pub static ref REMOTE_SEND_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tracehouse_remote_send_failures_total", "Total failed remote sends"),
        &["peer"]
    ).expect("metric can be created");

    /// Remote dispatch frames received
    pub static ref REMOTE_RECEIVED_TOTAL: IntCounter = IntCounter::new(
        "tracehouse_remote_received_total",
        "Total remote dispatch frames received"
    ).expect("metric can be created");

    /// Known endpoints per role
    pub static ref CLUSTER_MEMBERS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("tracehouse_cluster_members", "Endpoints registered per role"),
        &["role"]
    ).expect("metric can be created");
}

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(INGEST_RECORDS_TOTAL.clone()),
            Box::new(BUFFER_WRITES_TOTAL.clone()),
            Box::new(BUFFER_BYTES_TOTAL.clone()),
            Box::new(BUFFER_WRITE_ERRORS_TOTAL.clone()),
            Box::new(BUFFER_ROTATIONS_TOTAL.clone()),
            Box::new(BUFFER_RECORDS_READ_TOTAL.clone()),
            Box::new(BUFFER_CORRUPT_FRAMES_TOTAL.clone()),
            Box::new(CHANNEL_DROPPED_TOTAL.clone()),
            Box::new(WORKER_RECORDS_TOTAL.clone()),
            Box::new(WORKER_ERRORS_TOTAL.clone()),
            Box::new(PERSISTENCE_TICKS_TOTAL.clone()),
            Box::new(PERSISTENCE_OPS_TOTAL.clone()),
            Box::new(PERSISTENCE_ERRORS_TOTAL.clone()),
            Box::new(PERSISTENCE_TICK_LATENCY.clone()),
            Box::new(REMOTE_SENDS_TOTAL.clone()),
            Box::new(REMOTE_SEND_FAILURES_TOTAL.clone()),
            Box::new(REMOTE_RECEIVED_TOTAL.clone()),
            Box::new(CLUSTER_MEMBERS.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric can be registered");
        }
    });
}

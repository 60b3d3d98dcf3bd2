use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

// --- Session Metrics ---

pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "marketsim_active_sessions",
        "Sessions currently running or paused"
    )
    .expect("active_sessions gauge")
});

pub static EVENTS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "marketsim_events_processed_total",
        "Market events applied by session loops"
    )
    .expect("events_processed counter")
});

pub static EVENTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "marketsim_events_dropped_total",
        "Market events discarded by queue overflow policies"
    )
    .expect("events_dropped counter")
});

pub static SESSION_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "marketsim_session_errors_total",
        "Sessions moved to ERROR"
    )
    .expect("session_errors counter")
});

// --- Execution Metrics ---

pub static FILLS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("marketsim_fills_total", "Simulated fills applied")
        .expect("fills counter")
});

pub static ORDER_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "marketsim_order_rejections_total",
        "Orders rejected at admission or by the simulated venue"
    )
    .expect("order_rejections counter")
});

pub static SLIPPAGE_BPS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "marketsim_fill_slippage_bps",
        "Adverse price adjustment applied to fills, in basis points",
        vec![0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0]
    )
    .expect("slippage_bps histogram")
});

pub static LULD_HALTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("marketsim_luld_halts_total", "LULD trading pauses triggered")
        .expect("luld_halts counter")
});

// --- Durability Metrics ---

pub static WAL_APPENDS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("marketsim_wal_appends_total", "WAL records written")
        .expect("wal_appends counter")
});

pub static CHECKPOINTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("marketsim_checkpoints_total", "Checkpoints written")
        .expect("checkpoints counter")
});

pub fn set_active_sessions(count: i64) {
    ACTIVE_SESSIONS.set(count);
}

pub fn inc_events_processed() {
    EVENTS_PROCESSED.inc();
}

pub fn inc_events_dropped() {
    EVENTS_DROPPED.inc();
}

pub fn inc_session_errors() {
    SESSION_ERRORS.inc();
}

pub fn inc_fills() {
    FILLS.inc();
}

pub fn inc_order_rejections() {
    ORDER_REJECTIONS.inc();
}

pub fn observe_slippage(bps: f64) {
    SLIPPAGE_BPS.observe(bps);
}

pub fn inc_luld_halts() {
    LULD_HALTS.inc();
}

pub fn inc_wal_appends() {
    WAL_APPENDS.inc();
}

pub fn inc_checkpoints() {
    CHECKPOINTS.inc();
}

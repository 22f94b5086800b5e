//! Runtime metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently established connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "bytes_received", description = "Total bytes read from peers")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to peers")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "loop_wakeups",
    description = "Cross-thread wakeups delivered to event loops"
)]
pub static LOOP_WAKEUPS: Counter = Counter::new();

#[metric(
    name = "high_water_events",
    description = "Times a connection's output buffer crossed its high-water mark"
)]
pub static HIGH_WATER_EVENTS: Counter = Counter::new();

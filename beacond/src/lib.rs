//! beacond — coordination server for an LBeacon indoor-location platform.
//!
//! The crate is the concurrent packet-routing engine: UDP transport with
//! bounded send/receive queues, a typed-packet classifier, a multi-list
//! priority scheduler with starvation prevention, a worker pool drawing
//! buffer nodes from a fixed-slot memory pool, a registry of joined
//! gateways, and the geo-fence evaluation pipeline fed by time-critical
//! tracked-object packets.

pub mod addr_map;
pub mod buffer;
pub mod classify;
pub mod config;
pub mod db;
pub mod geofence;
pub mod handlers;
pub mod list;
pub mod mempool;
pub mod metrics;
pub mod pkt_queue;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod thpool;
pub mod udp;
pub mod wire;
pub mod workers;

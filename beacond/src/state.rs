//! Process-wide server state.
//!
//! Everything the original kept as file-scope globals lives in one
//! `ServerState` value, constructed at startup and shared by reference into
//! every thread. Lifetime equals process lifetime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::warn;

use crate::addr_map::AddressMap;
use crate::buffer::{BufNode, BufferList, HandlerKind, PriorityLevels, PriorityList};
use crate::config::{Config, EngineConfig};
use crate::db::Database;
use crate::geofence::GeoFence;
use crate::mempool::{MemPool, SlotRef};
use crate::metrics::Metrics;
use crate::pkt_queue::{PacketQueue, QueueError};

/// Attempts made against an exhausted pool or a saturated queue before a
/// packet is dropped.
pub const MEMORY_ALLOCATE_RETRIES: usize = 5;

/// Pause between such attempts.
pub const BUSY_WAITING_TIME_IN_MS: u64 = 100;

/// Sleep of the classifier when the inbound queue is empty.
pub const RECEIVE_POLL_SLEEP_MS: u64 = 50;

/// Sleep of the dispatcher when a whole scan found nothing.
pub const PRIORITY_IDLE_SLEEP_MS: u64 = 50;

/// All buffer lists, plus the priority order the dispatcher scans them in.
pub struct BufferLists {
    pub nsi_receive: Arc<BufferList>,
    pub nsi_send: Arc<BufferList>,
    pub bhm_receive: Arc<BufferList>,
    pub bhm_send: Arc<BufferList>,
    pub data_receive: Arc<BufferList>,
    pub geofence_receive: Arc<BufferList>,
    pub command: Arc<BufferList>,
    pub priority: PriorityList,
}

impl BufferLists {
    fn new(engine: &EngineConfig) -> Self {
        let command = BufferList::new("command", engine.normal_priority, HandlerKind::Command);
        let geofence_receive = BufferList::new(
            "geo-fence-receive",
            engine.time_critical_priority,
            HandlerKind::GeoFenceReceive,
        );
        let data_receive = BufferList::new(
            "data-receive",
            engine.normal_priority,
            HandlerKind::DataReceive,
        );
        let nsi_send = BufferList::new("NSI-send", engine.high_priority, HandlerKind::WifiSend);
        let nsi_receive =
            BufferList::new("NSI-receive", engine.high_priority, HandlerKind::NsiReceive);
        let bhm_receive =
            BufferList::new("BHM-receive", engine.low_priority, HandlerKind::BhmReceive);
        let bhm_send = BufferList::new("BHM-send", engine.low_priority, HandlerKind::WifiSend);

        let mut priority = PriorityList::new(vec![
            Arc::clone(&command),
            Arc::clone(&geofence_receive),
            Arc::clone(&data_receive),
            Arc::clone(&nsi_send),
            Arc::clone(&nsi_receive),
            Arc::clone(&bhm_receive),
            Arc::clone(&bhm_send),
        ]);
        priority.sort(&PriorityLevels::from_engine(engine));

        Self {
            nsi_receive,
            nsi_send,
            bhm_receive,
            bhm_send,
            data_receive,
            geofence_receive,
            command,
            priority,
        }
    }
}

pub struct ServerState {
    pub config: Config,
    pub node_pool: MemPool<BufNode>,
    pub inbound: PacketQueue,
    pub outbound: PacketQueue,
    pub gateway_map: AddressMap,
    pub lists: BufferLists,
    pub geofence: GeoFence,
    pub db: Arc<dyn Database>,
    pub metrics: Metrics,
    ready_to_work: AtomicBool,
    initialization_failed: AtomicBool,
    transport_ready: AtomicBool,
    dispatcher_ready: AtomicBool,
}

impl ServerState {
    pub fn new(config: Config, db: Arc<dyn Database>) -> Arc<Self> {
        let node_pool = MemPool::new(config.engine.node_pool_slots);
        let lists = BufferLists::new(&config.engine);
        let geofence = GeoFence::new(Duration::from_secs(
            config.geofence.perimeter_valid_duration_in_sec,
        ));

        Arc::new(Self {
            node_pool,
            inbound: PacketQueue::new(),
            outbound: PacketQueue::new(),
            gateway_map: AddressMap::new(),
            lists,
            geofence,
            db,
            metrics: Metrics::new(),
            ready_to_work: AtomicBool::new(true),
            initialization_failed: AtomicBool::new(false),
            transport_ready: AtomicBool::new(false),
            dispatcher_ready: AtomicBool::new(false),
            config,
        })
    }

    pub fn is_running(&self) -> bool {
        self.ready_to_work.load(Ordering::SeqCst)
    }

    /// Cooperative shutdown token, checked by every loop.
    pub fn shutdown(&self) {
        self.ready_to_work.store(false, Ordering::SeqCst);
    }

    /// A fatal initialization error: abort startup and stop every loop.
    pub fn mark_failed(&self) {
        self.initialization_failed.store(true, Ordering::SeqCst);
        self.shutdown();
    }

    pub fn failed(&self) -> bool {
        self.initialization_failed.load(Ordering::SeqCst)
    }

    pub fn set_transport_ready(&self) {
        self.transport_ready.store(true, Ordering::SeqCst);
    }

    pub fn transport_ready(&self) -> bool {
        self.transport_ready.load(Ordering::SeqCst)
    }

    pub fn set_dispatcher_ready(&self) {
        self.dispatcher_ready.store(true, Ordering::SeqCst);
    }

    pub fn dispatcher_ready(&self) -> bool {
        self.dispatcher_ready.load(Ordering::SeqCst)
    }

    pub fn levels(&self) -> PriorityLevels {
        PriorityLevels::from_engine(&self.config.engine)
    }

    /// Allocate a buffer node, retrying a few times against a drained pool
    /// before giving up. `None` means the node was dropped.
    pub fn alloc_node_with_retry(&self, node: BufNode) -> Option<SlotRef> {
        let mut node = node;
        for attempt in 0..MEMORY_ALLOCATE_RETRIES {
            match self.node_pool.alloc(node) {
                Ok(slot) => return Some(slot),
                Err(rejected) => {
                    node = rejected;
                    if attempt + 1 < MEMORY_ALLOCATE_RETRIES {
                        thread::sleep(Duration::from_millis(BUSY_WAITING_TIME_IN_MS));
                    }
                }
            }
        }
        self.metrics.inc_node_alloc_failures();
        None
    }

    /// Queue a datagram for sending, retrying a few times when the queue is
    /// saturated. Returns whether the packet was accepted.
    pub fn enqueue_outbound(&self, addr: SocketAddr, payload: Bytes) -> bool {
        for attempt in 0..MEMORY_ALLOCATE_RETRIES {
            match self.outbound.enqueue(addr, payload.clone()) {
                Ok(()) => return true,
                Err(QueueError::Full) => {
                    if attempt + 1 < MEMORY_ALLOCATE_RETRIES {
                        thread::sleep(Duration::from_millis(BUSY_WAITING_TIME_IN_MS));
                    }
                }
                Err(err) => {
                    warn!("dropping outbound packet for {addr}: {err}");
                    self.metrics.inc_outbound_queue_drops();
                    return false;
                }
            }
        }
        warn!("outbound queue saturated, dropping packet for {addr}");
        self.metrics.inc_outbound_queue_drops();
        false
    }
}

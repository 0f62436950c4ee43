//! Buffer nodes and the prioritized lists they travel through.
//!
//! A buffer node is one classified datagram plus routing metadata, drawn
//! from the node pool. Each buffer list pairs a FIFO of nodes with the
//! handler that consumes them and a priority nice; the priority list is the
//! ordered sequence of buffer lists the dispatcher scans.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::EngineConfig;
use crate::list::{Link, Linked, NodeList};
use crate::mempool::{MemPool, PoolError, SlotRef};
use crate::wire::{MESSAGE_LENGTH, PktDirection, PktType};

/// The handler a buffer list is bound to. One packet class, one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Join requests (network setup and initialization).
    NsiReceive,
    /// Gateway and beacon health reports.
    BhmReceive,
    /// Tracked-object data from ordinary gateways.
    DataReceive,
    /// Time-critical tracked-object data from geo-fence gateways.
    GeoFenceReceive,
    /// IPC commands from the GUI side.
    Command,
    /// Outgoing nodes: build the wire payload and hand to the transport.
    WifiSend,
}

/// One datagram in flight through the engine.
#[derive(Debug)]
pub struct BufNode {
    pub direction: PktDirection,
    pub pkt_type: PktType,
    pub api_version: f32,
    /// Peer address: source for received packets, destination for sends.
    pub addr: SocketAddr,
    /// Monotonic receive timestamp, the basis of the out-of-date check.
    pub received_at: Instant,
    content: [u8; MESSAGE_LENGTH],
    content_len: usize,
    link: Link,
}

impl BufNode {
    /// Copy `body` into a fresh node. Returns `None` when the body exceeds
    /// the message limit.
    pub fn new(
        direction: PktDirection,
        pkt_type: PktType,
        api_version: f32,
        addr: SocketAddr,
        body: &str,
        received_at: Instant,
    ) -> Option<Self> {
        if body.len() > MESSAGE_LENGTH {
            return None;
        }
        let mut content = [0u8; MESSAGE_LENGTH];
        content[..body.len()].copy_from_slice(body.as_bytes());
        Some(Self {
            direction,
            pkt_type,
            api_version,
            addr,
            received_at,
            content,
            content_len: body.len(),
            link: Link::default(),
        })
    }

    pub fn content(&self) -> &str {
        std::str::from_utf8(&self.content[..self.content_len]).unwrap_or("")
    }
}

impl Linked for BufNode {
    fn link(&self) -> Link {
        self.link
    }
    fn set_link(&mut self, link: Link) {
        self.link = link;
    }
}

/// A FIFO of buffer nodes bound to one packet class.
pub struct BufferList {
    pub name: &'static str,
    pub nice: i32,
    pub handler: HandlerKind,
    fifo: Mutex<NodeList>,
}

impl BufferList {
    pub fn new(name: &'static str, nice: i32, handler: HandlerKind) -> Arc<Self> {
        Arc::new(Self {
            name,
            nice,
            handler,
            fifo: Mutex::new(NodeList::new()),
        })
    }

    /// Insert at the tail. Once on the list the node belongs to whichever
    /// thread later detaches it.
    pub fn push(&self, pool: &MemPool<BufNode>, node: SlotRef) -> Result<(), PoolError> {
        self.fifo.lock().unwrap().push_tail(pool, node)
    }

    /// Detach the head node. The list lock is held only for the unlink.
    pub fn pop(&self, pool: &MemPool<BufNode>) -> Result<Option<SlotRef>, PoolError> {
        self.fifo.lock().unwrap().pop_head(pool)
    }

    pub fn len(&self) -> usize {
        self.fifo.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The four priority equivalence classes, in scan order.
#[derive(Debug, Clone, Copy)]
pub struct PriorityLevels {
    pub time_critical: i32,
    pub high: i32,
    pub normal: i32,
    pub low: i32,
}

impl PriorityLevels {
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            time_critical: engine.time_critical_priority,
            high: engine.high_priority,
            normal: engine.normal_priority,
            low: engine.low_priority,
        }
    }

    /// Scan rank of a nice value; lists with a nice outside the four
    /// configured classes sort after everything else rather than being
    /// dropped.
    fn rank(&self, nice: i32) -> u8 {
        if nice == self.time_critical {
            0
        } else if nice == self.high {
            1
        } else if nice == self.normal {
            2
        } else if nice == self.low {
            3
        } else {
            4
        }
    }
}

/// Ordered sequence of buffer lists. Built once at startup, sorted, then
/// only ever scanned — membership never changes afterwards.
pub struct PriorityList {
    lists: Vec<Arc<BufferList>>,
}

impl PriorityList {
    pub fn new(lists: Vec<Arc<BufferList>>) -> Self {
        Self { lists }
    }

    /// Group the lists into time-critical, high, normal, low. The sort is
    /// stable: within a class, insertion order is preserved.
    pub fn sort(&mut self, levels: &PriorityLevels) {
        self.lists.sort_by_key(|list| levels.rank(list.nice));
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<BufferList>> {
        self.lists.iter()
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels() -> PriorityLevels {
        PriorityLevels {
            time_critical: -20,
            high: -13,
            normal: 0,
            low: 13,
        }
    }

    fn addr() -> SocketAddr {
        "10.0.0.5:4000".parse().unwrap()
    }

    #[test]
    fn node_rejects_oversize_body() {
        let body = "x".repeat(MESSAGE_LENGTH + 1);
        assert!(
            BufNode::new(
                PktDirection::FromGateway,
                PktType::TrackedObjectData,
                2.2,
                addr(),
                &body,
                Instant::now(),
            )
            .is_none()
        );
    }

    #[test]
    fn buffer_list_is_fifo() {
        let pool = MemPool::new(8);
        let list = BufferList::new("data-receive", 0, HandlerKind::DataReceive);
        for n in 0..3 {
            let node = BufNode::new(
                PktDirection::FromGateway,
                PktType::TrackedObjectData,
                2.2,
                addr(),
                &format!("body-{n}"),
                Instant::now(),
            )
            .unwrap();
            let slot = pool.alloc(node).unwrap();
            list.push(&pool, slot).unwrap();
        }

        for n in 0..3 {
            let slot = list.pop(&pool).unwrap().unwrap();
            let node = pool.free(slot).unwrap();
            assert_eq!(node.content(), format!("body-{n}"));
        }
        assert!(list.pop(&pool).unwrap().is_none());
    }

    #[test]
    fn sort_groups_by_class_and_keeps_insertion_order() {
        let lists = vec![
            BufferList::new("command", 0, HandlerKind::Command),
            BufferList::new("geo-fence-receive", -20, HandlerKind::GeoFenceReceive),
            BufferList::new("data-receive", 0, HandlerKind::DataReceive),
            BufferList::new("NSI-send", -13, HandlerKind::WifiSend),
            BufferList::new("NSI-receive", -13, HandlerKind::NsiReceive),
            BufferList::new("BHM-receive", 13, HandlerKind::BhmReceive),
            BufferList::new("BHM-send", 13, HandlerKind::WifiSend),
        ];
        let mut priority = PriorityList::new(lists);
        priority.sort(&levels());

        let names: Vec<_> = priority.iter().map(|l| l.name).collect();
        assert_eq!(
            names,
            vec![
                "geo-fence-receive",
                "NSI-send",
                "NSI-receive",
                "command",
                "data-receive",
                "BHM-receive",
                "BHM-send",
            ]
        );
    }

    #[test]
    fn sort_with_empty_priority_classes_keeps_every_list() {
        // No time-critical or low lists at all; nothing may be dropped.
        let lists = vec![
            BufferList::new("data-receive", 0, HandlerKind::DataReceive),
            BufferList::new("NSI-receive", -13, HandlerKind::NsiReceive),
        ];
        let mut priority = PriorityList::new(lists);
        priority.sort(&levels());
        assert_eq!(priority.len(), 2);
        assert_eq!(priority.iter().next().unwrap().name, "NSI-receive");
    }

    #[test]
    fn unknown_nice_sorts_last() {
        let lists = vec![
            BufferList::new("odd", 7, HandlerKind::DataReceive),
            BufferList::new("normal", 0, HandlerKind::DataReceive),
        ];
        let mut priority = PriorityList::new(lists);
        priority.sort(&levels());
        let names: Vec<_> = priority.iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["normal", "odd"]);
    }
}

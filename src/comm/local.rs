//! In-process transport: simulated ranks over shared mailboxes
//!
//! Each rank of a [`LocalCluster`] is expected to run on its own thread.
//! Messages land in a mailbox keyed by (src, dst, tag) and are delivered
//! FIFO per key, which is exactly the matching guarantee the broadcast
//! layer's tag discipline assumes of a real wire.

use super::Transport;
use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::time::Duration;

/// Upper bound on a blocking receive; a local run that exceeds this has
/// deadlocked (mismatched tags or a missing sender).
const RECV_TIMEOUT: Duration = Duration::from_secs(120);

struct Shared {
    mailboxes: Mutex<HashMap<(usize, usize, u64), VecDeque<Vec<u8>>>>,
    delivered: Condvar,
    barrier: Barrier,
    size: usize,
}

/// A set of in-process ranks sharing one mailbox plane
pub struct LocalCluster {
    shared: Arc<Shared>,
}

impl LocalCluster {
    /// Create a cluster of `size` simulated ranks
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "cluster needs at least one rank");
        Self {
            shared: Arc::new(Shared {
                mailboxes: Mutex::new(HashMap::new()),
                delivered: Condvar::new(),
                barrier: Barrier::new(size),
                size,
            }),
        }
    }

    /// Transport handle for one rank; hand each to its own thread
    pub fn transport(&self, rank: usize) -> LocalTransport {
        assert!(rank < self.shared.size, "rank out of range");
        LocalTransport {
            rank,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// One rank's endpoint into a [`LocalCluster`]
pub struct LocalTransport {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalTransport {
    /// A single-rank transport where every send is a logic error
    pub fn solo() -> Self {
        LocalCluster::new(1).transport(0)
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn send(&self, dest: usize, tag: u64, data: &[u8]) -> Result<()> {
        if dest >= self.shared.size {
            return Err(Error::comm(
                "send",
                format!("destination {dest} outside world of {}", self.shared.size),
            ));
        }
        let mut boxes = self.shared.mailboxes.lock().unwrap();
        boxes
            .entry((self.rank, dest, tag))
            .or_default()
            .push_back(data.to_vec());
        self.shared.delivered.notify_all();
        Ok(())
    }

    fn recv(&self, src: usize, tag: u64) -> Result<Vec<u8>> {
        if src >= self.shared.size {
            return Err(Error::comm(
                "recv",
                format!("source {src} outside world of {}", self.shared.size),
            ));
        }
        let key = (src, self.rank, tag);
        let mut boxes = self.shared.mailboxes.lock().unwrap();
        loop {
            if let Some(msg) = boxes.get_mut(&key).and_then(VecDeque::pop_front) {
                return Ok(msg);
            }
            let (guard, timeout) = self
                .shared
                .delivered
                .wait_timeout(boxes, RECV_TIMEOUT)
                .unwrap();
            boxes = guard;
            if timeout.timed_out() {
                return Err(Error::comm(
                    "recv",
                    format!("timed out waiting for (src {src}, tag {tag})"),
                ));
            }
        }
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}

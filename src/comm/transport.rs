//! Message-passing transport abstraction
//!
//! The index never talks to a transport library directly; it holds a
//! [`Transport`] handle passed in at construction. The contract mirrors the
//! point-to-point and collective subset the pipeline needs. Delivery between
//! one (source, destination) pair follows send order; nothing is promised
//! across pairs.

use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// One transport message
#[derive(Debug)]
pub struct Message {
    pub src: usize,
    pub tag: u8,
    pub payload: Vec<u8>,
}

/// Point-to-point ordered transport with collectives
///
/// Implementations must deliver messages of one (src, dst) pair in send
/// order, must not block `send` on the receiving side, and must make
/// `barrier` and `allreduce_sum` collective over all ranks.
pub trait Transport: Send + Sync + 'static {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Hands the payload to the transport. Completion of the local call does
    /// not imply delivery.
    fn send(&self, dst: usize, tag: u8, payload: Vec<u8>) -> Result<()>;

    /// Blocks for the next inbound message; `Ok(None)` once the group is
    /// gone and no further message can arrive.
    fn recv(&self) -> Result<Option<Message>>;

    fn barrier(&self);

    fn allreduce_sum(&self, value: u64) -> u64;
}

/// Generation-counted rendezvous shared by every rank of an in-process group
struct Collective {
    world: usize,
    state: Mutex<CollectiveState>,
    cv: Condvar,
}

struct CollectiveState {
    arrived: usize,
    generation: u64,
    acc: u64,
    result: u64,
}

impl Collective {
    fn new(world: usize) -> Self {
        Self {
            world,
            state: Mutex::new(CollectiveState {
                arrived: 0,
                generation: 0,
                acc: 0,
                result: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Contributes `value` and returns the group sum once everyone arrived.
    /// Doubles as a barrier with `value = 0`.
    fn reduce(&self, value: u64) -> u64 {
        let mut st = self.state.lock();
        st.acc += value;
        st.arrived += 1;
        let gen = st.generation;
        if st.arrived == self.world {
            st.arrived = 0;
            st.result = st.acc;
            st.acc = 0;
            st.generation += 1;
            self.cv.notify_all();
        } else {
            while st.generation == gen {
                self.cv.wait(&mut st);
            }
        }
        st.result
    }
}

/// In-process transport: every rank is a thread, every link a channel
///
/// Channels preserve per-sender FIFO, which is exactly the (src, dst)
/// ordering the trait demands. Collectives rendezvous through shared state.
pub struct ChannelTransport {
    rank: usize,
    world: usize,
    peers: Vec<Sender<Message>>,
    inbox: Receiver<Message>,
    collective: Arc<Collective>,
}

impl ChannelTransport {
    /// Builds a fully connected group; element `i` of the result is rank
    /// `i`'s endpoint.
    pub fn group(world_size: usize) -> Vec<ChannelTransport> {
        assert!(world_size > 0, "world size must be positive");
        let mut peers = Vec::with_capacity(world_size);
        let mut inboxes = Vec::with_capacity(world_size);
        for _ in 0..world_size {
            let (tx, rx) = unbounded();
            peers.push(tx);
            inboxes.push(rx);
        }
        let collective = Arc::new(Collective::new(world_size));
        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelTransport {
                rank,
                world: world_size,
                peers: peers.clone(),
                inbox,
                collective: Arc::clone(&collective),
            })
            .collect()
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world
    }

    fn send(&self, dst: usize, tag: u8, payload: Vec<u8>) -> Result<()> {
        self.peers[dst]
            .send(Message {
                src: self.rank,
                tag,
                payload,
            })
            .map_err(|_| Error::Transport(format!("rank {dst} is gone")))
    }

    fn recv(&self) -> Result<Option<Message>> {
        Ok(self.inbox.recv().ok())
    }

    fn barrier(&self) {
        self.collective.reduce(0);
    }

    fn allreduce_sum(&self, value: u64) -> u64 {
        self.collective.reduce(value)
    }
}

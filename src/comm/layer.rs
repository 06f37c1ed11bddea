//! Buffered, coalescing communication layer
//!
//! Worker threads hand small payloads to [`CommLayer::send_buffered`]; the
//! layer appends them to a per-destination buffer under that destination's
//! mutex and ships full buffers as single transport messages from a
//! background sender thread. No lock is ever held across a transport call.
//!
//! A background receiver thread dispatches inbound payloads to the callback
//! registered for their tag. Flushing is an epoch protocol: after posting
//! its partial buffers, a rank sends a control message carrying the epoch
//! number to every rank. Because the transport is FIFO per (src, dst), the
//! control message arrives after all of that rank's data for the epoch, so
//! once controls from all ranks are in, every inbound payload of the epoch
//! has been dispatched. A final barrier makes the epoch boundary collective.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{ByteOrder, LittleEndian};
use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{Error, Result};

use super::{MessageBuffer, Transport};

/// Highest tag available to layer users; higher values are control traffic.
pub const MAX_USER_TAG: u8 = 0xEF;

const TAG_FLUSH: u8 = 0xFE;
const TAG_SHUTDOWN: u8 = 0xFF;

/// Callback invoked by the receiver thread with (source rank, payload).
pub type Handler = Box<dyn Fn(usize, &[u8]) + Send + Sync>;

enum Outbound {
    Message {
        dst: usize,
        tag: u8,
        payload: Vec<u8>,
    },
    Shutdown,
}

/// Count of posted-but-unsent messages, awaited at flush
struct PendingSends {
    count: Mutex<usize>,
    cv: Condvar,
}

impl PendingSends {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn inc(&self) {
        *self.count.lock() += 1;
    }

    fn dec(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    fn wait_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cv.wait(&mut count);
        }
    }
}

/// Per-epoch count of received flush controls
struct FlushTracker {
    state: Mutex<HashMap<u64, usize>>,
    cv: Condvar,
}

impl FlushTracker {
    fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        }
    }

    fn record(&self, epoch: u64) {
        *self.state.lock().entry(epoch).or_insert(0) += 1;
        self.cv.notify_all();
    }

    fn wait(&self, epoch: u64, world: usize) {
        let mut state = self.state.lock();
        loop {
            if state.get(&epoch).copied().unwrap_or(0) >= world {
                state.remove(&epoch);
                return;
            }
            self.cv.wait(&mut state);
        }
    }
}

/// Coalescing message layer over a [`Transport`]
pub struct CommLayer<T: Transport> {
    transport: Arc<T>,
    buffers: Vec<Mutex<MessageBuffer>>,
    /// Tag applied to coalesced buffers from `send_buffered`.
    buffered_tag: u8,
    handlers: Arc<RwLock<HashMap<u8, Handler>>>,
    out_tx: Sender<Outbound>,
    pending: Arc<PendingSends>,
    flushes: Arc<FlushTracker>,
    epoch: AtomicU64,
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

impl<T: Transport> CommLayer<T> {
    /// Creates a stopped layer. Register handlers, then call [`start`].
    ///
    /// [`start`]: CommLayer::start
    ///
    /// # Panics
    ///
    /// Panics if `buffered_tag` is a control tag.
    pub fn new(transport: Arc<T>, buffer_capacity: usize, buffered_tag: u8) -> Self {
        assert!(buffered_tag <= MAX_USER_TAG, "tag reserved for control");
        let world = transport.world_size();
        let buffers = (0..world)
            .map(|_| Mutex::new(MessageBuffer::new(buffer_capacity)))
            .collect();
        let (out_tx, out_rx) = unbounded();
        let mut layer = Self {
            transport,
            buffers,
            buffered_tag,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            out_tx,
            pending: Arc::new(PendingSends::new()),
            flushes: Arc::new(FlushTracker::new()),
            epoch: AtomicU64::new(0),
            sender: None,
            receiver: None,
        };
        layer.spawn_sender(out_rx);
        layer
    }

    fn spawn_sender(&mut self, out_rx: crossbeam::channel::Receiver<Outbound>) {
        let transport = Arc::clone(&self.transport);
        let pending = Arc::clone(&self.pending);
        self.sender = Some(std::thread::spawn(move || {
            while let Ok(outbound) = out_rx.recv() {
                match outbound {
                    Outbound::Message { dst, tag, payload } => {
                        if let Err(e) = transport.send(dst, tag, payload) {
                            tracing::error!(dst, tag, "send failed: {e}");
                        }
                        pending.dec();
                    }
                    Outbound::Shutdown => break,
                }
            }
        }));
    }

    /// Registers the callback for a tag. Must happen before [`start`];
    /// messages for unregistered tags are dropped with a warning.
    ///
    /// [`start`]: CommLayer::start
    pub fn register_handler(&self, tag: u8, handler: Handler) {
        assert!(tag <= MAX_USER_TAG, "tag reserved for control");
        assert!(
            self.receiver.is_none(),
            "handlers must be registered before start"
        );
        self.handlers.write().insert(tag, handler);
    }

    /// Starts the receiver thread. Inbound traffic arriving before `start`
    /// waits in the transport.
    pub fn start(&mut self) {
        assert!(self.receiver.is_none(), "layer already started");
        let transport = Arc::clone(&self.transport);
        let handlers = Arc::clone(&self.handlers);
        let flushes = Arc::clone(&self.flushes);
        let rank = self.transport.rank();
        self.receiver = Some(std::thread::spawn(move || loop {
            match transport.recv() {
                Ok(Some(msg)) => match msg.tag {
                    TAG_SHUTDOWN if msg.src == rank => break,
                    TAG_SHUTDOWN => {}
                    TAG_FLUSH => {
                        flushes.record(LittleEndian::read_u64(&msg.payload));
                    }
                    tag => {
                        if let Some(handler) = handlers.read().get(&tag) {
                            handler(msg.src, &msg.payload);
                        } else {
                            tracing::warn!(tag, src = msg.src, "no handler for tag");
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("receive failed: {e}");
                    break;
                }
            }
        }));
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn enqueue(&self, dst: usize, tag: u8, payload: Vec<u8>) -> Result<()> {
        self.pending.inc();
        self.out_tx
            .send(Outbound::Message { dst, tag, payload })
            .map_err(|_| {
                self.pending.dec();
                Error::Transport("communication layer is shut down".into())
            })
    }

    /// Appends a payload to the destination's buffer, shipping the previous
    /// contents first when the payload does not fit. A payload larger than
    /// the buffer capacity travels as its own message.
    pub fn send_buffered(&self, dst: usize, bytes: &[u8]) -> Result<()> {
        let mut buf = self.buffers[dst].lock();
        if buf.try_append(bytes) {
            return Ok(());
        }
        let full = buf.take();
        if !buf.try_append(bytes) {
            drop(buf);
            if !full.is_empty() {
                self.enqueue(dst, self.buffered_tag, full)?;
            }
            return self.enqueue(dst, self.buffered_tag, bytes.to_vec());
        }
        drop(buf);
        self.enqueue(dst, self.buffered_tag, full)
    }

    /// Posts a message immediately, bypassing the coalescing buffers. Used
    /// for request/response traffic that must not wait for a flush.
    pub fn send_direct(&self, dst: usize, tag: u8, payload: Vec<u8>) -> Result<()> {
        assert!(tag <= MAX_USER_TAG, "tag reserved for control");
        self.enqueue(dst, tag, payload)
    }

    /// Collective: ships every partial buffer, waits until all in-flight
    /// messages of this epoch are sent here and received everywhere, then
    /// barriers. On return, the layer is globally quiescent.
    pub fn flush(&self) -> Result<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let world = self.world_size();
        tracing::debug!(rank = self.rank(), epoch, "flushing communication layer");

        for dst in 0..world {
            let pendings = {
                let mut buf = self.buffers[dst].lock();
                if buf.is_empty() {
                    None
                } else {
                    Some(buf.take())
                }
            };
            if let Some(payload) = pendings {
                self.enqueue(dst, self.buffered_tag, payload)?;
            }
            let mut control = [0u8; 8];
            LittleEndian::write_u64(&mut control, epoch);
            self.enqueue(dst, TAG_FLUSH, control.to_vec())?;
        }

        self.pending.wait_zero();
        self.flushes.wait(epoch, world);
        self.transport.barrier();
        Ok(())
    }
}

impl<T: Transport> Drop for CommLayer<T> {
    fn drop(&mut self) {
        let _ = self.out_tx.send(Outbound::Shutdown);
        if let Some(handle) = self.sender.take() {
            let _ = handle.join();
        }
        if self.receiver.is_some() {
            let _ = self.transport.send(self.rank(), TAG_SHUTDOWN, Vec::new());
        }
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::comm::ChannelTransport;

    const TAG: u8 = 7;

    /// Every rank streams sequence-numbered payloads to every other rank
    /// through small buffers; after the flush each rank must have received
    /// every payload of every source in send order.
    #[test]
    fn test_coalesced_delivery_in_order() {
        let world = 4;
        let n_msgs = 257u32;
        let handles: Vec<_> = ChannelTransport::group(world)
            .into_iter()
            .map(|transport| {
                std::thread::spawn(move || {
                    let received: Arc<Mutex<HashMap<usize, Vec<u32>>>> =
                        Arc::new(Mutex::new(HashMap::new()));
                    let sink = Arc::clone(&received);

                    let mut layer = CommLayer::new(Arc::new(transport), 64, TAG);
                    layer.register_handler(
                        TAG,
                        Box::new(move |src, payload| {
                            let mut map = sink.lock();
                            let list = map.entry(src).or_default();
                            for chunk in payload.chunks_exact(4) {
                                list.push(LittleEndian::read_u32(chunk));
                            }
                        }),
                    );
                    layer.start();

                    let me = layer.rank();
                    for seq in 0..n_msgs {
                        for dst in 0..world {
                            if dst == me {
                                continue;
                            }
                            let mut bytes = [0u8; 4];
                            LittleEndian::write_u32(&mut bytes, seq);
                            layer.send_buffered(dst, &bytes).unwrap();
                        }
                    }
                    layer.flush().unwrap();

                    let map = received.lock();
                    assert_eq!(map.len(), world - 1);
                    for (src, list) in map.iter() {
                        assert_ne!(*src, me);
                        let expected: Vec<u32> = (0..n_msgs).collect();
                        assert_eq!(list, &expected, "rank {me} from {src}");
                    }
                    drop(map);
                    // second flush with no traffic must also terminate
                    layer.flush().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_direct_send_bypasses_buffers() {
        let handles: Vec<_> = ChannelTransport::group(2)
            .into_iter()
            .map(|transport| {
                std::thread::spawn(move || {
                    let received = Arc::new(Mutex::new(Vec::new()));
                    let sink = Arc::clone(&received);

                    let mut layer = CommLayer::new(Arc::new(transport), 1024, TAG);
                    layer.register_handler(
                        TAG,
                        Box::new(move |src, payload| {
                            sink.lock().push((src, payload.to_vec()));
                        }),
                    );
                    layer.start();

                    let peer = 1 - layer.rank();
                    layer.send_direct(peer, TAG, b"direct".to_vec()).unwrap();
                    layer.flush().unwrap();

                    let got = received.lock();
                    assert_eq!(got.as_slice(), &[(peer, b"direct".to_vec())]);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_oversized_payload_travels_alone() {
        let handles: Vec<_> = ChannelTransport::group(2)
            .into_iter()
            .map(|transport| {
                std::thread::spawn(move || {
                    let received = Arc::new(Mutex::new(0usize));
                    let sink = Arc::clone(&received);

                    let mut layer = CommLayer::new(Arc::new(transport), 8, TAG);
                    layer.register_handler(
                        TAG,
                        Box::new(move |_src, payload| {
                            *sink.lock() += payload.len();
                        }),
                    );
                    layer.start();

                    let peer = 1 - layer.rank();
                    layer.send_buffered(peer, &[1u8; 6]).unwrap();
                    // larger than the whole buffer: must still arrive
                    layer.send_buffered(peer, &[2u8; 30]).unwrap();
                    layer.flush().unwrap();

                    assert_eq!(*received.lock(), 36);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}

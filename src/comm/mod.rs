//! Cross-rank communication
//!
//! Insertions into the distributed index are tiny; sending each one across
//! the transport would drown in per-message overhead. This module coalesces
//! them: per destination rank a bounded byte buffer accumulates payloads,
//! full buffers travel as single messages through a background sender, and a
//! background receiver dispatches arriving payloads to per-tag callbacks.
//!
//! The transport itself is abstracted behind [`Transport`], which demands
//! MPI-shaped semantics: point-to-point FIFO per (source, destination)
//! pair, a collective barrier, and an allreduce. [`ChannelTransport`] is the
//! in-process implementation used when ranks are threads; a cluster
//! deployment implements the same trait over its message-passing runtime.

mod buffer;
mod layer;
mod transport;

pub use buffer::MessageBuffer;
pub use layer::{CommLayer, Handler, MAX_USER_TAG};
pub use transport::{ChannelTransport, Message, Transport};

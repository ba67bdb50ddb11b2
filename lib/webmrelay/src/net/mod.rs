//! The relay's networking core: the poll-driven endpoint, per-connection
//! state machines, refcounted stream buffers and the WebM pipeline.

pub mod buffer;
pub mod connection;
pub mod endpoint;
pub mod http;
pub mod stream;
pub mod support;

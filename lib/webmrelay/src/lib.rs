//! webmrelay relays live WebM streams over HTTP: one POST publisher per
//! stream path, any number of chunked GET viewers, no transcoding. A
//! single-threaded poll loop multiplexes every socket; the ingest byte
//! stream is parsed incrementally so each Matroska Cluster fans out to
//! viewers as soon as it is complete.

pub mod ebml;
pub mod logging;
pub mod net;
pub mod time;

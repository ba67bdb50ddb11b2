//! Per-stream state and the streaming WebM pipeline: isolating the
//! container header, framing Clusters out of the ingest byte stream,
//! rewriting Cluster timecodes so the output timeline survives publisher
//! reconnects, and maintaining the intro cluster a new viewer needs to
//! start decoding.

use crate::ebml::writer::EbmlWriter;
use crate::ebml::{matroska, reader, UNKNOWN_SIZE};
use crate::net::buffer::{chunk_wrap, BufferList, NodeId};
use crate::net::http;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::time::Usec;
use hashbrown::HashMap;
use std::sync::Arc;

pub type StreamId = usize;

/// Byte range of one complete Cluster inside an ingest accumulator.
/// Everything before `start` is skipped top-level filler; the caller
/// consumes `end` bytes in total.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClusterSpan {
    pub start: usize,
    pub end: usize,
}

pub struct Stream {
    /// Resource path the stream is registered under.
    pub path: String,

    pub buffers: BufferList,

    /// Chunk-encapsulated video header (EBML through Tracks, Segment
    /// rewritten to unknown size). Shared with every viewer's private
    /// header buffer.
    header: Option<Arc<Vec<u8>>>,

    /// Blocks since the last video keyframe, packaged as complete
    /// Clusters. Reset whenever a new keyframe arrives.
    intro: EbmlWriter,

    /// Sum of `last_observed_timecode` over all previous publishers of
    /// this path; added to every outgoing Cluster timecode.
    prev_sources_offset: u64,
    /// Largest absolute block timecode seen from the current publisher.
    last_observed_timecode: u64,

    /// Set when the publisher leaves; cleared when one returns. Drives
    /// the idle-stream GC.
    pub last_disconnect_at: Option<Usec>,
    /// Wall clock of the last Cluster append, for the viewer staleness
    /// check.
    pub latest_cluster_received_at: Usec,

    params: HashMap<String, Option<String>>,
}

impl Stream {
    pub fn new(path: String) -> Stream {
        Stream {
            path,
            buffers: BufferList::new(),
            header: None,
            intro: EbmlWriter::new(),
            prev_sources_offset: 0,
            last_observed_timecode: 0,
            last_disconnect_at: None,
            latest_cluster_received_at: 0,
            params: HashMap::new(),
        }
    }

    /// Records (and overwrites) the publisher's query parameters.
    pub fn record_params(&mut self, query: &str) {
        for (name, value) in http::parse_query(query) {
            self.params.insert(name, value);
        }
    }

    pub fn params(&self) -> &HashMap<String, Option<String>> {
        &self.params
    }

    /// Stores the extracted video header, chunk-encapsulated for egress.
    pub fn set_header(&mut self, header: &[u8]) {
        self.header = Some(Arc::new(chunk_wrap(header)));
    }

    pub fn header(&self) -> Option<Arc<Vec<u8>>> {
        self.header.clone()
    }

    /// Current intro image: zero or more complete Clusters starting at
    /// the last keyframe. Empty until the first keyframe arrives.
    pub fn intro_image(&self) -> &[u8] {
        self.intro.as_slice()
    }

    pub fn prev_sources_offset(&self) -> u64 {
        self.prev_sources_offset
    }

    pub fn last_observed_timecode(&self) -> u64 {
        self.last_observed_timecode
    }

    /// Publisher teardown: roll the publisher's timeline into the offset
    /// applied to the next publisher's Clusters, and start the idle
    /// clock.
    pub fn commit_publisher_offset(&mut self, now: Usec) {
        self.prev_sources_offset += self.last_observed_timecode;
        self.last_observed_timecode = 0;
        self.last_disconnect_at = Some(now);
    }

    /// A publisher (re)attached; the stream is live again.
    pub fn publisher_attached(&mut self) {
        self.last_disconnect_at = None;
    }

    /// Runs one complete Cluster through the pipeline: patches its
    /// timecode, feeds the intro accumulator, and appends the patched
    /// result to the buffer list. Returns the new tail node, which holds
    /// the pipeline's own temporary reference.
    pub fn ingest_cluster(&mut self, cluster: &[u8], now: Usec) -> NodeId {
        let patched = self.inspect_cluster(cluster);
        let node = self.buffers.append_chunked(&patched, now);
        self.latest_cluster_received_at = now;
        node
    }

    /// Walks a Cluster's children, producing the timecode-patched copy
    /// and mirroring SimpleBlocks into the intro accumulator. A track-1
    /// keyframe resets the accumulator to start fresh at this Cluster.
    fn inspect_cluster(&mut self, cluster: &[u8]) -> Vec<u8> {
        let mut pos = 0;
        if reader::read_element_header(cluster, &mut pos).is_none() {
            return Vec::new();
        }

        let mut patched = EbmlWriter::new();
        let patched_cluster = patched.element_start(matroska::CLUSTER);
        let mut intro_cluster = self.intro.element_start(matroska::CLUSTER);
        let mut cluster_timecode: u64 = 0;

        while pos < cluster.len() {
            let element_start = pos;
            let element = match reader::read_element_header(cluster, &mut pos) {
                Some(element) => element,
                None => break,
            };

            let data_start = pos;
            let data_end = match (data_start as u64).checked_add(element.data_size) {
                Some(end) if element.data_size != UNKNOWN_SIZE => {
                    (end.min(cluster.len() as u64)) as usize
                }
                _ => cluster.len(),
            };
            let data = &cluster[data_start..data_end];

            if element.id == matroska::TIMECODE {
                cluster_timecode = reader::read_uint(data);
                let patched_timecode = self.prev_sources_offset + cluster_timecode;
                patched.write_uint(matroska::TIMECODE, patched_timecode);
                self.intro.write_uint(matroska::TIMECODE, patched_timecode);
            } else {
                // Everything that isn't the Cluster Timecode is copied
                // verbatim, header included.
                patched.write_raw(&cluster[element_start..data_end]);
            }

            if element.id == matroska::SIMPLE_BLOCK {
                if let Some(block) = parse_block_header(cluster, data_start, data_end) {
                    self.last_observed_timecode =
                        cluster_timecode.wrapping_add(block.relative_timecode as u64);

                    if block.flags & matroska::BLOCK_FLAG_KEYFRAME != 0
                        && block.track_number == 1
                    {
                        // Keyframe on the video track: restart the intro
                        // at this Cluster.
                        self.intro = EbmlWriter::new();
                        intro_cluster = self.intro.element_start(matroska::CLUSTER);
                        self.intro.write_uint(
                            matroska::TIMECODE,
                            self.prev_sources_offset + cluster_timecode,
                        );
                    }

                    self.intro.write_raw(&cluster[element_start..data_end]);
                }
            }

            pos = data_end;
        }

        self.intro.element_end(intro_cluster);
        patched.element_end(patched_cluster);
        patched.into_vec()
    }
}

struct BlockHeader {
    track_number: u64,
    relative_timecode: i16,
    flags: u8,
}

/// Reads the SimpleBlock prelude: track-number VINT, 16 bit relative
/// timecode, flags byte.
fn parse_block_header(cluster: &[u8], data_start: usize, data_end: usize) -> Option<BlockHeader> {
    let mut block_pos = data_start;
    let track_number = reader::read_data_size(&cluster[..data_end], &mut block_pos)?;

    let timecode_bytes = cluster.get(block_pos..block_pos + 2)?;
    let relative_timecode = reader::read_int(timecode_bytes) as i16;
    let flags = *cluster.get(block_pos + 2)?;

    Some(BlockHeader { track_number, relative_timecode, flags })
}

/// Scans the accumulator for the initial container header: every element
/// through the end of Tracks. The Segment's declared size is rewritten in
/// place to the unknown-size pattern at the same width, and iteration
/// continues inside it. Returns the header length once Tracks is fully
/// present; `None` means more bytes are needed.
pub fn try_extract_header(scratch: &mut [u8]) -> Option<usize> {
    let mut pos = 0;

    loop {
        let id = reader::read_element_id(scratch, &mut pos)?;

        let size_offset = pos;
        let size = reader::read_data_size(scratch, &mut pos)?;

        if id == matroska::SEGMENT {
            // Patch the declared size to "unknown" at the same width so
            // players don't expect EOF, then descend into the segment.
            let width = pos - size_offset;
            scratch[size_offset] = 0xFF >> (width - 1);
            for byte in &mut scratch[size_offset + 1..pos] {
                *byte = 0xFF;
            }
            continue;
        }

        if size == UNKNOWN_SIZE {
            return None;
        }
        let data_end = (pos as u64).checked_add(size)?;
        if data_end > scratch.len() as u64 {
            return None;
        }
        pos = data_end as usize;

        if id == matroska::TRACKS {
            return Some(pos);
        }
    }
}

/// Scans the accumulator for the next complete Cluster. Top-level
/// elements in front of it are skipped. `Ok(None)` means more bytes are
/// needed; a Cluster declaring an unknown size is unsupported and fatal.
pub fn try_extract_cluster(buf: &[u8]) -> NetworkResult<Option<ClusterSpan>> {
    let mut pos = 0;

    loop {
        let element_start = pos;
        let element = match reader::read_element_header(buf, &mut pos) {
            Some(element) => element,
            None => return Ok(None),
        };

        if element.data_size == UNKNOWN_SIZE {
            return Err(NetworkError::Fatal(ErrorType::BadStream));
        }

        let data_end = match (pos as u64).checked_add(element.data_size) {
            Some(end) if end <= buf.len() as u64 => end as usize,
            Some(_) => return Ok(None),
            None => return Err(NetworkError::Fatal(ErrorType::BadStream)),
        };

        if element.id == matroska::CLUSTER {
            return Ok(Some(ClusterSpan { start: element_start, end: data_end }));
        }

        pos = data_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebml::writer::EbmlWriter;

    const NOW: Usec = 1_700_000_000_000_000;

    fn simple_block(track: u8, relative_timecode: i16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut block = Vec::new();
        block.push(0x80 | track); // 1 byte track VINT
        block.extend_from_slice(&relative_timecode.to_be_bytes());
        block.push(flags);
        block.extend_from_slice(payload);

        let mut w = EbmlWriter::new();
        w.write_id(matroska::SIMPLE_BLOCK);
        w.write_size(block.len() as u64, 0);
        w.write_raw(&block);
        w.into_vec()
    }

    fn cluster(timecode: u64, blocks: &[Vec<u8>]) -> Vec<u8> {
        let mut w = EbmlWriter::new();
        let o = w.element_start(matroska::CLUSTER);
        w.write_uint(matroska::TIMECODE, timecode);
        for block in blocks {
            w.write_raw(block);
        }
        w.element_end(o);
        w.into_vec()
    }

    fn header_bytes() -> Vec<u8> {
        let mut w = EbmlWriter::new();
        let o = w.element_start(matroska::EBML);
        w.write_string(matroska::DOC_TYPE, "webm");
        w.element_end(o);

        // Streaming input: the Segment carries a (bogus) declared size
        // that extraction must rewrite to unknown at the same width.
        w.write_id(matroska::SEGMENT);
        w.write_size(0, 4);

        let o = w.element_start(matroska::INFO);
        w.write_uint(matroska::TIMECODE_SCALE, 1_000_000);
        w.element_end(o);

        let o = w.element_start(matroska::TRACKS);
        let t = w.element_start(matroska::TRACK_ENTRY);
        w.write_uint(matroska::TRACK_NUMBER, 1);
        w.write_uint(matroska::TRACK_TYPE, matroska::TRACK_TYPE_VIDEO);
        w.write_string(matroska::CODEC_ID, "V_VP8");
        w.element_end(t);
        w.element_end(o);

        w.into_vec()
    }

    #[test]
    fn test_try_extract_header() {
        let mut bytes = header_bytes();
        let expected_len = bytes.len();

        let header_len = try_extract_header(&mut bytes).unwrap();
        assert_eq!(header_len, expected_len);

        // The Segment size was rewritten in place to unknown, same width.
        let mut pos = 0;
        let ebml = reader::read_element(&bytes, &mut pos).unwrap();
        assert_eq!(ebml.id, matroska::EBML);

        let segment = reader::read_element_header(&bytes, &mut pos).unwrap();
        assert_eq!(segment.id, matroska::SEGMENT);
        assert_eq!(segment.header_size, 8);
        assert_eq!(segment.data_size, UNKNOWN_SIZE);
    }

    #[test]
    fn test_try_extract_header_byte_at_a_time() {
        let full = header_bytes();

        // Feeding the accumulator one byte at a time must extract the
        // header exactly when the last Tracks byte arrives.
        for upto in 1..full.len() {
            let mut partial = full[..upto].to_vec();
            assert_eq!(try_extract_header(&mut partial), None, "at {} bytes", upto);
        }

        let mut complete = full.clone();
        assert_eq!(try_extract_header(&mut complete), Some(full.len()));
    }

    #[test]
    fn test_try_extract_header_trailing_cluster_untouched() {
        let mut bytes = header_bytes();
        let header_len = bytes.len();
        let c1 = cluster(0, &[simple_block(1, 0, matroska::BLOCK_FLAG_KEYFRAME, &[1, 2, 3, 4])]);
        bytes.extend_from_slice(&c1);

        assert_eq!(try_extract_header(&mut bytes), Some(header_len));
        assert_eq!(&bytes[header_len..], &c1[..]);
    }

    #[test]
    fn test_try_extract_cluster() {
        let c1 = cluster(0, &[simple_block(1, 0, matroska::BLOCK_FLAG_KEYFRAME, &[0; 4])]);

        for upto in 1..c1.len() {
            assert_eq!(try_extract_cluster(&c1[..upto]).unwrap(), None, "at {} bytes", upto);
        }

        let span = try_extract_cluster(&c1).unwrap().unwrap();
        assert_eq!(span, ClusterSpan { start: 0, end: c1.len() });
    }

    #[test]
    fn test_try_extract_cluster_skips_leading_elements() {
        // A stray top-level Void-like element in front of the Cluster.
        let mut bytes = Vec::new();
        let mut w = EbmlWriter::new();
        w.write_uint(0xEC, 0);
        bytes.extend_from_slice(w.as_slice());
        let filler_len = bytes.len();

        let c1 = cluster(5, &[simple_block(1, 0, 0, &[0; 2])]);
        bytes.extend_from_slice(&c1);

        let span = try_extract_cluster(&bytes).unwrap().unwrap();
        assert_eq!(span.start, filler_len);
        assert_eq!(span.end, bytes.len());
    }

    #[test]
    fn test_try_extract_cluster_unknown_size_is_fatal() {
        let mut w = EbmlWriter::new();
        w.element_start_unknown_size(matroska::CLUSTER);
        w.write_uint(matroska::TIMECODE, 0);

        let result = try_extract_cluster(w.as_slice());
        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::BadStream));
    }

    #[test]
    fn test_ingest_patches_timecode_with_offset() {
        let mut stream = Stream::new("/a".to_string());
        stream.prev_sources_offset = 1000;

        let c1 = cluster(200, &[simple_block(1, 10, matroska::BLOCK_FLAG_KEYFRAME, &[9; 4])]);
        let node = stream.ingest_cluster(&c1, NOW);

        // The patched buffer is chunk framed; skip "len\r\n" to the payload.
        let wrapped = stream.buffers.content(node).to_vec();
        let payload_at = wrapped.iter().position(|&b| b == b'\n').unwrap() + 1;
        let patched = &wrapped[payload_at..wrapped.len() - 2];

        let mut pos = 0;
        let c = reader::read_element_header(patched, &mut pos).unwrap();
        assert_eq!(c.id, matroska::CLUSTER);
        let tc = reader::read_element_header(patched, &mut pos).unwrap();
        assert_eq!(tc.id, matroska::TIMECODE);
        assert_eq!(reader::read_uint(&patched[pos..pos + tc.data_size as usize]), 1200);

        assert_eq!(stream.last_observed_timecode(), 210);
        assert_eq!(stream.latest_cluster_received_at, NOW);
    }

    #[test]
    fn test_blocks_copied_verbatim() {
        let mut stream = Stream::new("/a".to_string());

        let block = simple_block(1, 4, matroska::BLOCK_FLAG_KEYFRAME, &[1, 2, 3, 4]);
        let c1 = cluster(0, &[block.clone()]);
        let node = stream.ingest_cluster(&c1, NOW);

        let wrapped = stream.buffers.content(node).to_vec();
        let needle = &block[..];
        assert!(
            wrapped.windows(needle.len()).any(|window| window == needle),
            "SimpleBlock must appear verbatim in the patched buffer"
        );
    }

    #[test]
    fn test_intro_resets_on_keyframe() {
        let mut stream = Stream::new("/a".to_string());

        let k1 = cluster(0, &[simple_block(1, 0, matroska::BLOCK_FLAG_KEYFRAME, &[1; 4])]);
        let c2 = cluster(40, &[simple_block(1, 0, 0, &[2; 4])]);
        let c3 = cluster(80, &[simple_block(1, 0, 0, &[3; 4])]);
        let k4 = cluster(120, &[simple_block(1, 0, matroska::BLOCK_FLAG_KEYFRAME, &[4; 4])]);

        stream.ingest_cluster(&k1, NOW);
        stream.ingest_cluster(&c2, NOW + 1);
        stream.ingest_cluster(&c3, NOW + 2);

        // Before the next keyframe the intro spans K1..C3: three clusters.
        assert_eq!(count_clusters(stream.intro_image()), 3);

        stream.ingest_cluster(&k4, NOW + 3);

        // A late viewer gets exactly K4.
        let intro = stream.intro_image().to_vec();
        assert_eq!(count_clusters(&intro), 1);

        let mut pos = 0;
        let c = reader::read_element_header(&intro, &mut pos).unwrap();
        assert_eq!(c.id, matroska::CLUSTER);
        let tc = reader::read_element_header(&intro, &mut pos).unwrap();
        assert_eq!(tc.id, matroska::TIMECODE);
        assert_eq!(reader::read_uint(&intro[pos..pos + tc.data_size as usize]), 120);
        assert!(intro
            .windows(4)
            .any(|window| window == [4u8; 4]));
        assert!(!intro.windows(4).any(|window| window == [1u8; 4]));
    }

    #[test]
    fn test_intro_accumulates_until_next_keyframe() {
        let mut stream = Stream::new("/a".to_string());

        let k1 = cluster(0, &[simple_block(1, 0, matroska::BLOCK_FLAG_KEYFRAME, &[1; 4])]);
        let c2 = cluster(40, &[simple_block(1, 0, 0, &[2; 4])]);

        stream.ingest_cluster(&k1, NOW);
        stream.ingest_cluster(&c2, NOW + 1);

        let intro = stream.intro_image();
        assert!(intro.windows(4).any(|window| window == [1u8; 4]));
        assert!(intro.windows(4).any(|window| window == [2u8; 4]));
    }

    #[test]
    fn test_keyframe_on_other_track_does_not_reset() {
        let mut stream = Stream::new("/a".to_string());

        let k1 = cluster(0, &[simple_block(1, 0, matroska::BLOCK_FLAG_KEYFRAME, &[1; 4])]);
        // "Keyframe" flag on an audio track must not restart the intro.
        let a2 = cluster(40, &[simple_block(2, 0, matroska::BLOCK_FLAG_KEYFRAME, &[2; 4])]);

        stream.ingest_cluster(&k1, NOW);
        stream.ingest_cluster(&a2, NOW + 1);

        assert_eq!(count_clusters(stream.intro_image()), 2);
        assert!(stream.intro_image().windows(4).any(|window| window == [1u8; 4]));
    }

    #[test]
    fn test_publisher_reconnect_monotonicity() {
        let mut stream = Stream::new("/a".to_string());

        // Publisher A: timecodes 0, 100, 200.
        for &timecode in &[0u64, 100, 200] {
            let c = cluster(
                timecode,
                &[simple_block(1, 0, matroska::BLOCK_FLAG_KEYFRAME, &[0; 4])],
            );
            stream.ingest_cluster(&c, NOW);
        }
        stream.commit_publisher_offset(NOW + 10);
        assert_eq!(stream.prev_sources_offset(), 200);
        assert_eq!(stream.last_disconnect_at, Some(NOW + 10));

        // Publisher B: timecodes 0, 50 come out as 200, 250.
        stream.publisher_attached();
        assert_eq!(stream.last_disconnect_at, None);

        let mut emitted = Vec::new();
        for &timecode in &[0u64, 50] {
            let c = cluster(
                timecode,
                &[simple_block(1, 0, matroska::BLOCK_FLAG_KEYFRAME, &[0; 4])],
            );
            let node = stream.ingest_cluster(&c, NOW + 20);
            emitted.push(first_cluster_timecode(stream.buffers.content(node)));
        }
        assert_eq!(emitted, vec![200, 250]);

        // A publisher that leaves without sending blocks commits nothing.
        stream.commit_publisher_offset(NOW + 30);
        assert_eq!(stream.prev_sources_offset(), 250);
        stream.publisher_attached();
        stream.commit_publisher_offset(NOW + 40);
        assert_eq!(stream.prev_sources_offset(), 250);
    }

    #[test]
    fn test_record_params_overwrites() {
        let mut stream = Stream::new("/a".to_string());

        stream.record_params("user=alice&raw");
        stream.record_params("user=bob");

        assert_eq!(stream.params().get("user"), Some(&Some("bob".to_string())));
        assert_eq!(stream.params().get("raw"), Some(&None));
    }

    fn count_clusters(buf: &[u8]) -> usize {
        let mut count = 0;
        let mut pos = 0;
        while let Some(element) = reader::read_element(buf, &mut pos) {
            assert_eq!(element.id, matroska::CLUSTER);
            count += 1;
        }
        assert_eq!(pos, buf.len(), "intro image must be complete clusters");
        count
    }

    fn first_cluster_timecode(wrapped: &[u8]) -> u64 {
        let payload_at = wrapped.iter().position(|&b| b == b'\n').unwrap() + 1;
        let payload = &wrapped[payload_at..wrapped.len() - 2];

        let mut pos = 0;
        let c = reader::read_element_header(payload, &mut pos).unwrap();
        assert_eq!(c.id, matroska::CLUSTER);
        let tc = reader::read_element_header(payload, &mut pos).unwrap();
        assert_eq!(tc.id, matroska::TIMECODE);
        reader::read_uint(&payload[pos..pos + tc.data_size as usize])
    }
}

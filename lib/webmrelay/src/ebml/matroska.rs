//! Matroska element IDs and SimpleBlock flag bits.
//! http://matroska.org/technical/specs/index.html

pub const EBML: u32 = 0x1A45_DFA3;
pub const DOC_TYPE: u32 = 0x4282;
pub const SEGMENT: u32 = 0x1853_8067;

pub const INFO: u32 = 0x1549_A966;
pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;

pub const TRACKS: u32 = 0x1654_AE6B;
pub const TRACK_ENTRY: u32 = 0xAE;
pub const TRACK_NUMBER: u32 = 0xD7;
pub const TRACK_TYPE: u32 = 0x83;
pub const CODEC_ID: u32 = 0x86;

pub const TRACK_TYPE_VIDEO: u64 = 0x01;

pub const CLUSTER: u32 = 0x1F43_B675;
pub const TIMECODE: u32 = 0xE7;
pub const SIMPLE_BLOCK: u32 = 0xA3;

// SimpleBlock header flag bits
pub const BLOCK_FLAG_KEYFRAME: u8 = 0b1000_0000;
pub const BLOCK_FLAG_INVISIBLE: u8 = 0b0000_1000;
pub const BLOCK_FLAG_LACING: u8 = 0b0000_0110;
pub const BLOCK_FLAG_DISCARDABLE: u8 = 0b0000_0001;

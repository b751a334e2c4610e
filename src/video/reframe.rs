//! NAL unit framing rewrites between length-prefixed and Annex B buffers.
//!
//! Both directions work in place and keep the buffer length unchanged: a
//! length field is swapped for a start code of the same width and back.

use tracing::debug;

use crate::video::BufferFraming;

pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Why the decode-direction rewrite stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReframeStop {
    /// Every unit up to the end of the buffer was rewritten.
    Exhausted,
    /// A length field read as 1, i.e. the rest already carries start codes.
    AlreadyFramed { offset: usize },
    /// The declared unit length runs past the end of the buffer.
    Overrun { offset: usize, length: usize },
    /// Not even the length field fits in the remaining bytes.
    ShortHeader { offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReframeReport {
    pub units: usize,
    pub stop: ReframeStop,
}

/// Replaces every big-endian length prefix with a start code, left to right.
///
/// Malformed tails are not an error: rewriting simply stops and the report
/// says where and why.
pub fn length_prefixed_to_annex_b(data: &mut [u8], framing: BufferFraming) -> ReframeReport {
    let Some(width) = framing.length_size() else {
        return ReframeReport {
            units: 0,
            stop: ReframeStop::Exhausted,
        };
    };

    let mut offset = 0;
    let mut units = 0;
    while offset < data.len() {
        if offset + width > data.len() {
            debug!(offset, "NAL length field truncated");
            return ReframeReport {
                units,
                stop: ReframeStop::ShortHeader { offset },
            };
        }
        let length = read_be(&data[offset..offset + width]);
        if length == 1 {
            debug!(offset, "NAL start code found, skipping");
            return ReframeReport {
                units,
                stop: ReframeStop::AlreadyFramed { offset },
            };
        }
        if offset + width + length > data.len() {
            debug!(offset, length, "NAL length more than buffer size");
            return ReframeReport {
                units,
                stop: ReframeStop::Overrun { offset, length },
            };
        }
        data[offset..offset + width].copy_from_slice(&START_CODE[START_CODE.len() - width..]);
        offset += width + length;
        units += 1;
    }

    ReframeReport {
        units,
        stop: ReframeStop::Exhausted,
    }
}

/// Replaces 4-byte start codes with little-endian unit lengths.
///
/// Scanning ends at the first VCL unit (type 5 or lower); that unit is taken
/// to run to the end of the buffer. Returns the number of units rewritten.
pub fn annex_b_to_length_prefixed(data: &mut [u8]) -> usize {
    let mut previous: Option<usize> = None;
    let mut search_from = 0;
    let mut units = 0;

    while let Some(pos) = find_start_code(data, search_from) {
        if let Some(prev) = previous {
            write_le_length(data, prev, pos - prev - START_CODE.len());
            units += 1;
        }
        previous = Some(pos);
        search_from = pos + START_CODE.len();
        let nal_type = data.get(search_from).map(|header| header & 0x1f);
        if matches!(nal_type, Some(kind) if kind <= 5) {
            break;
        }
    }

    if let Some(prev) = previous {
        write_le_length(data, prev, data.len() - prev - START_CODE.len());
        units += 1;
    }
    units
}

pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(START_CODE.len())
        .position(|window| window == START_CODE)
        .map(|pos| pos + from)
}

fn read_be(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .fold(0usize, |acc, byte| (acc << 8) | *byte as usize)
}

fn write_le_length(data: &mut [u8], offset: usize, length: usize) {
    data[offset..offset + 4].copy_from_slice(&(length as u32).to_le_bytes());
}

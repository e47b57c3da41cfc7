//! Waveform frame encoding for the data plane.
//!
//! Every captured block goes out as one frame, in native byte order:
//!
//! ```text
//! uint64 sample_count
//! int64  sample_rate_hz
//! [sample_count] x { float32 I; float32 Q }
//! ```
//!
//! There is no delimiter beyond the fixed 16-byte header, no compression
//! and no checksum. A reader computes the next frame's offset from the
//! header alone: the payload is always exactly `sample_count * 8` bytes.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Result;
use crate::transport::DataTransport;
use crate::types::IqSample;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 16;

/// Size of one encoded (I, Q) sample pair in bytes.
pub const SAMPLE_LEN: usize = 8;

/// Samples encoded per payload write by [`write_frame`].
const WRITE_CHUNK_SAMPLES: usize = 64 * 1024;

/// One captured block, ready to be framed.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformFrame {
    /// Sample rate in effect when the block was requested.
    pub sample_rate_hz: i64,
    /// The captured samples; may be shorter than the requested depth.
    pub samples: Vec<IqSample>,
}

impl WaveformFrame {
    pub fn new(sample_rate_hz: i64, samples: Vec<IqSample>) -> Self {
        WaveformFrame {
            sample_rate_hz,
            samples,
        }
    }

    /// Number of samples carried by this frame.
    pub fn sample_count(&self) -> u64 {
        self.samples.len() as u64
    }

    /// Total encoded size of this frame in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.samples.len() * SAMPLE_LEN
    }

    /// Encode the whole frame into a single buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&encode_header(self.sample_count(), self.sample_rate_hz));
        encode_samples(&self.samples, &mut buf);
        buf
    }
}

/// Encode the 16-byte frame header.
pub fn encode_header(sample_count: u64, sample_rate_hz: i64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..8].copy_from_slice(&sample_count.to_ne_bytes());
    header[8..].copy_from_slice(&sample_rate_hz.to_ne_bytes());
    header
}

/// Append interleaved (I, Q) float32 pairs to `buf`.
pub fn encode_samples(samples: &[IqSample], buf: &mut BytesMut) {
    buf.reserve(samples.len() * SAMPLE_LEN);
    for s in samples {
        buf.put_f32_ne(s.re);
        buf.put_f32_ne(s.im);
    }
}

/// Write one frame to a data transport.
///
/// The header goes out first, then the payload in bounded chunks so a
/// 100M-sample block never needs a second full-size copy in memory.
pub async fn write_frame(transport: &mut dyn DataTransport, frame: &WaveformFrame) -> Result<()> {
    transport
        .send(&encode_header(frame.sample_count(), frame.sample_rate_hz))
        .await?;

    let chunk_len = WRITE_CHUNK_SAMPLES.min(frame.samples.len());
    let mut buf = BytesMut::with_capacity(chunk_len * SAMPLE_LEN);
    for chunk in frame.samples.chunks(WRITE_CHUNK_SAMPLES) {
        buf.clear();
        encode_samples(chunk, &mut buf);
        transport.send(&buf).await?;
    }
    Ok(())
}

/// Result of attempting to decode one frame from a byte buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeResult {
    /// A complete frame was decoded.
    Frame {
        frame: WaveformFrame,
        /// Number of bytes consumed from the input buffer.
        consumed: usize,
    },

    /// The buffer does not yet contain a complete frame.
    Incomplete {
        /// Total bytes needed before the frame can be decoded, if the
        /// header has arrived.
        needed: Option<usize>,
    },
}

/// Decode one frame from the front of `buf`.
pub fn decode_frame(buf: &[u8]) -> DecodeResult {
    if buf.len() < HEADER_LEN {
        return DecodeResult::Incomplete { needed: None };
    }

    let mut header = &buf[..HEADER_LEN];
    let sample_count = header.get_u64_ne() as usize;
    let sample_rate_hz = header.get_i64_ne();

    let Some(total) = sample_count
        .checked_mul(SAMPLE_LEN)
        .and_then(|n| n.checked_add(HEADER_LEN))
    else {
        tracing::warn!(sample_count, "frame header sample count overflows the address space");
        return DecodeResult::Incomplete { needed: None };
    };
    if buf.len() < total {
        return DecodeResult::Incomplete {
            needed: Some(total),
        };
    }

    let mut payload = &buf[HEADER_LEN..total];
    let mut samples = Vec::with_capacity(sample_count);
    for _ in 0..sample_count {
        let i = payload.get_f32_ne();
        let q = payload.get_f32_ne();
        samples.push(IqSample::new(i, q));
    }

    DecodeResult::Frame {
        frame: WaveformFrame::new(sample_rate_hz, samples),
        consumed: total,
    }
}

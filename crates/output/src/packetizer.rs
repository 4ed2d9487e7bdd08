// Copyright 2025-2026 CEMAXECUTER LLC

//! Re-chunks a stream of arbitrarily sized IQ blocks into fixed-size frames.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! [i64 sequence]            only with HeaderMode::Sequence64
//! [I, Q] x samples_per_frame  i16 (scaled by 32768) or f32
//! ```
//!
//! The frame is assembled in place inside one fixed allocation. A partial
//! frame is carried over between calls, so output framing does not depend on
//! how the producer chunks its input.

use byteorder::{ByteOrder, LittleEndian};
use iq_host::stream::STREAM_BUFFER_SIZE;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

/// Size of the optional sequence header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Scale applied before quantizing to i16.
const INT16_SCALE: f32 = 32768.0;

/// Wire encoding of each sample component. Persisted as its integer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum SampleEncoding {
    #[default]
    Int16,
    Float32,
}

impl SampleEncoding {
    /// Bytes per complex sample on the wire.
    pub fn unit_size(self) -> usize {
        match self {
            SampleEncoding::Int16 => 4,
            SampleEncoding::Float32 => 8,
        }
    }
}

/// Optional header prefixed to every frame. Persisted as its integer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum HeaderMode {
    None,
    #[default]
    Sequence64,
}

impl HeaderMode {
    pub fn size(self) -> usize {
        match self {
            HeaderMode::None => 0,
            HeaderMode::Sequence64 => HEADER_SIZE,
        }
    }
}

impl From<SampleEncoding> for i64 {
    fn from(e: SampleEncoding) -> i64 {
        match e {
            SampleEncoding::Int16 => 0,
            SampleEncoding::Float32 => 1,
        }
    }
}

impl TryFrom<i64> for SampleEncoding {
    type Error = String;

    fn try_from(id: i64) -> Result<Self, String> {
        match id {
            0 => Ok(SampleEncoding::Int16),
            1 => Ok(SampleEncoding::Float32),
            other => Err(format!("unknown data type id {}", other)),
        }
    }
}

impl From<HeaderMode> for i64 {
    fn from(h: HeaderMode) -> i64 {
        match h {
            HeaderMode::None => 0,
            HeaderMode::Sequence64 => 1,
        }
    }
}

impl TryFrom<i64> for HeaderMode {
    type Error = String;

    fn try_from(id: i64) -> Result<Self, String> {
        match id {
            0 => Ok(HeaderMode::None),
            1 => Ok(HeaderMode::Sequence64),
            other => Err(format!("unknown packet header id {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub samples_per_frame: usize,
    pub encoding: SampleEncoding,
    pub header: HeaderMode,
}

impl FrameFormat {
    /// Returns None unless `0 < samples_per_frame <= STREAM_BUFFER_SIZE`.
    pub fn new(samples_per_frame: usize, encoding: SampleEncoding, header: HeaderMode) -> Option<Self> {
        if is_valid_frame_size(samples_per_frame) {
            Some(Self {
                samples_per_frame,
                encoding,
                header,
            })
        } else {
            None
        }
    }

    /// Total bytes of one emitted frame, header included.
    pub fn frame_len(&self) -> usize {
        self.header.size() + self.samples_per_frame * self.encoding.unit_size()
    }
}

pub fn is_valid_frame_size(samples_per_frame: usize) -> bool {
    samples_per_frame > 0 && samples_per_frame <= STREAM_BUFFER_SIZE
}

/// Quantize one component to i16. Out-of-range input saturates.
#[inline]
pub fn quantize_i16(x: f32) -> i16 {
    (x * INT16_SCALE).round() as i16
}

pub struct Packetizer {
    /// Room for the header plus STREAM_BUFFER_SIZE samples at the widest encoding.
    buf: Vec<u8>,
    format: FrameFormat,
    /// Samples currently held in the partial frame.
    filled: usize,
    sequence: i64,
}

impl Packetizer {
    pub fn new(format: FrameFormat) -> Self {
        let mut p = Self {
            buf: vec![0u8; HEADER_SIZE + STREAM_BUFFER_SIZE * SampleEncoding::Float32.unit_size()],
            format,
            filled: 0,
            sequence: 0,
        };
        p.reset(format);
        p
    }

    /// Drop any partial frame, zero the storage and restart the sequence at 0.
    pub fn reset(&mut self, format: FrameFormat) {
        self.buf.fill(0);
        self.format = format;
        self.filled = 0;
        self.sequence = 0;
        self.write_header();
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Sequence number the next emitted frame will carry.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Append samples, calling `emit` with every frame they complete.
    ///
    /// On return `filled() < samples_per_frame`.
    pub fn push<F>(&mut self, mut samples: &[Complex32], mut emit: F)
    where
        F: FnMut(&[u8]),
    {
        let spf = self.format.samples_per_frame;
        let frame_len = self.format.frame_len();

        while self.filled + samples.len() >= spf {
            let (head, rest) = samples.split_at(spf - self.filled);
            self.encode_at(self.filled, head);
            emit(&self.buf[..frame_len]);
            self.filled = 0;
            samples = rest;

            if self.format.header == HeaderMode::Sequence64 {
                self.sequence = self.sequence.wrapping_add(1);
                self.write_header();
            }
        }

        self.encode_at(self.filled, samples);
        self.filled += samples.len();
    }

    fn write_header(&mut self) {
        if self.format.header == HeaderMode::Sequence64 {
            LittleEndian::write_i64(&mut self.buf[..HEADER_SIZE], self.sequence);
        }
    }

    /// Encode `samples` into the payload starting at sample index `index`.
    fn encode_at(&mut self, index: usize, samples: &[Complex32]) {
        if samples.is_empty() {
            return;
        }
        let unit = self.format.encoding.unit_size();
        let start = self.format.header.size() + index * unit;
        let payload = &mut self.buf[start..start + samples.len() * unit];

        match self.format.encoding {
            SampleEncoding::Int16 => {
                for (out, s) in payload.chunks_exact_mut(4).zip(samples) {
                    LittleEndian::write_i16(&mut out[0..2], quantize_i16(s.re));
                    LittleEndian::write_i16(&mut out[2..4], quantize_i16(s.im));
                }
            }
            SampleEncoding::Float32 => {
                for (out, s) in payload.chunks_exact_mut(8).zip(samples) {
                    LittleEndian::write_f32(&mut out[0..4], s.re);
                    LittleEndian::write_f32(&mut out[4..8], s.im);
                }
            }
        }
    }
}

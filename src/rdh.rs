//! Raw Data Header reader.
//!
//! Each HBF payload starts with an RDH. Only the fields the pipeline
//! needs are decoded here; the rest of the 64-byte header is opaque.
//!
//! Field layout (little endian, stable across versions 3..6):
//!   byte  0      version
//!   byte  1      header size (64)
//!   bytes 2-3    FEE id
//!   byte  4      priority
//!   byte  5      source id (meaningful from v6)
//!   bytes 8-9    memory size (header + payload of this packet)
//!   byte  10     link id
//!   byte  11     packet counter
//!   bytes 12-13  CRU id (low 12 bits) and endpoint (high 4 bits)

use crate::config::{Detector, RdhVersion, SubSpecMode};
use std::fmt;

/// Declared RDH byte length for all supported versions.
pub const RDH_HEADER_SIZE: u8 = 64;

const MIN_DECODE_LEN: usize = 14;

#[derive(Debug)]
pub enum RdhError {
    TooShort { len: usize },
    VersionMismatch { expected: u8, received: u8 },
    BadHeaderSize { received: u8 },
    BadMemorySize { declared: u16, available: usize },
    UnknownSourceId { source_id: u8 },
}

impl fmt::Display for RdhError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RdhError::TooShort { len } => {
                write!(f, "HBF payload too short for an RDH: len={}", len)
            }
            RdhError::VersionMismatch { expected, received } => write!(
                f,
                "RDH version mismatch: expected={} received={}",
                expected, received
            ),
            RdhError::BadHeaderSize { received } => write!(
                f,
                "RDH declares invalid header size: received={} expected={}",
                received, RDH_HEADER_SIZE
            ),
            RdhError::BadMemorySize {
                declared,
                available,
            } => write!(
                f,
                "RDH memory size exceeds payload: declared={} available={}",
                declared, available
            ),
            RdhError::UnknownSourceId { source_id } => {
                write!(f, "RDH carries unknown source id: source_id={}", source_id)
            }
        }
    }
}

impl std::error::Error for RdhError {}

/// Zero-copy view over the RDH at the start of one HBF payload.
#[derive(Debug)]
pub struct RdhReader<'a> {
    data: &'a [u8],
    version: RdhVersion,
}

impl<'a> RdhReader<'a> {
    /// Validates length and version before any field access.
    pub fn new(data: &'a [u8], expected: RdhVersion) -> Result<Self, RdhError> {
        if data.len() < MIN_DECODE_LEN {
            return Err(RdhError::TooShort { len: data.len() });
        }
        if data[0] != expected.as_u8() {
            return Err(RdhError::VersionMismatch {
                expected: expected.as_u8(),
                received: data[0],
            });
        }
        Ok(Self {
            data,
            version: expected,
        })
    }

    pub fn version(&self) -> RdhVersion {
        self.version
    }

    pub fn header_size(&self) -> u8 {
        self.data[1]
    }

    pub fn fee_id(&self) -> u16 {
        u16::from_le_bytes([self.data[2], self.data[3]])
    }

    pub fn source_id(&self) -> u8 {
        self.data[5]
    }

    /// Size of this packet (header included) as declared by the RDH.
    pub fn memory_size(&self) -> u16 {
        u16::from_le_bytes([self.data[8], self.data[9]])
    }

    pub fn link_id(&self) -> u8 {
        self.data[10]
    }

    pub fn cru_id(&self) -> u16 {
        u16::from_le_bytes([self.data[12], self.data[13]]) & 0x0FFF
    }

    pub fn endpoint(&self) -> u8 {
        (u16::from_le_bytes([self.data[12], self.data[13]]) >> 12) as u8
    }

    /// Detector the payload belongs to. From v6 the RDH carries the source
    /// id itself; older versions rely on the configured detector.
    pub fn data_origin(&self, configured: Option<Detector>) -> Result<Detector, RdhError> {
        if self.version >= RdhVersion::V6 {
            let id = self.source_id();
            return Detector::from_source_id(id).ok_or(RdhError::UnknownSourceId { source_id: id });
        }
        configured.ok_or(RdhError::UnknownSourceId { source_id: 0 })
    }

    /// Raw (unmasked) sub-specification for the configured mode.
    pub fn sub_specification(&self, mode: SubSpecMode) -> u32 {
        match mode {
            SubSpecMode::FeeId => self.fee_id() as u32,
            SubSpecMode::CruLinkId => {
                let endpoint_offset = if self.endpoint() == 0 { 0 } else { 256 };
                ((self.cru_id() as u32) << 16) | (self.link_id() as u32 + endpoint_offset)
            }
        }
    }

    /// Structural checks used by the `rdh-sanity-check` option.
    pub fn sanity_check(&self) -> Result<(), RdhError> {
        if self.header_size() != RDH_HEADER_SIZE {
            return Err(RdhError::BadHeaderSize {
                received: self.header_size(),
            });
        }
        let declared = self.memory_size();
        if (declared as usize) > self.data.len() || declared < RDH_HEADER_SIZE as u16 {
            return Err(RdhError::BadMemorySize {
                declared,
                available: self.data.len(),
            });
        }
        Ok(())
    }

    /// With RDH v4 in triggered mode, readout emits HBFs consisting of an
    /// open/close header pair and no data in between.
    pub fn is_empty_trigger_hbf(&self) -> bool {
        self.version == RdhVersion::V4 && self.data.len() == 2 * RDH_HEADER_SIZE as usize
    }
}

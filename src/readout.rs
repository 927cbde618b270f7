//! Readout multipart framing.
//!
//! The readout process sends multipart messages where part 0 is a fixed
//! 12-byte header and parts 1..N are HBF payloads. The header layout is
//! frozen across interface versions; reserved bytes are carried through
//! so a parse/encode cycle is byte-identical.

use std::fmt;

/// Accepted readout interface version.
pub const READOUT_INTERFACE_VERSION: u32 = 2;

/// Frozen byte length of the readout header (part 0).
pub const READOUT_HEADER_SIZE: usize = 12;

/// A multipart message as received from the transport.
pub type Multipart = Vec<Vec<u8>>;

const FLAG_LAST_TF_MESSAGE: u8 = 0b0000_0001;
const FLAG_IS_RDH_FORMAT: u8 = 0b0000_0010;

#[derive(Debug)]
pub enum FramingError {
    /// Part 0 was not exactly `READOUT_HEADER_SIZE` bytes.
    HeaderSize { received: usize },
    /// Header version did not match `READOUT_INTERFACE_VERSION`.
    Version { received: u32 },
    /// Multipart had no parts at all.
    Empty,
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::HeaderSize { received } => write!(
                f,
                "incompatible readout header: received_size={} expected_size={}",
                received, READOUT_HEADER_SIZE
            ),
            FramingError::Version { received } => write!(
                f,
                "unsupported readout interface version: received={} expected={}",
                received, READOUT_INTERFACE_VERSION
            ),
            FramingError::Empty => write!(f, "empty readout multipart"),
        }
    }
}

impl std::error::Error for FramingError {}

/// Fixed-layout header carried as part 0 of every readout multipart.
///
/// Layout (little endian): version u32 | time_frame_id u32 | link_id u8 |
/// flags u8 | reserved [u8; 2].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadoutHeader {
    pub version: u32,
    pub time_frame_id: u32,
    pub link_id: u8,
    pub flags: u8,
    pub reserved: [u8; 2],
}

impl ReadoutHeader {
    pub fn new(time_frame_id: u32, link_id: u8) -> Self {
        Self {
            version: READOUT_INTERFACE_VERSION,
            time_frame_id,
            link_id,
            flags: 0,
            reserved: [0; 2],
        }
    }

    pub fn with_last_tf_message(mut self) -> Self {
        self.flags |= FLAG_LAST_TF_MESSAGE;
        self
    }

    pub fn with_rdh_format(mut self) -> Self {
        self.flags |= FLAG_IS_RDH_FORMAT;
        self
    }

    pub fn last_tf_message(&self) -> bool {
        self.flags & FLAG_LAST_TF_MESSAGE != 0
    }

    pub fn is_rdh_format(&self) -> bool {
        self.flags & FLAG_IS_RDH_FORMAT != 0
    }

    /// Parse part 0 of a multipart. Size is checked here; version is left
    /// to the caller so it can be reported separately.
    pub fn parse(part: &[u8]) -> Result<Self, FramingError> {
        if part.len() != READOUT_HEADER_SIZE {
            return Err(FramingError::HeaderSize {
                received: part.len(),
            });
        }
        Ok(Self {
            version: u32::from_le_bytes([part[0], part[1], part[2], part[3]]),
            time_frame_id: u32::from_le_bytes([part[4], part[5], part[6], part[7]]),
            link_id: part[8],
            flags: part[9],
            reserved: [part[10], part[11]],
        })
    }

    pub fn encode(&self) -> [u8; READOUT_HEADER_SIZE] {
        let mut buf = [0u8; READOUT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&self.time_frame_id.to_le_bytes());
        buf[8] = self.link_id;
        buf[9] = self.flags;
        buf[10] = self.reserved[0];
        buf[11] = self.reserved[1];
        buf
    }

    /// Parse and validate part 0 of a full multipart.
    pub fn from_multipart(multipart: &Multipart) -> Result<Self, FramingError> {
        let first = multipart.first().ok_or(FramingError::Empty)?;
        let header = Self::parse(first)?;
        if header.version != READOUT_INTERFACE_VERSION {
            return Err(FramingError::Version {
                received: header.version,
            });
        }
        Ok(header)
    }
}

/// Total payload bytes of a multipart, header part excluded.
pub fn payload_size(multipart: &Multipart) -> u64 {
    multipart.iter().skip(1).map(|p| p.len() as u64).sum()
}

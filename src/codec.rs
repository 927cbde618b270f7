//! Interleaved header/data framing of SubTimeFrames.
//!
//! The output serializer turns an STF into a multipart: part 0 is the STF
//! descriptor, then for each equipment one equipment descriptor part
//! followed by that equipment's HBF payload parts, in order. Source
//! buffers store and serve these parts verbatim; aggregators rebuild the
//! STF on arrival.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::readout::Multipart;
use crate::stf::{EquipmentIdentifier, StfHeader, StfOrigin, SubTimeFrame};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StfDescriptor {
    header: StfHeader,
    equipment_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EquipmentDescriptor {
    equipment: EquipmentIdentifier,
    hbf_count: u32,
}

#[derive(Debug)]
pub enum CodecError {
    MissingPart { expected: &'static str },
    Descriptor(String),
    TrailingParts { count: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::MissingPart { expected } => {
                write!(f, "truncated STF multipart: missing {}", expected)
            }
            CodecError::Descriptor(msg) => write!(f, "bad STF descriptor: {}", msg),
            CodecError::TrailingParts { count } => {
                write!(f, "STF multipart has {} unexpected trailing parts", count)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Serialize an STF into interleaved multipart framing.
pub fn serialize_stf(stf: &SubTimeFrame) -> Multipart {
    let equipment = stf.equipment_identifiers();
    let mut parts = Vec::with_capacity(1 + equipment.len() + stf.hbf_count());

    let descriptor = StfDescriptor {
        header: *stf.header(),
        equipment_count: equipment.len() as u32,
    };
    parts.push(bincode::serialize(&descriptor).unwrap_or_default());

    for eq in equipment {
        let hbfs = stf.hbfs(&eq).unwrap_or(&[]);
        let eq_descriptor = EquipmentDescriptor {
            equipment: eq,
            hbf_count: hbfs.len() as u32,
        };
        parts.push(bincode::serialize(&eq_descriptor).unwrap_or_default());
        for hbf in hbfs {
            parts.push(hbf.clone());
        }
    }

    parts
}

/// Rebuild an STF from interleaved multipart framing.
pub fn deserialize_stf(parts: &Multipart) -> Result<SubTimeFrame, CodecError> {
    let mut iter = parts.iter();

    let descriptor_part = iter.next().ok_or(CodecError::MissingPart {
        expected: "STF descriptor",
    })?;
    let descriptor: StfDescriptor = bincode::deserialize(descriptor_part)
        .map_err(|e| CodecError::Descriptor(e.to_string()))?;

    let mut stf = SubTimeFrame::new(descriptor.header.id);
    stf.set_origin(descriptor.header.origin);

    for _ in 0..descriptor.equipment_count {
        let eq_part = iter.next().ok_or(CodecError::MissingPart {
            expected: "equipment descriptor",
        })?;
        let eq_descriptor: EquipmentDescriptor = bincode::deserialize(eq_part)
            .map_err(|e| CodecError::Descriptor(e.to_string()))?;

        let mut hbfs = Vec::with_capacity(eq_descriptor.hbf_count as usize);
        for _ in 0..eq_descriptor.hbf_count {
            let hbf = iter.next().ok_or(CodecError::MissingPart {
                expected: "HBF payload",
            })?;
            hbfs.push(hbf.clone());
        }
        stf.add_hbfs(eq_descriptor.equipment, hbfs);
    }

    let trailing = iter.count();
    if trailing > 0 {
        return Err(CodecError::TrailingParts { count: trailing });
    }

    Ok(stf)
}

/// Total bytes of a serialized STF multipart.
pub fn multipart_size(parts: &Multipart) -> u64 {
    parts.iter().map(|p| p.len() as u64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Detector;

    fn sample_stf() -> SubTimeFrame {
        let mut stf = SubTimeFrame::new(77);
        stf.add_hbfs(
            EquipmentIdentifier {
                origin: Detector::TPC.into(),
                subspec: 0x10,
            },
            vec![vec![1u8; 128], vec![2u8; 64]],
        );
        stf.add_hbfs(
            EquipmentIdentifier {
                origin: Detector::ITS.into(),
                subspec: 0x42,
            },
            vec![vec![3u8; 32]],
        );
        stf
    }

    #[test]
    fn test_serialize_deserialize_preserves_stf() {
        let stf = sample_stf();
        let parts = serialize_stf(&stf);
        let rebuilt = deserialize_stf(&parts).unwrap();

        assert_eq!(rebuilt.id(), stf.id());
        assert_eq!(rebuilt.origin(), StfOrigin::Readout);
        assert_eq!(rebuilt.data_size(), stf.data_size());
        assert_eq!(rebuilt.equipment_identifiers(), stf.equipment_identifiers());
        for eq in stf.equipment_identifiers() {
            assert_eq!(rebuilt.hbfs(&eq), stf.hbfs(&eq));
        }
    }

    #[test]
    fn test_empty_stf_roundtrip() {
        let stf = SubTimeFrame::empty(5);
        let parts = serialize_stf(&stf);
        assert_eq!(parts.len(), 1);
        let rebuilt = deserialize_stf(&parts).unwrap();
        assert_eq!(rebuilt.id(), 5);
        assert_eq!(rebuilt.origin(), StfOrigin::Null);
        assert!(rebuilt.is_empty());
    }

    #[test]
    fn test_truncated_multipart_rejected() {
        let stf = sample_stf();
        let mut parts = serialize_stf(&stf);
        parts.pop();
        assert!(matches!(
            deserialize_stf(&parts),
            Err(CodecError::MissingPart { .. })
        ));
    }

    #[test]
    fn test_trailing_parts_rejected() {
        let stf = sample_stf();
        let mut parts = serialize_stf(&stf);
        parts.push(vec![0xFF]);
        assert!(matches!(
            deserialize_stf(&parts),
            Err(CodecError::TrailingParts { count: 1 })
        ));
    }
}

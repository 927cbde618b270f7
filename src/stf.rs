//! SubTimeFrame data model.
//!
//! An STF collects the HBF payloads of one time-frame id from one
//! builder, keyed by equipment. Ownership is linear: once an STF is
//! handed to the next pipeline stage it is moved, never shared.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::Detector;

/// Where an STF came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StfOrigin {
    /// Assembled from live readout data.
    Readout,
    /// Synthesized placeholder for a missing time-frame id.
    Null,
    /// Replayed from file.
    File,
}

/// Identifies one piece of equipment: detector plus (masked) sub-spec.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EquipmentIdentifier {
    pub origin: DetectorOrigin,
    pub subspec: u32,
}

/// Serializable stand-in for `Detector` on the wire (3-char code).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DetectorOrigin(pub [u8; 3]);

impl From<Detector> for DetectorOrigin {
    fn from(det: Detector) -> Self {
        let code = det.as_str().as_bytes();
        DetectorOrigin([code[0], code[1], code[2]])
    }
}

impl std::fmt::Display for DetectorOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(std::str::from_utf8(&self.0).unwrap_or("???"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StfHeader {
    pub id: u64,
    pub origin: StfOrigin,
}

/// One SubTimeFrame: header plus per-equipment HBF payload runs.
///
/// HBF order within an equipment is exactly the order of insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTimeFrame {
    header: StfHeader,
    data: BTreeMap<EquipmentIdentifier, Vec<Vec<u8>>>,
}

impl SubTimeFrame {
    pub fn new(id: u64) -> Self {
        Self {
            header: StfHeader {
                id,
                origin: StfOrigin::Readout,
            },
            data: BTreeMap::new(),
        }
    }

    /// Empty placeholder STF for a gap in the id sequence.
    pub fn empty(id: u64) -> Self {
        Self {
            header: StfHeader {
                id,
                origin: StfOrigin::Null,
            },
            data: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.header.id
    }

    pub fn origin(&self) -> StfOrigin {
        self.header.origin
    }

    pub fn set_origin(&mut self, origin: StfOrigin) {
        self.header.origin = origin;
    }

    pub fn header(&self) -> &StfHeader {
        &self.header
    }

    /// Append a contiguous run of HBFs for one equipment.
    pub fn add_hbfs(&mut self, equipment: EquipmentIdentifier, hbfs: Vec<Vec<u8>>) {
        if hbfs.is_empty() {
            return;
        }
        self.data.entry(equipment).or_default().extend(hbfs);
    }

    /// Total payload bytes across all equipment.
    pub fn data_size(&self) -> u64 {
        self.data
            .values()
            .flat_map(|hbfs| hbfs.iter())
            .map(|hbf| hbf.len() as u64)
            .sum()
    }

    pub fn hbf_count(&self) -> usize {
        self.data.values().map(|hbfs| hbfs.len()).sum()
    }

    /// Equipment set, derived from the stored HBF runs.
    pub fn equipment_identifiers(&self) -> Vec<EquipmentIdentifier> {
        self.data.keys().copied().collect()
    }

    pub fn hbfs(&self, equipment: &EquipmentIdentifier) -> Option<&[Vec<u8>]> {
        self.data.get(equipment).map(|v| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One TimeFrame: the STFs of every source for a single id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeFrame {
    pub id: u64,
    pub stfs: Vec<SubTimeFrame>,
}

impl TimeFrame {
    pub fn new(id: u64, stfs: Vec<SubTimeFrame>) -> Self {
        Self { id, stfs }
    }

    pub fn data_size(&self) -> u64 {
        self.stfs.iter().map(|stf| stf.data_size()).sum()
    }

    pub fn stf_count(&self) -> usize {
        self.stfs.len()
    }
}

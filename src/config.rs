//! Per-process configuration.
//!
//! Options come from `--key value` arguments with environment fallbacks
//! (TFFLOW_ prefix, upper snake case); `.env` files are honored via
//! dotenv in the binaries. Configuration is parsed once at startup into
//! an immutable object passed by reference into every component.

use std::env;
use std::fmt;

/// Detectors recognized in the `detector` option and in RDH v6 source ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Detector {
    ACO,
    CPV,
    CTP,
    EMC,
    FT0,
    FV0,
    FDD,
    HMP,
    ITS,
    MCH,
    MFT,
    MID,
    PHS,
    TOF,
    TPC,
    TRD,
    ZDC,
    TST,
}

impl Detector {
    pub fn from_option(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ACO" => Some(Detector::ACO),
            "CPV" => Some(Detector::CPV),
            "CTP" => Some(Detector::CTP),
            "EMC" => Some(Detector::EMC),
            "FT0" => Some(Detector::FT0),
            "FV0" => Some(Detector::FV0),
            "FDD" => Some(Detector::FDD),
            "HMP" => Some(Detector::HMP),
            "ITS" => Some(Detector::ITS),
            "MCH" => Some(Detector::MCH),
            "MFT" => Some(Detector::MFT),
            "MID" => Some(Detector::MID),
            "PHS" => Some(Detector::PHS),
            "TOF" => Some(Detector::TOF),
            "TPC" => Some(Detector::TPC),
            "TRD" => Some(Detector::TRD),
            "ZDC" => Some(Detector::ZDC),
            "TST" => Some(Detector::TST),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Detector::ACO => "ACO",
            Detector::CPV => "CPV",
            Detector::CTP => "CTP",
            Detector::EMC => "EMC",
            Detector::FT0 => "FT0",
            Detector::FV0 => "FV0",
            Detector::FDD => "FDD",
            Detector::HMP => "HMP",
            Detector::ITS => "ITS",
            Detector::MCH => "MCH",
            Detector::MFT => "MFT",
            Detector::MID => "MID",
            Detector::PHS => "PHS",
            Detector::TOF => "TOF",
            Detector::TPC => "TPC",
            Detector::TRD => "TRD",
            Detector::ZDC => "ZDC",
            Detector::TST => "TST",
        }
    }

    /// Source id byte used by RDH v6 payloads.
    pub fn source_id(&self) -> u8 {
        match self {
            Detector::ACO => 1,
            Detector::CPV => 2,
            Detector::CTP => 3,
            Detector::EMC => 4,
            Detector::FT0 => 5,
            Detector::FV0 => 6,
            Detector::FDD => 7,
            Detector::HMP => 8,
            Detector::ITS => 9,
            Detector::MCH => 10,
            Detector::MFT => 11,
            Detector::MID => 12,
            Detector::PHS => 13,
            Detector::TOF => 14,
            Detector::TPC => 15,
            Detector::TRD => 16,
            Detector::ZDC => 17,
            Detector::TST => 18,
        }
    }

    pub fn from_source_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Detector::ACO),
            2 => Some(Detector::CPV),
            3 => Some(Detector::CTP),
            4 => Some(Detector::EMC),
            5 => Some(Detector::FT0),
            6 => Some(Detector::FV0),
            7 => Some(Detector::FDD),
            8 => Some(Detector::HMP),
            9 => Some(Detector::ITS),
            10 => Some(Detector::MCH),
            11 => Some(Detector::MFT),
            12 => Some(Detector::MID),
            13 => Some(Detector::PHS),
            14 => Some(Detector::TOF),
            15 => Some(Detector::TPC),
            16 => Some(Detector::TRD),
            17 => Some(Detector::ZDC),
            18 => Some(Detector::TST),
            _ => None,
        }
    }
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RdhVersion {
    V3,
    V4,
    V5,
    V6,
}

impl RdhVersion {
    pub fn from_option(s: &str) -> Option<Self> {
        match s {
            "3" => Some(RdhVersion::V3),
            "4" => Some(RdhVersion::V4),
            "5" => Some(RdhVersion::V5),
            "6" => Some(RdhVersion::V6),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            RdhVersion::V3 => 3,
            RdhVersion::V4 => 4,
            RdhVersion::V5 => 5,
            RdhVersion::V6 => 6,
        }
    }
}

/// Which RDH fields feed the sub-specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubSpecMode {
    CruLinkId,
    FeeId,
}

impl SubSpecMode {
    pub fn from_option(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cru-linkid" | "cru_linkid" => Some(SubSpecMode::CruLinkId),
            "feeid" => Some(SubSpecMode::FeeId),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubSpecMode::CruLinkId => "cru-linkid",
            SubSpecMode::FeeId => "feeid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanityCheckMode {
    Off,
    Print,
    Drop,
}

impl SanityCheckMode {
    pub fn from_option(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" => Some(SanityCheckMode::Off),
            "print" => Some(SanityCheckMode::Print),
            "drop" => Some(SanityCheckMode::Drop),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    MissingOption(String),
    InvalidValue(String),
    ChannelNotBound(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingOption(key) => write!(f, "Missing required option: {}", key),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
            ConfigError::ChannelNotBound(name) => write!(
                f,
                "Channel '{}' is not bound. Set TFFLOW_CHAN_{} to its address.",
                name,
                name.to_uppercase()
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Minimal `--key value` scanner over the process arguments with an
/// environment fallback (TFFLOW_KEY, dashes replaced by underscores).
pub fn option_value(args: &[String], key: &str) -> Option<String> {
    let flag = format!("--{}", key);
    if let Some(idx) = args.iter().position(|a| a == &flag) {
        if let Some(value) = args.get(idx + 1) {
            return Some(value.clone());
        }
    }
    let env_key = format!("TFFLOW_{}", key.to_uppercase().replace('-', "_"));
    env::var(env_key).ok()
}

fn option_bool(args: &[String], key: &str) -> bool {
    match option_value(args, key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => args.iter().any(|a| a == &format!("--{}", key)),
    }
}

/// Resolve a channel name to a socket address via TFFLOW_CHAN_<NAME>.
pub fn resolve_channel(name: &str) -> Result<String, ConfigError> {
    let key = format!("TFFLOW_CHAN_{}", name.to_uppercase().replace('-', "_"));
    env::var(key).map_err(|_| ConfigError::ChannelNotBound(name.to_string()))
}

/// Silent floor applied to an enabled pipeline cap.
pub const MIN_PIPELINE_CAP: i64 = 4;

/// Builder process configuration.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub partition_id: String,
    pub process_id: String,
    pub input_channel_name: String,
    pub output_channel_name: String,
    pub dpl_channel_name: String,
    pub standalone: bool,
    /// <= 0 disables the cap; otherwise floored to `MIN_PIPELINE_CAP`.
    pub max_stfs_in_pipeline: i64,
    /// 0 means unlimited.
    pub max_built_stfs: u64,
    pub detector: Option<Detector>,
    pub rdh_version: RdhVersion,
    pub subspec_mode: SubSpecMode,
    pub rdh_sanity_check: SanityCheckMode,
    pub filter_empty_trigger: bool,
    /// Mask applied to sub-specifications in FEE-id mode.
    pub fee_id_mask: u32,
    pub scheduler_endpoint: String,
    pub discovery_db: String,
}

impl BuilderConfig {
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let rdh_version_str = option_value(args, "rdh-version")
            .ok_or_else(|| ConfigError::MissingOption("rdh-version".to_string()))?;
        let rdh_version = RdhVersion::from_option(&rdh_version_str).ok_or_else(|| {
            ConfigError::InvalidValue(format!(
                "rdh-version must be one of 3, 4, 5, 6, got '{}'",
                rdh_version_str
            ))
        })?;

        let detector = match option_value(args, "detector") {
            Some(s) if !s.is_empty() => Some(Detector::from_option(&s).ok_or_else(|| {
                ConfigError::InvalidValue(format!("unknown detector '{}'", s))
            })?),
            _ => None,
        };

        // detector is mandatory when the RDH cannot carry the source id
        if rdh_version < RdhVersion::V6 && detector.is_none() {
            return Err(ConfigError::MissingOption(
                "detector (required for rdh-version < 6)".to_string(),
            ));
        }

        let subspec_mode = match option_value(args, "subspec-mode") {
            Some(s) => SubSpecMode::from_option(&s).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "subspec-mode must be 'cru-linkid' or 'feeid', got '{}'",
                    s
                ))
            })?,
            None => SubSpecMode::FeeId,
        };

        let rdh_sanity_check = match option_value(args, "rdh-sanity-check") {
            Some(s) => SanityCheckMode::from_option(&s).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "rdh-sanity-check must be 'off', 'print' or 'drop', got '{}'",
                    s
                ))
            })?,
            None => SanityCheckMode::Off,
        };

        let mut max_stfs_in_pipeline = option_value(args, "max-buffered-stfs")
            .map(|v| {
                v.parse::<i64>().map_err(|_| {
                    ConfigError::InvalidValue(format!("max-buffered-stfs: '{}'", v))
                })
            })
            .transpose()?
            .unwrap_or(0);

        if max_stfs_in_pipeline > 0 && max_stfs_in_pipeline < MIN_PIPELINE_CAP {
            log::warn!(
                "Configuration: max buffered SubTimeFrames limit increased to {}",
                MIN_PIPELINE_CAP
            );
            max_stfs_in_pipeline = MIN_PIPELINE_CAP;
        }

        let max_built_stfs = option_value(args, "max-built-stfs")
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| ConfigError::InvalidValue(format!("max-built-stfs: '{}'", v)))
            })
            .transpose()?
            .unwrap_or(0);

        Ok(Self {
            partition_id: option_value(args, "partition-id").unwrap_or_else(|| "default".to_string()),
            process_id: option_value(args, "process-id").unwrap_or_else(|| "builder-0".to_string()),
            input_channel_name: option_value(args, "input-channel-name")
                .unwrap_or_else(|| "readout".to_string()),
            output_channel_name: option_value(args, "output-channel-name")
                .unwrap_or_else(|| "stfsender".to_string()),
            dpl_channel_name: option_value(args, "dpl-channel-name").unwrap_or_default(),
            standalone: option_bool(args, "stand-alone"),
            max_stfs_in_pipeline,
            max_built_stfs,
            detector,
            rdh_version,
            subspec_mode,
            rdh_sanity_check,
            filter_empty_trigger: option_bool(args, "filter-empty-trigger"),
            fee_id_mask: fee_id_mask_from_env(),
            scheduler_endpoint: option_value(args, "scheduler-endpoint").unwrap_or_default(),
            discovery_db: option_value(args, "discovery-db")
                .unwrap_or_else(|| "tfflow-discovery.db".to_string()),
        })
    }

    pub fn pipeline_limited(&self) -> bool {
        self.max_stfs_in_pipeline > 0
    }

    pub fn dpl_enabled(&self) -> bool {
        !self.dpl_channel_name.is_empty() && !self.standalone
    }
}

/// Scheduler process configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub partition_id: String,
    pub listen_endpoint: String,
    pub discovery_db: String,
}

impl SchedulerConfig {
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        Ok(Self {
            partition_id: option_value(args, "partition-id").unwrap_or_else(|| "default".to_string()),
            listen_endpoint: option_value(args, "listen-endpoint")
                .ok_or_else(|| ConfigError::MissingOption("listen-endpoint".to_string()))?,
            discovery_db: option_value(args, "discovery-db")
                .unwrap_or_else(|| "tfflow-discovery.db".to_string()),
        })
    }
}

/// Aggregation node configuration.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub partition_id: String,
    pub process_id: String,
    pub scheduler_endpoint: String,
    /// Total TF buffer capacity in bytes.
    pub buffer_size: u64,
    pub discovery_db: String,
}

impl AggregatorConfig {
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let buffer_size = option_value(args, "buffer-size")
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| ConfigError::InvalidValue(format!("buffer-size: '{}'", v)))
            })
            .transpose()?
            .unwrap_or(32 * (1u64 << 30));

        Ok(Self {
            partition_id: option_value(args, "partition-id").unwrap_or_else(|| "default".to_string()),
            process_id: option_value(args, "process-id")
                .unwrap_or_else(|| "aggregator-0".to_string()),
            scheduler_endpoint: option_value(args, "scheduler-endpoint")
                .ok_or_else(|| ConfigError::MissingOption("scheduler-endpoint".to_string()))?,
            buffer_size,
            discovery_db: option_value(args, "discovery-db")
                .unwrap_or_else(|| "tfflow-discovery.db".to_string()),
        })
    }
}

fn fee_id_mask_from_env() -> u32 {
    match env::var("DATADIST_FEE_MASK") {
        Ok(raw) => match u32::from_str_radix(raw.trim_start_matches("0x"), 16) {
            Ok(mask) => mask,
            Err(_) => {
                log::error!("Cannot convert {} for the FeeID mask.", raw);
                u32::MAX
            }
        },
        Err(_) => u32::MAX,
    }
}

/// Fatal misconfiguration: log, give the logger a second to flush, exit -1.
pub fn fatal_config_exit(message: &str) -> ! {
    log::error!("❌ {}", message);
    std::thread::sleep(std::time::Duration::from_secs(1));
    std::process::exit(-1);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_detector_parse() {
        assert_eq!(Detector::from_option("tpc"), Some(Detector::TPC));
        assert_eq!(Detector::from_option("ITS"), Some(Detector::ITS));
        assert_eq!(Detector::from_option("XYZ"), None);
    }

    #[test]
    fn test_detector_source_id_roundtrip() {
        for det in [
            Detector::ACO,
            Detector::TPC,
            Detector::ZDC,
            Detector::TST,
        ] {
            assert_eq!(Detector::from_source_id(det.source_id()), Some(det));
        }
        assert_eq!(Detector::from_source_id(0), None);
        assert_eq!(Detector::from_source_id(200), None);
    }

    #[test]
    fn test_builder_requires_detector_below_v6() {
        let err = BuilderConfig::from_args(&args(&["--rdh-version", "4"])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingOption(_)));

        // v6 carries the source id, detector optional
        let cfg = BuilderConfig::from_args(&args(&["--rdh-version", "6"])).unwrap();
        assert_eq!(cfg.detector, None);
        assert_eq!(cfg.rdh_version, RdhVersion::V6);
    }

    #[test]
    fn test_pipeline_cap_floored_to_four() {
        let cfg = BuilderConfig::from_args(&args(&[
            "--rdh-version",
            "6",
            "--max-buffered-stfs",
            "1",
        ]))
        .unwrap();
        assert_eq!(cfg.max_stfs_in_pipeline, 4);
        assert!(cfg.pipeline_limited());
    }

    #[test]
    fn test_pipeline_cap_disabled() {
        let cfg = BuilderConfig::from_args(&args(&[
            "--rdh-version",
            "6",
            "--max-buffered-stfs",
            "-1",
        ]))
        .unwrap();
        assert!(!cfg.pipeline_limited());
    }

    #[test]
    fn test_subspec_mode_defaults_to_feeid() {
        let cfg = BuilderConfig::from_args(&args(&["--rdh-version", "6"])).unwrap();
        assert_eq!(cfg.subspec_mode, SubSpecMode::FeeId);
    }

    #[test]
    fn test_dpl_enabled_requires_channel_and_not_standalone() {
        let cfg = BuilderConfig::from_args(&args(&[
            "--rdh-version",
            "6",
            "--dpl-channel-name",
            "dpl",
        ]))
        .unwrap();
        assert!(cfg.dpl_enabled());

        let cfg = BuilderConfig::from_args(&args(&[
            "--rdh-version",
            "6",
            "--dpl-channel-name",
            "dpl",
            "--stand-alone",
        ]))
        .unwrap();
        assert!(!cfg.dpl_enabled());
    }
}

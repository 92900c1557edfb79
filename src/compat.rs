//! Version gate deciding which resume-token features a session may use.
//!
//! Feature availability is the intersection of what the running binary can do
//! and what the negotiated feature compatibility version (FCV) allows. Neither
//! signal alone is sufficient.

use crate::token::TokenFormatVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Release line of the running binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryVersion {
    /// 4.0 before post-batch resume tokens were backported.
    Release40,
    /// 4.0 with the high-water-mark backport.
    Release40Backport,
    Release42,
}

impl BinaryVersion {
    /// Highest capability level the binary can exercise.
    pub fn capability_level(self) -> CapabilityLevel {
        match self {
            BinaryVersion::Release40 => CapabilityLevel::Legacy,
            BinaryVersion::Release40Backport => CapabilityLevel::HighWaterMark,
            BinaryVersion::Release42 => CapabilityLevel::KeyStringV1,
        }
    }

    /// Newest token format the binary can parse, independent of FCV.
    pub fn max_decodable_version(self) -> TokenFormatVersion {
        match self {
            BinaryVersion::Release40 | BinaryVersion::Release40Backport => TokenFormatVersion::V0,
            BinaryVersion::Release42 => TokenFormatVersion::V1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BinaryVersion::Release40 => "4.0",
            BinaryVersion::Release40Backport => "4.0-backport",
            BinaryVersion::Release42 => "4.2",
        }
    }
}

impl fmt::Display for BinaryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster-wide feature compatibility version, including transitional states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureCompatibilityVersion {
    V36,
    V40,
    UpgradingTo42,
    DowngradingTo40,
    V42,
}

impl FeatureCompatibilityVersion {
    /// Highest capability level the FCV permits.
    ///
    /// Transitional states only grant what the lower of their endpoints does.
    pub fn capability_level(self) -> CapabilityLevel {
        match self {
            FeatureCompatibilityVersion::V36 => CapabilityLevel::Legacy,
            FeatureCompatibilityVersion::V40
            | FeatureCompatibilityVersion::UpgradingTo42
            | FeatureCompatibilityVersion::DowngradingTo40 => CapabilityLevel::HighWaterMark,
            FeatureCompatibilityVersion::V42 => CapabilityLevel::KeyStringV1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureCompatibilityVersion::V36 => "3.6",
            FeatureCompatibilityVersion::V40 => "4.0",
            FeatureCompatibilityVersion::UpgradingTo42 => "upgrading to 4.2",
            FeatureCompatibilityVersion::DowngradingTo40 => "downgrading to 4.0",
            FeatureCompatibilityVersion::V42 => "4.2",
        }
    }
}

impl fmt::Display for FeatureCompatibilityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a version string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature compatibility version {0:?}")]
pub struct UnknownVersion(pub String);

impl FromStr for FeatureCompatibilityVersion {
    type Err = UnknownVersion;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "3.6" => Ok(FeatureCompatibilityVersion::V36),
            "4.0" => Ok(FeatureCompatibilityVersion::V40),
            "upgrading to 4.2" => Ok(FeatureCompatibilityVersion::UpgradingTo42),
            "downgrading to 4.0" => Ok(FeatureCompatibilityVersion::DowngradingTo40),
            "4.2" => Ok(FeatureCompatibilityVersion::V42),
            other => Err(UnknownVersion(other.to_string())),
        }
    }
}

/// Ordered resume-token capability levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CapabilityLevel {
    /// No post-batch resume tokens, no high-water marks.
    Legacy,
    /// Post-batch resume tokens and high-water marks in the `V0` layout.
    HighWaterMark,
    /// Same features, tokens emitted in the `V1` layout.
    KeyStringV1,
}

impl CapabilityLevel {
    /// Intersection of two independently negotiated levels.
    pub fn intersect(self, other: CapabilityLevel) -> CapabilityLevel {
        self.min(other)
    }

    pub fn supports_post_batch_tokens(self) -> bool {
        self >= CapabilityLevel::HighWaterMark
    }

    pub fn supports_high_water_marks(self) -> bool {
        self >= CapabilityLevel::HighWaterMark
    }

    /// Token format emitted at this level.
    pub fn token_format_version(self) -> TokenFormatVersion {
        match self {
            CapabilityLevel::KeyStringV1 => TokenFormatVersion::V1,
            CapabilityLevel::Legacy | CapabilityLevel::HighWaterMark => TokenFormatVersion::V0,
        }
    }
}

/// Features available to one session, fixed once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CapabilitySet {
    pub supports_pbrt: bool,
    pub supports_hwm: bool,
    /// Format the session emits.
    pub token_format_version: TokenFormatVersion,
    /// Newest format the running binary can parse.
    pub max_decodable_version: TokenFormatVersion,
}

impl CapabilitySet {
    /// Capabilities for an effective level on a given binary.
    pub fn from_level(level: CapabilityLevel, binary: BinaryVersion) -> Self {
        Self {
            supports_pbrt: level.supports_post_batch_tokens(),
            supports_hwm: level.supports_high_water_marks(),
            token_format_version: level.token_format_version(),
            max_decodable_version: binary.max_decodable_version(),
        }
    }
}

/// Computes the capabilities negotiated for `binary` under `fcv`.
///
/// Pure; callers recompute it at every session establishment because FCV may
/// move during a rolling upgrade.
pub fn capabilities_for(binary: BinaryVersion, fcv: FeatureCompatibilityVersion) -> CapabilitySet {
    let level = binary
        .capability_level()
        .intersect(fcv.capability_level());
    CapabilitySet::from_level(level, binary)
}

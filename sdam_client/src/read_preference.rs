use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::SdamError;

/// A tag set matches a server when every key/value pair is among the server's tags.
/// The empty tag set matches every server.
pub type TagSet = HashMap<String, String>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreferenceMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl FromStr for ReadPreferenceMode {
    type Err = SdamError;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode {
            "primary" => Ok(Self::Primary),
            "primaryPreferred" => Ok(Self::PrimaryPreferred),
            "secondary" => Ok(Self::Secondary),
            "secondaryPreferred" => Ok(Self::SecondaryPreferred),
            "nearest" => Ok(Self::Nearest),
            other => Err(SdamError::InvalidReadPreference(format!(
                "unknown read preference mode `{}`",
                other
            ))),
        }
    }
}

impl fmt::Display for ReadPreferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Primary => "primary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::Secondary => "secondary",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        };
        f.write_str(name)
    }
}

/// Which servers a read may go to, and how stale or far away they may be.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadPreference {
    pub(crate) mode: ReadPreferenceMode,
    pub(crate) tag_sets: Vec<TagSet>,
    pub(crate) max_staleness: Option<Duration>,
    pub(crate) min_wire_version: Option<i32>,
}

impl ReadPreference {
    pub fn new(mode: ReadPreferenceMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadPreferenceMode::Primary)
    }

    pub fn primary_preferred() -> Self {
        Self::new(ReadPreferenceMode::PrimaryPreferred)
    }

    pub fn secondary() -> Self {
        Self::new(ReadPreferenceMode::Secondary)
    }

    pub fn secondary_preferred() -> Self {
        Self::new(ReadPreferenceMode::SecondaryPreferred)
    }

    pub fn nearest() -> Self {
        Self::new(ReadPreferenceMode::Nearest)
    }

    /// Parses a mode name and validates the combination with the options.
    pub fn from_mode(
        mode: &str,
        tag_sets: Vec<TagSet>,
        max_staleness: Option<Duration>,
    ) -> Result<Self, SdamError> {
        let read_preference = Self {
            mode: mode.parse()?,
            tag_sets,
            max_staleness,
            min_wire_version: None,
        };
        read_preference.validate()?;
        Ok(read_preference)
    }

    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
        self.tag_sets = tag_sets;
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = Some(max_staleness);
        self
    }

    pub fn with_min_wire_version(mut self, min_wire_version: i32) -> Self {
        self.min_wire_version = Some(min_wire_version);
        self
    }

    pub fn mode(&self) -> ReadPreferenceMode {
        self.mode
    }

    pub fn tag_sets(&self) -> &[TagSet] {
        &self.tag_sets
    }

    pub fn max_staleness(&self) -> Option<Duration> {
        self.max_staleness
    }

    pub fn min_wire_version(&self) -> Option<i32> {
        self.min_wire_version
    }

    /// Primary reads cannot be narrowed by tags or staleness.
    pub fn validate(&self) -> Result<(), SdamError> {
        if self.mode == ReadPreferenceMode::Primary {
            let has_tags = self.tag_sets.iter().any(|t| !t.is_empty());
            if has_tags {
                return Err(SdamError::InvalidReadPreference(
                    "primary read preference cannot be combined with tags".to_string(),
                ));
            }
            if self.max_staleness.is_some() {
                return Err(SdamError::InvalidReadPreference(
                    "primary read preference cannot be combined with maxStalenessSeconds"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

use std::{fmt, str::FromStr};

use super::DomainError;

/// Trust level of the provider feed a record came from.
///
/// The variants carry no intrinsic order: precedence between tiers is a
/// deployment decision and lives in the reconcile service's tier priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SourceTier {
    /// Manually or provider-issued corrections of already published values.
    Correction,
    /// Finalized historical archive data.
    Archive,
    /// Model output for hours that may not have happened yet.
    Forecast,
}

impl SourceTier {
    pub const ALL: [SourceTier; 3] = [SourceTier::Correction, SourceTier::Archive, SourceTier::Forecast];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::Correction => "correction",
            SourceTier::Archive => "archive",
            SourceTier::Forecast => "forecast",
        }
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "correction" => Ok(SourceTier::Correction),
            "archive" | "history" | "hist" => Ok(SourceTier::Archive),
            "forecast" => Ok(SourceTier::Forecast),
            other => Err(DomainError::UnknownTier(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tier_names_and_aliases() {
        assert_eq!("Archive".parse::<SourceTier>(), Ok(SourceTier::Archive));
        assert_eq!("hist".parse::<SourceTier>(), Ok(SourceTier::Archive));
        assert_eq!(" forecast ".parse::<SourceTier>(), Ok(SourceTier::Forecast));
        assert!(matches!(
            "nowcast".parse::<SourceTier>(),
            Err(DomainError::UnknownTier(_))
        ));
    }

    #[test]
    fn as_str_round_trips_every_tier() {
        for tier in SourceTier::ALL {
            assert_eq!(tier.as_str().parse::<SourceTier>(), Ok(tier));
        }
    }
}

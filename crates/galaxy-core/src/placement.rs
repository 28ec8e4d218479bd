//! Placement constraints.
//!
//! A segment may be pinned to a geographic region; node selection and the
//! repair checker both consult the same closed set of rules. The EU and EEA
//! tables are explicit so membership changes are a code change, not a data
//! migration.

use serde::{Deserialize, Serialize};

/// ISO 3166-1 alpha-2 codes of EU member states.
const EU_COUNTRIES: &[&str] = &[
    "AT", "BE", "BG", "CY", "CZ", "DE", "DK", "EE", "ES", "FI", "FR", "GR", "HR", "HU", "IE",
    "IT", "LT", "LU", "LV", "MT", "NL", "PL", "PT", "RO", "SE", "SI", "SK",
];

/// EEA members that are not in the EU.
const EEA_NON_EU_COUNTRIES: &[&str] = &["IS", "LI", "NO"];

/// Region constraint on which nodes may hold a segment's pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u16)]
pub enum PlacementConstraint {
    #[default]
    EveryCountry = 0,
    Eu = 1,
    Eea = 2,
    Us = 3,
    De = 4,
}

impl PlacementConstraint {
    /// Whether a node in the given country satisfies this constraint.
    /// Unknown or empty country codes only satisfy `EveryCountry`.
    pub fn allows(&self, country_code: &str) -> bool {
        if *self == PlacementConstraint::EveryCountry {
            return true;
        }
        let code = country_code.to_ascii_uppercase();
        match self {
            PlacementConstraint::EveryCountry => true,
            PlacementConstraint::Eu => EU_COUNTRIES.contains(&code.as_str()),
            PlacementConstraint::Eea => {
                EU_COUNTRIES.contains(&code.as_str())
                    || EEA_NON_EU_COUNTRIES.contains(&code.as_str())
            }
            PlacementConstraint::Us => code == "US",
            PlacementConstraint::De => code == "DE",
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::EveryCountry),
            1 => Some(Self::Eu),
            2 => Some(Self::Eea),
            3 => Some(Self::Us),
            4 => Some(Self::De),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}

//! Core type definitions with validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// The value contains a line break, which the line-oriented transfer format cannot carry.
    #[error("{field} cannot contain line breaks")]
    LineBreak { field: &'static str },

    /// Step must be at least one.
    #[error("step must be at least 1, got {value}")]
    InvalidStep { value: u32 },

    /// Color strings must be `#RRGGBB` or `#AARRGGBB`.
    #[error("invalid color: {value}")]
    InvalidColor { value: String },

    /// Invalid counter kind value.
    #[error("invalid counter kind: {value}")]
    InvalidKind { value: String },
}

/// How a counter derives its displayed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterKind {
    /// Value comes from the counter's own entries.
    #[default]
    Standard,
    /// Value is computed from a formula over other counters.
    Dynamic,
}

impl CounterKind {
    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CounterKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "dynamic" => Ok(Self::Dynamic),
            _ => Err(ValidationError::InvalidKind {
                value: s.to_string(),
            }),
        }
    }
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                if id.contains(['\n', '\r']) {
                    return Err(ValidationError::LineBreak { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated counter name.
    ///
    /// The name is the primary key for metadata, entries and cached summaries.
    /// It may contain commas (the transfer codec copes with that) but never
    /// line breaks.
    CounterName, "counter name"
);

/// An ARGB color packed into a `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterColor(u32);

impl CounterColor {
    /// The color new counters get when none is chosen.
    pub const DEFAULT: Self = Self(0xFF21_96F3);

    #[must_use]
    pub const fn from_argb(argb: u32) -> Self {
        Self(argb)
    }

    #[must_use]
    pub const fn argb(self) -> u32 {
        self.0
    }
}

impl Default for CounterColor {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for CounterColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:08X}", self.0)
    }
}

impl std::str::FromStr for CounterColor {
    type Err = ValidationError;

    /// Parses `#RRGGBB` (opaque) or `#AARRGGBB`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidColor {
            value: s.to_string(),
        };
        let hex = s.strip_prefix('#').ok_or_else(invalid)?;
        let value = u32::from_str_radix(hex, 16).map_err(|_| invalid())?;
        match hex.len() {
            6 => Ok(Self(0xFF00_0000 | value)),
            8 => Ok(Self(value)),
            _ => Err(invalid()),
        }
    }
}

impl Serialize for CounterColor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CounterColor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_name_rejects_empty() {
        assert!(CounterName::new("").is_err());
        assert!(CounterName::new("water").is_ok());
    }

    #[test]
    fn counter_name_allows_commas_but_not_newlines() {
        assert!(CounterName::new("a,b").is_ok());
        assert_eq!(
            CounterName::new("a\nb").unwrap_err(),
            ValidationError::LineBreak {
                field: "counter name"
            }
        );
        assert!(CounterName::new("a\r").is_err());
    }

    #[test]
    fn counter_name_serde_rejects_empty() {
        let result: Result<CounterName, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn counter_kind_from_str() {
        assert_eq!(
            "standard".parse::<CounterKind>().unwrap(),
            CounterKind::Standard
        );
        assert_eq!(
            "DYNAMIC".parse::<CounterKind>().unwrap(),
            CounterKind::Dynamic
        );
        assert!("formula".parse::<CounterKind>().is_err());
    }

    #[test]
    fn color_parses_short_and_long_forms() {
        let opaque: CounterColor = "#2196F3".parse().unwrap();
        assert_eq!(opaque, CounterColor::DEFAULT);
        let translucent: CounterColor = "#802196F3".parse().unwrap();
        assert_eq!(translucent.argb(), 0x8021_96F3);
        assert!("2196F3".parse::<CounterColor>().is_err());
        assert!("#12345".parse::<CounterColor>().is_err());
        assert!("#GGGGGG".parse::<CounterColor>().is_err());
    }

    #[test]
    fn color_serializes_as_hex_string() {
        let json = serde_json::to_string(&CounterColor::DEFAULT).unwrap();
        assert_eq!(json, "\"#FF2196F3\"");
        let parsed: CounterColor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, CounterColor::DEFAULT);
    }
}

use crate::error::{Error, Result};
use std::borrow::Borrow;
use std::fmt;

const MAX_NAME_LEN: usize = 128;

fn validate_simple_name(value: &str, kind: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId(format!("{kind} must not be empty")));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(Error::InvalidId(format!(
            "{kind} length must be <= {MAX_NAME_LEN}"
        )));
    }
    if !trimmed.chars().all(is_allowed_name_char) {
        return Err(Error::InvalidId(format!(
            "{kind} contains invalid characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn is_allowed_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, ':' | '_' | '-' | '.' | '@')
}

macro_rules! define_name_type {
    ($(#[$doc:meta])* $name:ident, $kind:expr, $normalize:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
        #[derive(serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a validated name.
            pub fn new(value: impl AsRef<str>) -> Result<Self> {
                let name = validate_simple_name(value.as_ref(), $kind)?;
                Ok(Self(if $normalize { name.to_ascii_lowercase() } else { name }))
            }

            /// Creates a name from a trusted string without validation.
            pub fn from_string(value: String) -> Self {
                Self(value)
            }

            /// Returns the underlying string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }
    };
}

define_name_type!(
    /// Stored type discriminator naming a record's concrete variant.
    ///
    /// Discriminators are lowercased so registry lookups are case-insensitive.
    Discriminator,
    "type discriminator",
    true
);
define_name_type!(
    /// Opaque link between a login security node and the login subsystem.
    LoginId,
    "login id",
    false
);

/// Store-assigned row identifier. Always positive.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct RecordId(i64);

impl RecordId {
    /// Creates a validated record id.
    pub fn new(value: i64) -> Result<Self> {
        if value <= 0 {
            return Err(Error::InvalidId(format!(
                "record id must be positive, got {value}"
            )));
        }
        Ok(Self(value))
    }

    /// Returns the raw integer.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for RecordId {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RecordId> for i64 {
    fn from(value: RecordId) -> Self {
        value.0
    }
}

/// Value stored in a record's read or write permission column.
///
/// Positive values name a security node. Zero and the negative values are
/// reserved markers, see the associated constants.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SecurityId(i64);

impl SecurityId {
    /// Open to every principal (read) or every authenticated principal (write).
    pub const OPEN: Self = Self(0);
    /// Readable by any authenticated principal. Only meaningful for reads.
    pub const AUTHENTICATED: Self = Self(1);
    /// Only the record's own id may write. Used by security nodes.
    pub const SELF_WRITE: Self = Self(-1);
    /// Lock marker. Suspends normal read rules in favour of write access.
    pub const LOCKED: Self = Self(-2);

    /// Wraps a raw column value.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw integer.
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns true for values that name an actual security node.
    pub const fn is_token(self) -> bool {
        self.0 > 0
    }

    /// Returns true for the open marker.
    pub const fn is_open(self) -> bool {
        self.0 == Self::OPEN.0
    }
}

impl fmt::Display for SecurityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<RecordId> for SecurityId {
    fn from(value: RecordId) -> Self {
        Self(value.0)
    }
}

/// Id of each table's baseline row. It doubles as the insert template and is
/// never returned by fetches.
pub const TEMPLATE_ROW_ID: i64 = 1;

/// Superuser id used unless the engine is configured otherwise.
pub const DEFAULT_GOD_ID: RecordId = RecordId(2);

/// Logical tables managed by the record store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// General data records.
    Records,
    /// Logins and permission tokens.
    SecurityNodes,
}

impl Table {
    /// Returns the SQL table name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Records => "records",
            Self::SecurityNodes => "security_nodes",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminator_should_normalize_case() {
        let discriminator = Discriminator::try_from(" Collection ").expect("discriminator");
        assert_eq!(discriminator.as_str(), "collection");
    }

    #[test]
    fn discriminator_should_reject_sql_characters() {
        let err = Discriminator::try_from("place' OR 1=1").expect_err("must reject");
        assert!(err.to_string().contains("type discriminator"));
    }

    #[test]
    fn login_id_should_keep_case() {
        let login = LoginId::try_from("Admin@example.org").expect("login id");
        assert_eq!(login.as_str(), "Admin@example.org");
    }

    #[test]
    fn record_id_should_reject_non_positive_values() {
        assert!(RecordId::new(0).is_err());
        assert!(RecordId::new(-3).is_err());
        assert_eq!(RecordId::new(42).expect("record id").get(), 42);
    }

    #[test]
    fn security_id_markers_should_not_be_tokens() {
        assert!(!SecurityId::OPEN.is_token());
        assert!(!SecurityId::SELF_WRITE.is_token());
        assert!(!SecurityId::LOCKED.is_token());
        assert!(SecurityId::new(7).is_token());
    }
}

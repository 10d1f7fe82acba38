use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use uuid::Uuid;

/// Login / registration body. No Debug derive: the password must not be
/// printable, even accidentally.
#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn pwhash(&self) -> String {
        sha256::digest(self.password.as_str())
    }

    /// Compares our digest against the stored one without bailing at the
    /// first differing byte.
    pub fn matches(&self, stored: &str) -> bool {
        constant_time_eq(self.pwhash().as_bytes(), stored.as_bytes())
    }

    pub fn is_wellformed(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for SessionId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Uuid::try_parse(s).map(Self).map_err(|_| ())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

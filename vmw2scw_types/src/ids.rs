//! Short identifiers minted for batches and individual VM migrations.

use std::fmt;

/// An opaque, process-wide-unique identifier minted at job creation.
///
/// The original Python implementation used a `uuid4()` hex prefix; this
/// port mints the same number of random bits via `getrandom` and hex-encodes
/// them, avoiding a dependency on a full UUID crate for what is, in both
/// implementations, just a short collision-resistant tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MigrationId(String);

impl MigrationId {
    /// Mint a new migration id of the form `m-<16 hex chars>`.
    pub fn generate() -> Self {
        Self(format!("m-{}", random_hex(8)))
    }

    /// Wrap an existing id, e.g. one loaded back from a state document.
    pub fn from_existing(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A batch identifier, minted the same way as [`MigrationId`] but kept as a
/// distinct type so the two can never be swapped at a call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn generate() -> Self {
        Self(format!("b-{}", random_hex(8)))
    }

    pub fn from_existing(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    // Infallible on every platform we target; a failure here means the OS
    // RNG is unavailable, which is unrecoverable anyway.
    getrandom::fill(&mut buf).expect("platform RNG unavailable");
    hex::encode(buf)
}

//! Record types persisted through the datastore.
//!
//! Both record kinds serialize as JSON objects whose byte fields are
//! standard base64 strings:
//!
//! ```text
//! user: {"Reg": "<base64>", "Key": "<base64>"}
//! site: {"Cert": "<base64>", "Key": "<base64>", "Meta": "<base64>"}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Entity kind discriminator partitioning user and site documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// ACME account registration records, keyed by email.
    User,
    /// Certificate bundles, keyed by domain.
    Site,
}

impl EntityKind {
    /// Kind name used in the backing document store.
    pub fn store_kind(self) -> &'static str {
        match self {
            Self::User => "caddytlsUserRecord",
            Self::Site => "caddytlsSiteRecord",
        }
    }

    /// Path segment used when building logical keys.
    pub fn key_segment(self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Site => "sites",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Site => f.write_str("site"),
        }
    }
}

/// ACME account data for one email address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    /// Opaque registration resource.
    #[serde(rename = "Reg", with = "base64_bytes")]
    pub registration: Vec<u8>,
    /// Opaque account private key.
    #[serde(rename = "Key", with = "base64_bytes")]
    pub key: Vec<u8>,
}

/// Certificate bundle for one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteData {
    /// PEM certificate chain.
    #[serde(rename = "Cert", with = "base64_bytes")]
    pub cert: Vec<u8>,
    /// PEM private key.
    #[serde(rename = "Key", with = "base64_bytes")]
    pub key: Vec<u8>,
    /// Opaque certificate metadata.
    #[serde(rename = "Meta", with = "base64_bytes")]
    pub meta: Vec<u8>,
}

/// Serde adapter for byte fields as standard base64 strings.
///
/// `null` deserializes to an empty buffer.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

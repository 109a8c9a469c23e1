//! Configuration for the datastore-backed ACME storage.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;
use zeroize::Zeroizing;

use crate::backend::DEFAULT_ENDPOINT;
use crate::codec::KEY_LEN;
use crate::error::{StorageError, StorageResult};

/// Default key prefix in the datastore.
pub const DEFAULT_PREFIX: &str = "caddytls";

/// Default CA directory.
pub const DEFAULT_CA_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

pub const ENV_PROJECT_ID: &str = "SENTINEL_ACME_DATASTORE_PROJECT_ID";
pub const ENV_PREFIX: &str = "SENTINEL_ACME_DATASTORE_PREFIX";
/// Base64 of 32 random bytes, e.g. from `openssl rand -base64 32`.
pub const ENV_AES_KEY: &str = "SENTINEL_ACME_DATASTORE_AES_KEY";
pub const ENV_ENDPOINT: &str = "SENTINEL_ACME_DATASTORE_ENDPOINT";
pub const ENV_ACCESS_TOKEN: &str = "SENTINEL_ACME_DATASTORE_ACCESS_TOKEN";
pub const ENV_CA_URL: &str = "SENTINEL_ACME_DATASTORE_CA_URL";

/// Set by the Datastore emulator tooling (`host:port`).
pub const ENV_EMULATOR_HOST: &str = "DATASTORE_EMULATOR_HOST";

/// Datastore storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreConfig {
    /// Cloud Datastore project id.
    #[serde(default)]
    pub project_id: String,

    /// Prefix for every logical key.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Base64-encoded AES-256 key. Unset or empty stores plaintext records.
    #[serde(default)]
    pub aes_key: Option<String>,

    /// REST endpoint override.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// OAuth2 bearer token for the Datastore API.
    #[serde(default)]
    pub access_token: Option<String>,

    /// ACME directory URL; its host namespaces stored records.
    #[serde(default = "default_ca_url")]
    pub ca_url: String,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            prefix: default_prefix(),
            aes_key: None,
            endpoint: None,
            access_token: None,
            ca_url: default_ca_url(),
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_ca_url() -> String {
    DEFAULT_CA_URL.to_string()
}

impl DatastoreConfig {
    /// Read configuration from `SENTINEL_ACME_DATASTORE_*` variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let endpoint = var(ENV_ENDPOINT)
            .or_else(|| var(ENV_EMULATOR_HOST).map(|host| format!("http://{host}")));

        Self {
            project_id: var(ENV_PROJECT_ID).unwrap_or_default(),
            prefix: var(ENV_PREFIX).unwrap_or(defaults.prefix),
            aes_key: var(ENV_AES_KEY),
            endpoint,
            access_token: var(ENV_ACCESS_TOKEN),
            ca_url: var(ENV_CA_URL).unwrap_or(defaults.ca_url),
        }
    }

    /// Check required settings.
    pub fn validate(&self) -> StorageResult<()> {
        if self.project_id.trim().is_empty() {
            return Err(StorageError::Config(format!(
                "project id is required (set {ENV_PROJECT_ID})"
            )));
        }
        self.ca_host()?;
        self.decode_key()?;
        Ok(())
    }

    /// Host of the CA directory URL.
    pub fn ca_host(&self) -> StorageResult<String> {
        let url = Url::parse(&self.ca_url)
            .map_err(|e| StorageError::Config(format!("invalid CA URL {}: {e}", self.ca_url)))?;
        url.host_str()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Config(format!("CA URL {} has no host", self.ca_url)))
    }

    /// Decode the AES key. `None` when encryption is disabled.
    pub fn decode_key(&self) -> StorageResult<Option<Zeroizing<[u8; KEY_LEN]>>> {
        let Some(encoded) = self.aes_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) else {
            return Ok(None);
        };

        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|e| StorageError::Config(format!("unable to decode AES key: {e}")))?,
        );
        if bytes.len() != KEY_LEN {
            return Err(StorageError::Config(format!(
                "AES key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&bytes);
        Ok(Some(key))
    }

    /// REST endpoint to use: explicit override or production.
    pub fn resolved_endpoint(&self) -> String {
        self.endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
    }
}

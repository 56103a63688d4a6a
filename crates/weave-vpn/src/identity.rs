//! Identity Provisioning
//!
//! Each identity slot is a directory holding `identity.toml` (the
//! interface private key and the license it is bound to) and the
//! WireGuard profile the session builder reads. Provisioning is
//! load-or-create and safe to repeat.

use crate::config::PeerTemplate;
use crate::keys::{KeyError, PrivateKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Identity file name inside a slot directory
pub const IDENTITY_FILE: &str = "identity.toml";

/// Profile file name inside a slot directory
pub const PROFILE_FILE: &str = "wg-profile.conf";

/// Identity slots provisioned on every run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentitySlot {
    Primary,
    Secondary,
}

impl IdentitySlot {
    /// All slots, in provisioning order
    pub const ALL: [IdentitySlot; 2] = [IdentitySlot::Primary, IdentitySlot::Secondary];

    pub fn name(&self) -> &'static str {
        match self {
            IdentitySlot::Primary => "primary",
            IdentitySlot::Secondary => "secondary",
        }
    }

    /// Slot directory under `storage`
    pub fn dir(&self, storage: &Path) -> PathBuf {
        storage.join(self.name())
    }

    /// Profile path under `storage`
    pub fn profile_path(&self, storage: &Path) -> PathBuf {
        self.dir(storage).join(PROFILE_FILE)
    }
}

impl fmt::Display for IdentitySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Loads or creates credential material in a slot directory
#[async_trait]
pub trait IdentityProvisioner: Send + Sync {
    async fn provision(&self, dir: &Path, license: &str) -> Result<(), IdentityError>;
}

/// Stored identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Interface private key (base64)
    pub private_key: String,
    /// License the identity is bound to
    #[serde(default)]
    pub license: String,
}

impl IdentityRecord {
    fn generate(license: &str) -> Self {
        Self {
            private_key: PrivateKey::generate().to_base64(),
            license: license.to_string(),
        }
    }
}

/// File-backed provisioner
#[derive(Debug, Clone, Default)]
pub struct FileIdentityStore {
    template: PeerTemplate,
}

impl FileIdentityStore {
    pub fn new(template: PeerTemplate) -> Self {
        Self { template }
    }

    /// Render a profile for `record` from the peer template
    fn render_profile(&self, record: &IdentityRecord) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", record.private_key));
        if !self.template.addresses.is_empty() {
            out.push_str(&format!("Address = {}\n", self.template.addresses.join(", ")));
        }
        if !self.template.dns.is_empty() {
            out.push_str(&format!("DNS = {}\n", self.template.dns.join(", ")));
        }
        out.push_str("\n[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", self.template.public_key));
        if !self.template.allowed_ips.is_empty() {
            out.push_str(&format!("AllowedIPs = {}\n", self.template.allowed_ips.join(", ")));
        }
        out.push_str(&format!("Endpoint = {}\n", self.template.endpoint));
        out
    }

    async fn load_record(path: &Path) -> Result<Option<IdentityRecord>, IdentityError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(IdentityError::io(path, e)),
        };

        let record: IdentityRecord = toml::from_str(&content)
            .map_err(|e| IdentityError::Parse(path.display().to_string(), e.to_string()))?;
        PrivateKey::from_base64(&record.private_key)?;

        Ok(Some(record))
    }

    async fn store_record(path: &Path, record: &IdentityRecord) -> Result<(), IdentityError> {
        let content = toml::to_string_pretty(record)
            .map_err(|e| IdentityError::Parse(path.display().to_string(), e.to_string()))?;
        tokio::fs::write(path, content).await
            .map_err(|e| IdentityError::io(path, e))
    }
}

#[async_trait]
impl IdentityProvisioner for FileIdentityStore {
    async fn provision(&self, dir: &Path, license: &str) -> Result<(), IdentityError> {
        tokio::fs::create_dir_all(dir).await
            .map_err(|e| IdentityError::io(dir, e))?;

        let identity_path = dir.join(IDENTITY_FILE);
        let record = match Self::load_record(&identity_path).await? {
            Some(mut record) => {
                if !license.is_empty() && record.license != license {
                    info!(path = %identity_path.display(), "updating identity license");
                    record.license = license.to_string();
                    Self::store_record(&identity_path, &record).await?;
                } else {
                    debug!(path = %identity_path.display(), "loaded existing identity");
                }
                record
            }
            None => {
                let record = IdentityRecord::generate(license);
                Self::store_record(&identity_path, &record).await?;
                info!(path = %identity_path.display(), "created new identity");
                record
            }
        };

        let profile_path = dir.join(PROFILE_FILE);
        if tokio::fs::try_exists(&profile_path).await.map_err(|e| IdentityError::io(&profile_path, e))? {
            return Ok(());
        }

        tokio::fs::write(&profile_path, self.render_profile(&record)).await
            .map_err(|e| IdentityError::io(&profile_path, e))?;
        info!(path = %profile_path.display(), "wrote profile");

        Ok(())
    }
}

/// Identity errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    #[error("I/O error on {0}: {1}")]
    Io(String, String),

    #[error("invalid identity {0}: {1}")]
    Parse(String, String),

    #[error("invalid identity key: {0}")]
    Key(#[from] KeyError),

    #[error("{0}")]
    Other(String),
}

impl IdentityError {
    fn io(path: &Path, e: std::io::Error) -> Self {
        IdentityError::Io(path.display().to_string(), e.to_string())
    }
}

//! The `Namespace` record (§3).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineError;
use crate::security::ConnectionStringProtector;

/// How a namespace authenticates against the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AuthType {
    /// A connection string carrying a shared access key.
    ConnectionString,
    /// The broker is reached via the process's managed identity; no
    /// credential is stored.
    ManagedIdentity,
}

impl AuthType {
    /// Parse the column value stored for `auth_type`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ConnectionString" => Some(Self::ConnectionString),
            "ManagedIdentity" => Some(Self::ManagedIdentity),
            _ => None,
        }
    }

    /// The column value to store for `auth_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionString => "ConnectionString",
            Self::ManagedIdentity => "ManagedIdentity",
        }
    }
}

/// A connected broker namespace.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Namespace {
    /// Stable 128-bit identifier.
    pub id: Uuid,
    /// Unique short name among active namespaces.
    pub name: String,
    /// Operator-facing label; need not be unique.
    pub display_name: String,
    /// How this namespace authenticates.
    pub auth_type: AuthType,
    /// Versioned, encrypted credential payload (empty when
    /// `auth_type = ManagedIdentity`). Produced by
    /// `ConnectionStringProtector::encrypt`.
    pub encrypted_credential: String,
    /// Deactivated namespaces are kept (not deleted) so history stays
    /// joinable.
    pub is_active: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-mutated timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Namespace {
    /// Whether this record satisfies the data-model invariant in §3: a
    /// `ConnectionString`-authenticated namespace must carry a non-empty
    /// credential.
    pub fn credential_invariant_holds(&self) -> bool {
        match self.auth_type {
            AuthType::ConnectionString => !self.encrypted_credential.is_empty(),
            AuthType::ManagedIdentity => true,
        }
    }

    /// Recover the plaintext credential to hand to `BrokerClientCache`.
    /// `ManagedIdentity` namespaces carry none; an empty string is the
    /// credential fingerprint input for those.
    pub fn decrypt_credential(&self, protector: &ConnectionStringProtector) -> Result<String, EngineError> {
        match self.auth_type {
            AuthType::ConnectionString => protector
                .decrypt(&self.encrypted_credential)
                .map_err(|e| EngineError::DecryptFailed(e.to_string())),
            AuthType::ManagedIdentity => Ok(String::new()),
        }
    }
}

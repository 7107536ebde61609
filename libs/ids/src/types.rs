//! Typed ID definitions for all platform resources.
//!
//! Node, project and user identities are UUIDs handed to quay by the
//! surrounding platform. Service names are derived from the node UUID and
//! double as Docker Swarm service names, which must be unique per swarm.

use crate::{define_uuid_id, IdError};

// =============================================================================
// Platform Identities
// =============================================================================

define_uuid_id!(NodeUuid);
define_uuid_id!(ProjectId);
define_uuid_id!(UserId);

// =============================================================================
// Long-Running Tasks
// =============================================================================

define_uuid_id!(TaskId);

// =============================================================================
// Billing
// =============================================================================

/// Wallet ID is a simple integer assigned by the billing system, not a UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalletId(i64);

impl WalletId {
    /// Creates a new WalletId from an i64.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the underlying i64 value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for WalletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for WalletId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<WalletId> for i64 {
    fn from(id: WalletId) -> Self {
        id.0
    }
}

impl serde::Serialize for WalletId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for WalletId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = i64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Derived Names
// =============================================================================

/// Prefix of every sidecar Swarm service name.
pub const SIDECAR_SERVICE_PREFIX: &str = "qy-sidecar";

/// Prefix of every proxy Swarm service name.
pub const PROXY_SERVICE_PREFIX: &str = "qy-proxy";

/// Name of a dynamic-sidecar Swarm service, derived from the node UUID.
///
/// The name is unique per swarm because node UUIDs are unique per platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceName(String);

impl ServiceName {
    /// Derive the sidecar service name for a node.
    #[must_use]
    pub fn sidecar(node_uuid: &NodeUuid) -> Self {
        Self(format!("{SIDECAR_SERVICE_PREFIX}_{node_uuid}"))
    }

    /// Derive the proxy service name for a node.
    #[must_use]
    pub fn proxy(node_uuid: &NodeUuid) -> Self {
        Self(format!("{PROXY_SERVICE_PREFIX}_{node_uuid}"))
    }

    /// Parses a service name, checking the expected `prefix_uuid` shape.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((prefix, uuid_str)) = s.split_once('_') else {
            return Err(IdError::InvalidServiceName(s.to_string()));
        };

        if prefix != SIDECAR_SERVICE_PREFIX && prefix != PROXY_SERVICE_PREFIX {
            return Err(IdError::InvalidServiceName(s.to_string()));
        }

        NodeUuid::parse(uuid_str)?;
        Ok(Self(s.to_string()))
    }

    /// The node this service name was derived from.
    pub fn node_uuid(&self) -> Result<NodeUuid, IdError> {
        let uuid_str = self
            .0
            .split_once('_')
            .map(|(_, rest)| rest)
            .ok_or_else(|| IdError::InvalidServiceName(self.0.clone()))?;
        NodeUuid::parse(uuid_str)
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for ServiceName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ServiceName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_uuid_roundtrip() {
        let node = NodeUuid::new();
        let parsed = NodeUuid::parse(&node.to_string()).unwrap();
        assert_eq!(node, parsed);
    }

    #[test]
    fn test_node_uuid_rejects_garbage() {
        assert_eq!(NodeUuid::parse(""), Err(IdError::Empty));
        assert!(matches!(
            NodeUuid::parse("not-a-uuid"),
            Err(IdError::InvalidUuid(_))
        ));
    }

    #[test]
    fn test_typed_ids_serde_as_uuid_string() {
        let project = ProjectId::new();
        let json = serde_json::to_string(&project).unwrap();
        assert_eq!(json, format!("\"{project}\""));

        let back: ProjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(project, back);
    }

    #[test]
    fn test_wallet_id_serde_as_integer() {
        let wallet = WalletId::new(42);
        let json = serde_json::to_string(&wallet).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn test_service_name_derivation_and_back() {
        let node = NodeUuid::new();
        let name = ServiceName::sidecar(&node);
        assert!(name.as_str().starts_with("qy-sidecar_"));
        assert_eq!(name.node_uuid().unwrap(), node);

        let proxy = ServiceName::proxy(&node);
        assert!(proxy.as_str().starts_with("qy-proxy_"));
        assert_eq!(proxy.node_uuid().unwrap(), node);
    }

    #[test]
    fn test_service_name_rejects_unknown_prefix() {
        let node = NodeUuid::new();
        assert!(ServiceName::parse(&format!("other_{node}")).is_err());
        assert!(ServiceName::parse("qy-sidecar_not-a-uuid").is_err());
    }
}

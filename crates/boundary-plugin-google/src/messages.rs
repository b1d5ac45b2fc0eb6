//! Request and response payloads of the `HostPlugin` capability.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCatalog {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub attributes: Value,
    /// Write-only; present only when the operator supplied new secrets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Value>,
}

/// Secret material the host stores on the plugin's behalf.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCatalogPersisted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSet {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub attributes: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizeDataRequest {
    #[serde(default)]
    pub attributes: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizeDataResponse {
    pub attributes: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnCreateCatalogRequest {
    pub catalog: HostCatalog,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnCreateCatalogResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted: Option<HostCatalogPersisted>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnUpdateCatalogRequest {
    #[serde(default)]
    pub current_catalog: HostCatalog,
    pub new_catalog: HostCatalog,
    #[serde(default)]
    pub persisted: Option<HostCatalogPersisted>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnUpdateCatalogResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted: Option<HostCatalogPersisted>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnDeleteCatalogRequest {
    pub catalog: HostCatalog,
    #[serde(default)]
    pub persisted: Option<HostCatalogPersisted>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnCreateSetRequest {
    pub catalog: HostCatalog,
    pub set: HostSet,
    #[serde(default)]
    pub persisted: Option<HostCatalogPersisted>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnUpdateSetRequest {
    pub catalog: HostCatalog,
    #[serde(default)]
    pub current_set: HostSet,
    pub new_set: HostSet,
    #[serde(default)]
    pub persisted: Option<HostCatalogPersisted>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnDeleteSetRequest {
    pub catalog: HostCatalog,
    pub set: HostSet,
    #[serde(default)]
    pub persisted: Option<HostCatalogPersisted>,
}

/// Response of operations that only acknowledge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

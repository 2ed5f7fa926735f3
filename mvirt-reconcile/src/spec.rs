//! Stack descriptor - the desired state handed to every manager.

use std::path::Path;

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};

use crate::error::InvalidSpec;
use crate::model::ObjectKey;

/// Volume size used when persistence is enabled without an explicit size.
pub const DEFAULT_VOLUME_SIZE: &str = "10Gi";

/// Template VMs boot from when none is given.
pub const DEFAULT_TEMPLATE: &str = "debian-13";

/// A named stack and its desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub spec: StackSpec,
}

impl Stack {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: StackSpec) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            spec,
        }
    }

    /// Load a stack descriptor from a JSON file.
    pub async fn from_file(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read stack descriptor {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse stack descriptor {}", path.display()))
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackSpec {
    pub workload: WorkloadSpec,
    pub storage: StorageSpec,
    pub networking: NetworkingSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSpec {
    pub replicas: u32,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub template_id: String,
    /// Keep the VMs defined but powered off.
    pub stopped: bool,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            replicas: 1,
            cpu_cores: 1,
            memory_mb: 1024,
            template_id: DEFAULT_TEMPLATE.to_string(),
            stopped: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSpec {
    pub persistent: bool,
    pub volume_size: String,
    pub template_id: Option<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            persistent: false,
            volume_size: DEFAULT_VOLUME_SIZE.to_string(),
            template_id: None,
        }
    }
}

impl StorageSpec {
    /// Requested capacity in bytes.
    pub fn size_bytes(&self) -> Result<u64, InvalidSpec> {
        parse_quantity(&self.volume_size)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkingSpec {
    pub expose: bool,
    pub ipv4_subnet: Option<String>,
    pub ipv6_prefix: Option<String>,
    pub dns_servers: Vec<String>,
    pub is_public: bool,
    pub routed_ipv4_prefixes: Vec<String>,
}

/// Parse a capacity such as `10Gi`, `500M` or `4096` into bytes.
pub fn parse_quantity(input: &str) -> Result<u64, InvalidSpec> {
    let invalid = |reason: &str| InvalidSpec {
        field: "storage.volume_size",
        reason: format!("{:?}: {}", input, reason),
    };

    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);

    if digits.is_empty() {
        return Err(invalid("missing number"));
    }
    let value: u64 = digits.parse().map_err(|_| invalid("number out of range"))?;

    let multiplier: u64 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        _ => return Err(invalid("unknown suffix")),
    };

    let bytes = value
        .checked_mul(multiplier)
        .ok_or_else(|| invalid("size overflows"))?;
    if bytes == 0 {
        return Err(invalid("size must be positive"));
    }
    Ok(bytes)
}

//! Error types for stack synthesis.

use thiserror::Error;

/// Result type alias for stack operations.
pub type StackResult<T> = Result<T, StackError>;

/// Errors that can occur while building or synthesizing the stack.
#[derive(Error, Debug)]
pub enum StackError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),

    #[error("Invalid network layout: {0}")]
    InvalidNetwork(String),

    #[error("Address space exhausted: cannot carve /{mask} from {cidr}")]
    AddressSpaceExhausted { cidr: String, mask: u8 },

    #[error("Invalid logical id: {0} (must be alphanumeric and start with a letter)")]
    InvalidLogicalId(String),

    #[error("Duplicate logical id: {0}")]
    DuplicateLogicalId(String),

    #[error("Security group {group} references undeclared group {missing}")]
    UnknownSecurityGroup { group: String, missing: String },

    #[error("{owner} references {target}, which is not declared in the stack")]
    DanglingReference { owner: String, target: String },

    #[error("Dependency cycle between resources: {0}")]
    DependencyCycle(String),

    #[error("Subnet tier not found in VPC {vpc}: {tier}")]
    SubnetTierNotFound { vpc: String, tier: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

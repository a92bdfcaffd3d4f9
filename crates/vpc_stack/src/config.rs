//! Stack configuration.
//!
//! The handful of values an operator changes between deployments. Loaded
//! from YAML, then overridden by whatever the caller sets explicitly.

use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cidr::Ipv4Cidr;
use crate::compute::MachineImage;
use crate::error::{StackError, StackResult};

pub const DEFAULT_STACK_NAME: &str = "VpcSetupStack";
pub const DEFAULT_INSTANCE_TYPE: &str = "t2.micro";
pub const DEFAULT_VPC_CIDR: &str = "10.0.0.0/16";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub stack_name: String,
    /// Source address allowed to SSH into the bastion host.
    pub operator_ip: String,
    /// Key pair attached to every instance.
    pub ssh_key_name: String,
    pub instance_type: String,
    pub max_azs: usize,
    pub nat_gateways: usize,
    pub vpc_cidr: Ipv4Cidr,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub machine_image: MachineImage,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            stack_name: DEFAULT_STACK_NAME.to_string(),
            operator_ip: String::new(),
            ssh_key_name: String::new(),
            instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            max_azs: 3,
            nat_gateways: 1,
            vpc_cidr: Ipv4Cidr::private_default(),
            machine_image: MachineImage::default(),
        }
    }
}

impl StackConfig {
    pub fn new(operator_ip: impl Into<String>, ssh_key_name: impl Into<String>) -> Self {
        Self {
            operator_ip: operator_ip.into(),
            ssh_key_name: ssh_key_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> StackResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: StackConfig = serde_yaml::from_str(&content)?;
        debug!("Loaded stack configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file(&self, path: &Path) -> StackResult<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn with_stack_name(mut self, name: impl Into<String>) -> Self {
        self.stack_name = name.into();
        self
    }

    pub fn with_operator_ip(mut self, ip: impl Into<String>) -> Self {
        self.operator_ip = ip.into();
        self
    }

    pub fn with_ssh_key_name(mut self, name: impl Into<String>) -> Self {
        self.ssh_key_name = name.into();
        self
    }

    pub fn with_instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = instance_type.into();
        self
    }

    pub fn with_machine_image(mut self, image: MachineImage) -> Self {
        self.machine_image = image;
        self
    }

    /// The operator address as a CIDR block; a bare address becomes `/32`
    /// and host bits below the prefix are cleared.
    pub fn operator_cidr(&self) -> StackResult<Ipv4Cidr> {
        Ipv4Cidr::parse_host_or_cidr(&self.operator_ip)
            .map(|cidr| cidr.normalized())
            .map_err(|_| StackError::InvalidConfig(format!("operator_ip is not an IPv4 address: {:?}", self.operator_ip)))
    }

    pub fn validate(&self) -> StackResult<()> {
        let invalid = |msg: String| Err(StackError::InvalidConfig(msg));

        let stack_name = Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,127}$").expect("static stack name pattern");
        if !stack_name.is_match(&self.stack_name) {
            return invalid(format!("stack_name is not a valid stack name: {:?}", self.stack_name));
        }

        if self.operator_ip.trim().is_empty() {
            return invalid("operator_ip is required".to_string());
        }
        if self.operator_cidr()?.is_any() {
            return invalid("operator_ip must not open SSH to every address".to_string());
        }

        let key_name = Regex::new(r"^[A-Za-z0-9._\-]{1,255}$").expect("static key name pattern");
        if self.ssh_key_name.is_empty() {
            return invalid("ssh_key_name is required".to_string());
        }
        if !key_name.is_match(&self.ssh_key_name) {
            return invalid(format!("ssh_key_name is not a valid key pair name: {:?}", self.ssh_key_name));
        }

        let instance_type = Regex::new(r"^[a-z][a-z0-9-]*\.[a-z0-9]+$").expect("static instance type pattern");
        if !instance_type.is_match(&self.instance_type) {
            return invalid(format!("instance_type is not valid: {:?}", self.instance_type));
        }

        if !(16..=28).contains(&self.vpc_cidr.prefix()) {
            return invalid(format!("vpc_cidr {} must be between /16 and /28", self.vpc_cidr));
        }
        if !self.vpc_cidr.is_aligned() {
            return invalid(format!(
                "vpc_cidr {} has host bits set; did you mean {}?",
                self.vpc_cidr,
                self.vpc_cidr.normalized()
            ));
        }

        if !(1..=6).contains(&self.max_azs) {
            return invalid(format!("max_azs must be between 1 and 6, got {}", self.max_azs));
        }
        if self.nat_gateways > self.max_azs {
            return invalid(format!(
                "nat_gateways ({}) cannot exceed max_azs ({})",
                self.nat_gateways, self.max_azs
            ));
        }

        if let MachineImage::Pinned(ami) = &self.machine_image {
            if !ami.starts_with("ami-") {
                return invalid(format!("pinned machine image must be an AMI id: {:?}", ami));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = StackConfig::default();
        assert_eq!(config.stack_name, "VpcSetupStack");
        assert_eq!(config.instance_type, "t2.micro");
        assert_eq!(config.vpc_cidr.to_string(), DEFAULT_VPC_CIDR);
        assert_eq!(config.max_azs, 3);
        assert_eq!(config.nat_gateways, 1);
        assert_eq!(config.machine_image, MachineImage::LatestAmazonLinux);
    }

    #[test]
    fn test_valid_config() {
        let config = StackConfig::new("203.0.113.5", "lab-key");
        config.validate().unwrap();
        assert_eq!(config.operator_cidr().unwrap().to_string(), "203.0.113.5/32");
    }

    #[test]
    fn test_missing_required_values() {
        assert!(StackConfig::default().validate().is_err());
        assert!(StackConfig::new("203.0.113.5", "").validate().is_err());
        assert!(StackConfig::new("", "lab-key").validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_values() {
        assert!(StackConfig::new("203.0.113", "lab-key").validate().is_err());
        assert!(StackConfig::new("0.0.0.0/0", "lab-key").validate().is_err());
        assert!(StackConfig::new("203.0.113.5", "bad key!").validate().is_err());
        assert!(StackConfig::new("203.0.113.5", "lab-key")
            .with_instance_type("micro")
            .validate()
            .is_err());
        assert!(StackConfig::new("203.0.113.5", "lab-key")
            .with_machine_image(MachineImage::Pinned("img-1".to_string()))
            .validate()
            .is_err());
    }

    #[test]
    fn test_vpc_cidr_must_be_an_aligned_network() {
        let mut config = StackConfig::new("203.0.113.5", "lab-key");
        config.vpc_cidr = "10.0.5.0/16".parse().unwrap();
        assert!(matches!(config.validate(), Err(StackError::InvalidConfig(_))));

        config.vpc_cidr = "10.0.0.0/12".parse().unwrap();
        assert!(matches!(config.validate(), Err(StackError::InvalidConfig(_))));

        config.vpc_cidr = "172.16.0.0/20".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_operator_range_is_normalized() {
        let config = StackConfig::new("203.0.113.5/24", "lab-key");
        assert_eq!(config.operator_cidr().unwrap().to_string(), "203.0.113.0/24");
    }

    #[test]
    fn test_nat_cannot_exceed_zones() {
        let mut config = StackConfig::new("203.0.113.5", "lab-key");
        config.max_azs = 2;
        config.nat_gateways = 3;
        assert!(matches!(config.validate(), Err(StackError::InvalidConfig(_))));
    }

    #[test]
    fn test_yaml_file_with_partial_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vpcstack.yaml");
        fs::write(
            &path,
            "operator_ip: 198.51.100.7/32\nssh_key_name: ops\nmachine_image:\n  pinned: ami-0abc\n",
        )
        .unwrap();

        let config = StackConfig::from_file(&path).unwrap();
        assert_eq!(config.operator_ip, "198.51.100.7/32");
        assert_eq!(config.ssh_key_name, "ops");
        assert_eq!(config.machine_image, MachineImage::Pinned("ami-0abc".to_string()));
        assert_eq!(config.stack_name, DEFAULT_STACK_NAME);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.yaml");
        let config = StackConfig::new("203.0.113.5/32", "lab-key").with_stack_name("Lab");
        config.to_file(&path).unwrap();
        assert_eq!(StackConfig::from_file(&path).unwrap(), config);
    }
}

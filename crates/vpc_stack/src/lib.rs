//! # vpc_stack
//!
//! Declares the VPC setup topology and synthesizes it into a CloudFormation
//! template for the provisioning engine.
//!
//! ## Topology
//!
//! - One VPC across three availability zones with a public tier and a
//!   NAT-routed private tier
//! - Bastion, frontend and backend security groups
//! - Bastion and frontend hosts in the public tier, each with an elastic IP
//! - A backend host in the private tier
//! - A versioned bucket that is emptied and deleted with the stack
//!
//! ## Example
//!
//! ```rust,no_run
//! use vpc_stack::{ArtifactWriter, StackConfig, TopologyValidator, VpcSetupStack};
//!
//! let config = StackConfig::new("203.0.113.5", "my-key");
//! let stack = VpcSetupStack::build(&config).unwrap();
//! let template = stack.to_template();
//!
//! let report = TopologyValidator::new().validate(&template);
//! assert!(report.passed);
//!
//! ArtifactWriter::new("cdk.out").write(stack.name(), &template).unwrap();
//! ```

pub mod artifact;
pub mod cidr;
pub mod compute;
pub mod config;
pub mod error;
pub mod network;
pub mod outputs;
pub mod security;
pub mod stack;
pub mod storage;
pub mod template;
pub mod topology;
pub mod validator;

pub use artifact::{ArtifactManifest, ArtifactWriter};
pub use cidr::Ipv4Cidr;
pub use compute::{ElasticIpHandle, InstanceHandle, InstanceSpec, MachineImage, SubnetSelection};
pub use config::StackConfig;
pub use error::{StackError, StackResult};
pub use network::{NetworkSpec, SubnetKind, SubnetTier, VpcHandle};
pub use outputs::OutputSpec;
pub use security::{AccessControlPlan, Peer, PortSpec, Rule, SecurityGroupHandle, SecurityGroupSpec};
pub use stack::Stack;
pub use storage::{BucketHandle, BucketSpec};
pub use template::{RemovalPolicy, Resource, Template};
pub use topology::VpcSetupStack;
pub use validator::{TopologyValidator, ValidationCheck, ValidationReport};

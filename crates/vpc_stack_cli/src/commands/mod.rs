//! CLI command definitions.
//!
//! Every subcommand resolves a [`StackConfig`] the same way: defaults, then
//! the YAML file, then environment variables, then explicit flags.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use vpc_stack::{MachineImage, Stack, StackConfig, VpcSetupStack};

pub mod outputs;
pub mod synth;
pub mod validate;

/// vpcstack - VPC setup stack synthesizer
#[derive(Parser)]
#[command(name = "vpcstack")]
#[command(version, about = "Synthesize the VPC setup stack into a CloudFormation template")]
#[command(long_about = r#"
vpcstack declares a VPC with public and private subnets, bastion, frontend and
backend hosts with their security groups, and a versioned S3 bucket, then
synthesizes it into a CloudFormation template.

COMMANDS:
  synth     → Build, validate and write the cloud assembly
  validate  → Build and check the topology properties
  outputs   → Print the declared stack outputs

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments or configuration
  3 - Validation failure
  5 - Synthesis error
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the stack and write the template and manifest
    Synth(synth::SynthArgs),

    /// Build the stack and report the topology checks
    Validate(validate::ValidateArgs),

    /// Print the stack outputs
    Outputs(outputs::OutputsArgs),
}

/// Raised when the topology validator reports failed checks.
#[derive(Debug, thiserror::Error)]
#[error("validation failed: {failed} check(s) did not pass")]
pub struct ValidationFailed {
    pub failed: usize,
}

/// Configuration flags shared by all subcommands.
#[derive(Args, Debug, Clone, Default)]
pub struct StackArgs {
    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address allowed to SSH into the bastion (bare address or CIDR)
    #[arg(long, env = "VPCSTACK_OPERATOR_IP")]
    pub operator_ip: Option<String>,

    /// EC2 key pair name installed on all hosts
    #[arg(long = "ssh-key", env = "VPCSTACK_SSH_KEY_NAME")]
    pub ssh_key_name: Option<String>,

    /// Stack name
    #[arg(long)]
    pub stack_name: Option<String>,

    /// Instance type for all hosts
    #[arg(long)]
    pub instance_type: Option<String>,

    /// Pin the machine image instead of resolving the latest Amazon Linux
    #[arg(long, value_name = "AMI_ID")]
    pub image: Option<String>,
}

impl StackArgs {
    /// Merge file, environment and flags into a validated configuration.
    pub fn load_config(&self) -> Result<StackConfig> {
        let mut config = match &self.config {
            Some(path) => StackConfig::from_file(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?,
            None => StackConfig::default(),
        };

        if let Some(ip) = &self.operator_ip {
            config = config.with_operator_ip(ip);
        }
        if let Some(key) = &self.ssh_key_name {
            config = config.with_ssh_key_name(key);
        }
        if let Some(name) = &self.stack_name {
            config = config.with_stack_name(name);
        }
        if let Some(instance_type) = &self.instance_type {
            config = config.with_instance_type(instance_type);
        }
        if let Some(ami) = &self.image {
            config = config.with_machine_image(MachineImage::Pinned(ami.clone()));
        }

        config.validate()?;
        debug!("Resolved configuration: {:?}", config);
        Ok(config)
    }

    pub fn build(&self) -> Result<(StackConfig, Stack)> {
        let config = self.load_config()?;
        let stack = VpcSetupStack::build(&config)?;
        Ok((config, stack))
    }
}

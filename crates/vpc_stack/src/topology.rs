//! The topology builder.
//!
//! [`VpcSetupStack`] wraps a [`Stack`] with one factory method per kind of
//! resource and [`VpcSetupStack::build`] runs them in the fixed order
//! network, access control, compute, storage, outputs.

use std::collections::HashMap;

use tracing::info;

use crate::config::StackConfig;
use crate::compute::{
    declare_elastic_ip, declare_instance, ElasticIpHandle, InstanceHandle, InstanceSpec, SubnetSelection,
};
use crate::error::StackResult;
use crate::network::{declare_vpc, NetworkSpec, SubnetKind, SubnetTier, VpcHandle};
use crate::outputs::{declare_output, OutputSpec};
use crate::security::{AccessControlPlan, PortSpec, Peer, Rule, SecurityGroupHandle, SecurityGroupSpec};
use crate::stack::Stack;
use crate::storage::{declare_bucket, BucketHandle, BucketSpec};

pub const VPC_ID: &str = "MyVpc";
pub const PUBLIC_TIER: &str = "PublicSubnet";
pub const PRIVATE_TIER: &str = "PrivateSubnet";
pub const BASTION_SG: &str = "BastionSG";
pub const FRONTEND_SG: &str = "FrontendSG";
pub const BACKEND_SG: &str = "BackendSG";
pub const BASTION_INSTANCE: &str = "BastionInstance";
pub const FRONTEND_INSTANCE: &str = "FrontendInstance";
pub const BACKEND_INSTANCE: &str = "BackendInstance";
pub const BASTION_EIP: &str = "BastionEIP";
pub const FRONTEND_EIP: &str = "FrontendEIP";
pub const BUCKET_ID: &str = "MyS3Bucket";

pub const HTTP_PORT: u16 = 80;
pub const SSH_PORT: u16 = 22;
pub const BACKEND_PORT: u16 = 8080;
pub const HTTPS_PORT: u16 = 443;

const STACK_DESCRIPTION: &str =
    "VPC with public and private subnets, bastion, frontend and backend hosts, and a versioned S3 bucket";

/// Builder for the VPC setup stack.
pub struct VpcSetupStack {
    stack: Stack,
    config: StackConfig,
    access_control: AccessControlPlan,
    elastic_ips: HashMap<String, ElasticIpHandle>,
}

impl VpcSetupStack {
    /// Start an empty stack. The configuration is validated up front.
    pub fn new(config: &StackConfig) -> StackResult<Self> {
        config.validate()?;
        Ok(Self {
            stack: Stack::new(&config.stack_name).with_description(STACK_DESCRIPTION),
            config: config.clone(),
            access_control: AccessControlPlan::new(),
            elastic_ips: HashMap::new(),
        })
    }

    /// Build the whole topology for `config`.
    pub fn build(config: &StackConfig) -> StackResult<Stack> {
        let mut app = Self::new(config)?;
        info!("Building stack {}", config.stack_name);

        let network = app.network_spec();
        let vpc = app.create_vpc(VPC_ID, &network)?;

        let (bastion_sg, frontend_sg, backend_sg) = app.create_security_groups(&vpc)?;
        app.materialize_security_groups()?;

        let bastion = app.create_instance(BASTION_INSTANCE, &vpc, &bastion_sg, SubnetKind::Public)?;
        app.associate_elastic_ip(BASTION_EIP, &bastion)?;

        let frontend = app.create_instance(FRONTEND_INSTANCE, &vpc, &frontend_sg, SubnetKind::Public)?;
        app.associate_elastic_ip(FRONTEND_EIP, &frontend)?;

        let backend = app.create_instance(BACKEND_INSTANCE, &vpc, &backend_sg, SubnetKind::PrivateWithNat)?;

        let bucket = app.create_s3_bucket(BUCKET_ID)?;
        app.create_outputs(&bastion, &frontend, &backend, &bucket)?;

        let stack = app.into_stack();
        info!("Stack {} declares {} resources", stack.name(), stack.resource_count());
        Ok(stack)
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn into_stack(self) -> Stack {
        self.stack
    }

    /// Public and NAT-routed private tiers, one /24 per zone each.
    pub fn network_spec(&self) -> NetworkSpec {
        NetworkSpec::new(self.config.vpc_cidr)
            .with_max_azs(self.config.max_azs)
            .with_nat_gateways(self.config.nat_gateways)
            .with_tier(SubnetTier::new(PUBLIC_TIER, SubnetKind::Public, 24))
            .with_tier(SubnetTier::new(PRIVATE_TIER, SubnetKind::PrivateWithNat, 24))
    }

    pub fn create_vpc(&mut self, id: &str, spec: &NetworkSpec) -> StackResult<VpcHandle> {
        declare_vpc(&mut self.stack, id, spec)
    }

    /// Stage a security group. Rules may name groups that are created later;
    /// nothing is written until [`Self::materialize_security_groups`].
    pub fn create_security_group(
        &mut self,
        id: &str,
        vpc: &VpcHandle,
        description: &str,
        ingress: Vec<Rule>,
        egress: Vec<Rule>,
    ) -> StackResult<SecurityGroupHandle> {
        let mut spec = SecurityGroupSpec::new(id, vpc, description);
        spec.ingress = ingress;
        spec.egress = egress;
        self.access_control.add(spec)
    }

    /// Write all staged groups and rules in dependency order.
    pub fn materialize_security_groups(&mut self) -> StackResult<()> {
        let plan = std::mem::take(&mut self.access_control);
        plan.materialize(&mut self.stack)
    }

    /// Bastion, frontend and backend groups.
    ///
    /// The frontend's egress names the backend group before it is created;
    /// the plan resolves that when it is materialized.
    fn create_security_groups(
        &mut self,
        vpc: &VpcHandle,
    ) -> StackResult<(SecurityGroupHandle, SecurityGroupHandle, SecurityGroupHandle)> {
        let operator = self.config.operator_cidr()?;
        let backend = SecurityGroupHandle::named(BACKEND_SG);

        let bastion = self.create_security_group(
            BASTION_SG,
            vpc,
            "Security group for Bastion host",
            vec![Rule::new(Peer::Cidr(operator), PortSpec::Tcp(SSH_PORT), "Allow SSH from my IP")],
            vec![Rule::new(Peer::Cidr(vpc.cidr), PortSpec::Tcp(SSH_PORT), "Allow SSH into the VPC")],
        )?;

        let frontend = self.create_security_group(
            FRONTEND_SG,
            vpc,
            "Security group for Frontend",
            vec![
                Rule::new(Peer::any_ipv4(), PortSpec::Tcp(HTTP_PORT), "Allow HTTP from anywhere"),
                Rule::new(Peer::Group(bastion.clone()), PortSpec::Tcp(SSH_PORT), "Allow SSH from Bastion"),
            ],
            vec![Rule::new(
                Peer::Group(backend.clone()),
                PortSpec::Tcp(BACKEND_PORT),
                "Allow outbound to Backend",
            )],
        )?;

        self.create_security_group(
            BACKEND_SG,
            vpc,
            "Security group for Backend",
            vec![
                Rule::new(
                    Peer::Group(frontend.clone()),
                    PortSpec::Tcp(BACKEND_PORT),
                    "Allow inbound from Frontend",
                ),
                Rule::new(Peer::Group(bastion.clone()), PortSpec::Tcp(SSH_PORT), "Allow SSH from Bastion"),
            ],
            vec![Rule::new(Peer::any_ipv4(), PortSpec::Tcp(HTTPS_PORT), "Allow outbound HTTPS")],
        )?;

        Ok((bastion, frontend, backend))
    }

    /// Declare an instance of the configured type, image and key pair.
    pub fn create_instance(
        &mut self,
        id: &str,
        vpc: &VpcHandle,
        security_group: &SecurityGroupHandle,
        subnet_kind: SubnetKind,
    ) -> StackResult<InstanceHandle> {
        let spec = InstanceSpec::new(&self.config.instance_type, SubnetSelection::Kind(subnet_kind))
            .with_image(self.config.machine_image.clone())
            .with_key_name(&self.config.ssh_key_name);
        declare_instance(&mut self.stack, id, vpc, security_group, &spec)
    }

    pub fn associate_elastic_ip(&mut self, id: &str, instance: &InstanceHandle) -> StackResult<ElasticIpHandle> {
        let eip = declare_elastic_ip(&mut self.stack, id, instance)?;
        self.elastic_ips.insert(instance.logical_id.clone(), eip.clone());
        Ok(eip)
    }

    pub fn create_s3_bucket(&mut self, id: &str) -> StackResult<BucketHandle> {
        declare_bucket(&mut self.stack, id, &BucketSpec::default())
    }

    /// Public address of an instance: its elastic IP when it has one.
    fn public_address(&self, instance: &InstanceHandle) -> serde_json::Value {
        match self.elastic_ips.get(&instance.logical_id) {
            Some(eip) => eip.address(),
            None => instance.public_ip(),
        }
    }

    pub fn create_outputs(
        &mut self,
        bastion: &InstanceHandle,
        frontend: &InstanceHandle,
        backend: &InstanceHandle,
        bucket: &BucketHandle,
    ) -> StackResult<()> {
        let outputs = [
            OutputSpec::new(
                "BastionInstancePublicIP",
                self.public_address(bastion),
                "Public IP of Bastion Host",
            ),
            OutputSpec::new(
                "FrontendInstancePublicIP",
                self.public_address(frontend),
                "Public IP of Frontend Instance",
            ),
            OutputSpec::new(
                "BackendInstancePrivateIP",
                backend.private_ip(),
                "Private IP of Backend Instance",
            ),
            OutputSpec::new("S3BucketName", bucket.bucket_name(), "Name of the S3 Bucket"),
        ];

        for output in outputs {
            declare_output(&mut self.stack, output)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackError;

    fn config() -> StackConfig {
        StackConfig::new("203.0.113.5/32", "lab-key")
    }

    #[test]
    fn test_invalid_config_fails_before_building() {
        let result = VpcSetupStack::build(&StackConfig::new("not-an-ip", "lab-key"));
        assert!(matches!(result, Err(StackError::InvalidConfig(_))));
    }

    #[test]
    fn test_pipeline_order() {
        let stack = VpcSetupStack::build(&config()).unwrap();
        let order = stack.construction_order();
        let pos = |id: &str| order.iter().position(|x| *x == id).unwrap();

        assert!(pos(VPC_ID) < pos(BASTION_SG));
        assert!(pos(BACKEND_SG) < pos(BASTION_INSTANCE));
        assert!(pos(BACKEND_INSTANCE) < pos(BUCKET_ID));
    }

    #[test]
    fn test_outputs_use_elastic_ips_for_public_hosts() {
        let stack = VpcSetupStack::build(&config()).unwrap();
        let template = stack.to_template();

        assert_eq!(
            template.outputs["BastionInstancePublicIP"].value,
            serde_json::json!({ "Ref": BASTION_EIP })
        );
        assert_eq!(
            template.outputs["BackendInstancePrivateIP"].value,
            serde_json::json!({ "Fn::GetAtt": [BACKEND_INSTANCE, "PrivateIp"] })
        );
    }

    #[test]
    fn test_instance_before_groups_materialized_is_rejected() {
        let mut app = VpcSetupStack::new(&config()).unwrap();
        let network = app.network_spec();
        let vpc = app.create_vpc(VPC_ID, &network).unwrap();
        let sg = app
            .create_security_group("LoneSG", &vpc, "lone", Vec::new(), Vec::new())
            .unwrap();

        assert!(app.create_instance("Early", &vpc, &sg, SubnetKind::Public).is_err());
        app.materialize_security_groups().unwrap();
        assert!(app.create_instance("Late", &vpc, &sg, SubnetKind::Public).is_ok());
    }

    #[test]
    fn test_groups_can_reference_materialized_groups() {
        let mut app = VpcSetupStack::new(&config()).unwrap();
        let network = app.network_spec();
        let vpc = app.create_vpc(VPC_ID, &network).unwrap();
        let first = app
            .create_security_group("FirstSG", &vpc, "first", Vec::new(), Vec::new())
            .unwrap();
        app.materialize_security_groups().unwrap();

        app.create_security_group(
            "SecondSG",
            &vpc,
            "second",
            vec![Rule::new(Peer::Group(first), PortSpec::Tcp(5432), "from first")],
            Vec::new(),
        )
        .unwrap();
        app.materialize_security_groups().unwrap();
        assert!(app.stack().contains("SecondSGfromFirstSG5432"));
    }
}

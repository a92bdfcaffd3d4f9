//! Compute builder: instances and their static public addresses.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::{StackError, StackResult};
use crate::network::{SubnetKind, VpcHandle};
use crate::security::SecurityGroupHandle;
use crate::stack::Stack;
use crate::template::{get_att, reference, select_az, Parameter, Resource};

/// Public SSM parameter that always points at the newest Amazon Linux 2 AMI.
pub const LATEST_AMAZON_LINUX_SSM_PATH: &str = "/aws/service/ami-amazon-linux-latest/amzn2-ami-hvm-x86_64-gp2";

/// Template parameter through which the latest image id is resolved.
pub const LATEST_AMAZON_LINUX_PARAMETER: &str = "LatestAmazonLinuxImageId";

/// Which image an instance boots.
///
/// `LatestAmazonLinux` is not a value this crate knows: it is resolved by the
/// engine at deploy time, so two deployments of the same template may boot
/// different images. Use `Pinned` where reproducibility matters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineImage {
    #[default]
    LatestAmazonLinux,
    Pinned(String),
}

impl MachineImage {
    pub fn is_pinned(&self) -> bool {
        matches!(self, MachineImage::Pinned(_))
    }

    /// The `ImageId` value, declaring the SSM-backed parameter on first use.
    fn image_id(&self, stack: &mut Stack) -> StackResult<Value> {
        match self {
            MachineImage::Pinned(ami) => Ok(json!(ami)),
            MachineImage::LatestAmazonLinux => {
                stack.ensure_parameter(
                    LATEST_AMAZON_LINUX_PARAMETER,
                    Parameter {
                        param_type: "AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>".to_string(),
                        default: Some(LATEST_AMAZON_LINUX_SSM_PATH.to_string()),
                        description: Some("Latest Amazon Linux 2 image, resolved at deploy time".to_string()),
                    },
                )?;
                Ok(reference(LATEST_AMAZON_LINUX_PARAMETER))
            }
        }
    }
}

impl fmt::Display for MachineImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineImage::LatestAmazonLinux => write!(f, "latest Amazon Linux 2 (deploy-time)"),
            MachineImage::Pinned(ami) => write!(f, "{}", ami),
        }
    }
}

/// Where in the VPC an instance is placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetSelection {
    /// First tier of this kind.
    Kind(SubnetKind),
    /// Tier with this name.
    Named(String),
}

/// Declarative description of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub instance_type: String,
    pub image: MachineImage,
    pub subnets: SubnetSelection,
    pub key_name: Option<String>,
}

impl InstanceSpec {
    pub fn new(instance_type: impl Into<String>, subnets: SubnetSelection) -> Self {
        Self {
            instance_type: instance_type.into(),
            image: MachineImage::default(),
            subnets,
            key_name: None,
        }
    }

    pub fn with_image(mut self, image: MachineImage) -> Self {
        self.image = image;
        self
    }

    pub fn with_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = Some(key_name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub logical_id: String,
    pub subnet_kind: SubnetKind,
    pub subnet_id: String,
    pub security_group: SecurityGroupHandle,
    /// Gateway attachment of the instance's VPC, if it has one.
    pub gateway_attachment: Option<String>,
}

impl InstanceHandle {
    pub fn public_ip(&self) -> Value {
        get_att(&self.logical_id, "PublicIp")
    }

    pub fn private_ip(&self) -> Value {
        get_att(&self.logical_id, "PrivateIp")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticIpHandle {
    pub logical_id: String,
    pub association_id: String,
    pub instance_id: String,
}

impl ElasticIpHandle {
    /// The allocated address itself.
    pub fn address(&self) -> Value {
        reference(&self.logical_id)
    }
}

/// Declare an instance together with its role and instance profile.
pub fn declare_instance(
    stack: &mut Stack,
    id: &str,
    vpc: &VpcHandle,
    security_group: &SecurityGroupHandle,
    spec: &InstanceSpec,
) -> StackResult<InstanceHandle> {
    if !security_group.is_declared_in(stack) {
        return Err(StackError::UnknownSecurityGroup {
            group: id.to_string(),
            missing: security_group.logical_id().to_string(),
        });
    }

    let tier = match &spec.subnets {
        SubnetSelection::Kind(kind) => vpc.tier_of_kind(*kind)?,
        SubnetSelection::Named(name) => vpc.tier(name)?,
    };
    let subnet = tier.subnets.first().ok_or_else(|| StackError::SubnetTierNotFound {
        vpc: vpc.logical_id.clone(),
        tier: tier.name.clone(),
    })?;

    info!(
        "Declaring instance {} ({}, {} tier, image {})",
        id, spec.instance_type, tier.name, spec.image
    );

    let path = format!("{}/{}", stack.name(), id);
    let role_id = format!("{}InstanceRole", id);
    let profile_id = format!("{}InstanceProfile", id);

    stack.add_resource(
        &role_id,
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": {
                    "Statement": [{
                        "Action": "sts:AssumeRole",
                        "Effect": "Allow",
                        "Principal": { "Service": "ec2.amazonaws.com" },
                    }],
                    "Version": "2012-10-17",
                },
                "Tags": [{ "Key": "Name", "Value": path }],
            }),
        ),
    )?;
    stack.add_resource(
        &profile_id,
        Resource::new(
            "AWS::IAM::InstanceProfile",
            json!({ "Roles": [reference(&role_id)] }),
        ),
    )?;

    let image_id = spec.image.image_id(stack)?;

    let mut properties = Map::new();
    properties.insert("AvailabilityZone".to_string(), select_az(subnet.az_index));
    properties.insert("IamInstanceProfile".to_string(), reference(&profile_id));
    properties.insert("ImageId".to_string(), image_id);
    properties.insert("InstanceType".to_string(), json!(spec.instance_type));
    if let Some(key_name) = &spec.key_name {
        properties.insert("KeyName".to_string(), json!(key_name));
    }
    properties.insert("SecurityGroupIds".to_string(), json!([security_group.group_id()]));
    properties.insert("SubnetId".to_string(), reference(&subnet.logical_id));
    properties.insert("Tags".to_string(), json!([{ "Key": "Name", "Value": path }]));

    let mut instance = Resource::new("AWS::EC2::Instance", Value::Object(properties)).depends_on(&role_id);
    for dependency in &subnet.connectivity {
        instance = instance.depends_on(dependency);
    }
    stack.add_resource(id, instance)?;

    Ok(InstanceHandle {
        logical_id: id.to_string(),
        subnet_kind: tier.kind,
        subnet_id: subnet.logical_id.clone(),
        security_group: security_group.clone(),
        gateway_attachment: vpc.gateway_attachment.clone(),
    })
}

/// Allocate a static public address and bind it to the instance.
///
/// Only instances in a public tier can be reached through one.
pub fn declare_elastic_ip(stack: &mut Stack, id: &str, instance: &InstanceHandle) -> StackResult<ElasticIpHandle> {
    if instance.subnet_kind != SubnetKind::Public {
        return Err(StackError::InvalidNetwork(format!(
            "cannot bind elastic IP {} to {}: instance is in a {} tier",
            id, instance.logical_id, instance.subnet_kind
        )));
    }

    let association_id = format!("{}Association", id);
    let mut eip = Resource::new("AWS::EC2::EIP", json!({ "Domain": "vpc" }));
    if let Some(attachment) = &instance.gateway_attachment {
        eip = eip.depends_on(attachment);
    }
    stack.add_resource(id, eip)?;
    stack.add_resource(
        &association_id,
        Resource::new(
            "AWS::EC2::EIPAssociation",
            json!({
                "AllocationId": get_att(id, "AllocationId"),
                "InstanceId": reference(&instance.logical_id),
            }),
        ),
    )?;
    debug!("Bound elastic IP {} to {}", id, instance.logical_id);

    Ok(ElasticIpHandle {
        logical_id: id.to_string(),
        association_id,
        instance_id: instance.logical_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{declare_vpc, NetworkSpec, SubnetTier};
    use crate::security::{AccessControlPlan, SecurityGroupSpec};

    fn fixture() -> (Stack, VpcHandle, SecurityGroupHandle) {
        let mut stack = Stack::new("Test");
        let spec = NetworkSpec::new("10.0.0.0/16".parse().unwrap())
            .with_tier(SubnetTier::new("PublicSubnet", SubnetKind::Public, 24))
            .with_tier(SubnetTier::new("PrivateSubnet", SubnetKind::PrivateWithNat, 24));
        let vpc = declare_vpc(&mut stack, "MyVpc", &spec).unwrap();
        let mut plan = AccessControlPlan::new();
        let sg = plan.add(SecurityGroupSpec::new("SG", &vpc, "sg")).unwrap();
        plan.materialize(&mut stack).unwrap();
        (stack, vpc, sg)
    }

    #[test]
    fn test_latest_image_is_a_deploy_time_parameter() {
        let (mut stack, vpc, sg) = fixture();
        let spec = InstanceSpec::new("t2.micro", SubnetSelection::Kind(SubnetKind::Public));
        declare_instance(&mut stack, "A", &vpc, &sg, &spec).unwrap();
        declare_instance(&mut stack, "B", &vpc, &sg, &spec).unwrap();

        let template = stack.to_template();
        assert_eq!(template.parameters.len(), 1);
        let param = &template.parameters[LATEST_AMAZON_LINUX_PARAMETER];
        assert_eq!(param.default.as_deref(), Some(LATEST_AMAZON_LINUX_SSM_PATH));
        assert_eq!(
            template.resource("A").unwrap().property("ImageId"),
            Some(&reference(LATEST_AMAZON_LINUX_PARAMETER))
        );
    }

    #[test]
    fn test_pinned_image_is_literal() {
        let (mut stack, vpc, sg) = fixture();
        let spec = InstanceSpec::new("t2.micro", SubnetSelection::Kind(SubnetKind::Public))
            .with_image(MachineImage::Pinned("ami-0123456789abcdef0".to_string()));
        declare_instance(&mut stack, "A", &vpc, &sg, &spec).unwrap();

        let template = stack.to_template();
        assert!(template.parameters.is_empty());
        assert!(template.has_resource_properties(
            "AWS::EC2::Instance",
            &json!({ "ImageId": "ami-0123456789abcdef0" })
        ));
    }

    #[test]
    fn test_instance_placement_and_key() {
        let (mut stack, vpc, sg) = fixture();
        let spec = InstanceSpec::new("t2.micro", SubnetSelection::Named("PrivateSubnet".to_string()))
            .with_key_name("lab-key");
        let handle = declare_instance(&mut stack, "Backend", &vpc, &sg, &spec).unwrap();

        assert_eq!(handle.subnet_kind, SubnetKind::PrivateWithNat);
        assert_eq!(handle.subnet_id, "MyVpcPrivateSubnetSubnet1");
        let instance = stack.resource("Backend").unwrap();
        assert_eq!(instance.property("KeyName"), Some(&json!("lab-key")));
        assert_eq!(instance.property("SecurityGroupIds"), Some(&json!([sg.group_id()])));
        assert_eq!(
            instance.depends_on,
            vec![
                "BackendInstanceRole".to_string(),
                "MyVpcPrivateSubnetSubnet1RouteTableAssociation".to_string(),
                "MyVpcPrivateSubnetSubnet1DefaultRoute".to_string(),
            ]
        );
        assert!(stack.contains("BackendInstanceProfile"));
    }

    #[test]
    fn test_undeclared_security_group_is_rejected() {
        let (mut stack, vpc, _) = fixture();
        let spec = InstanceSpec::new("t2.micro", SubnetSelection::Kind(SubnetKind::Public));
        let missing = SecurityGroupHandle::named("Nope");
        assert!(matches!(
            declare_instance(&mut stack, "A", &vpc, &missing, &spec),
            Err(StackError::UnknownSecurityGroup { .. })
        ));
    }

    #[test]
    fn test_non_group_resource_is_not_a_security_group() {
        let (mut stack, vpc, _) = fixture();
        let spec = InstanceSpec::new("t2.micro", SubnetSelection::Kind(SubnetKind::Public));
        let not_a_group = SecurityGroupHandle::named("MyVpc");
        assert!(matches!(
            declare_instance(&mut stack, "A", &vpc, &not_a_group, &spec),
            Err(StackError::UnknownSecurityGroup { ref missing, .. }) if missing == "MyVpc"
        ));
        assert!(!stack.contains("A"));
    }

    #[test]
    fn test_unknown_tier_is_rejected() {
        let (mut stack, vpc, sg) = fixture();
        let spec = InstanceSpec::new("t2.micro", SubnetSelection::Named("Isolated".to_string()));
        assert!(matches!(
            declare_instance(&mut stack, "A", &vpc, &sg, &spec),
            Err(StackError::SubnetTierNotFound { .. })
        ));
    }

    #[test]
    fn test_elastic_ip_binding() {
        let (mut stack, vpc, sg) = fixture();
        let spec = InstanceSpec::new("t2.micro", SubnetSelection::Kind(SubnetKind::Public));
        let instance = declare_instance(&mut stack, "Bastion", &vpc, &sg, &spec).unwrap();
        let eip = declare_elastic_ip(&mut stack, "BastionEIP", &instance).unwrap();

        assert_eq!(eip.association_id, "BastionEIPAssociation");
        let assoc = stack.resource("BastionEIPAssociation").unwrap();
        assert_eq!(assoc.property("InstanceId"), Some(&reference("Bastion")));
        assert_eq!(assoc.property("AllocationId"), Some(&get_att("BastionEIP", "AllocationId")));
        assert_eq!(
            stack.resource("BastionEIP").unwrap().depends_on,
            vec!["MyVpcVPCGW".to_string()]
        );
        assert!(stack
            .resource("Bastion")
            .unwrap()
            .depends_on
            .contains(&"MyVpcPublicSubnetSubnet1DefaultRoute".to_string()));
    }

    #[test]
    fn test_elastic_ip_on_private_instance_is_rejected() {
        let (mut stack, vpc, sg) = fixture();
        let spec = InstanceSpec::new("t2.micro", SubnetSelection::Kind(SubnetKind::PrivateWithNat));
        let instance = declare_instance(&mut stack, "Backend", &vpc, &sg, &spec).unwrap();
        assert!(declare_elastic_ip(&mut stack, "BackendEIP", &instance).is_err());
    }
}

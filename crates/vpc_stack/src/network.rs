//! Network builder: one VPC with public and NAT-routed private tiers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cidr::{CidrAllocator, Ipv4Cidr};
use crate::error::{StackError, StackResult};
use crate::stack::Stack;
use crate::template::{get_att, reference, select_az, Resource};

/// How a subnet tier reaches (and is reached from) the internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetKind {
    /// Routed through the internet gateway; instances may hold public IPs.
    Public,
    /// Egress only, through a NAT gateway in a public tier.
    PrivateWithNat,
}

impl SubnetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubnetKind::Public => "Public",
            SubnetKind::PrivateWithNat => "Private",
        }
    }
}

impl std::fmt::Display for SubnetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One subnet per zone is created for each tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetTier {
    pub name: String,
    pub kind: SubnetKind,
    pub cidr_mask: u8,
}

impl SubnetTier {
    pub fn new(name: impl Into<String>, kind: SubnetKind, cidr_mask: u8) -> Self {
        Self {
            name: name.into(),
            kind,
            cidr_mask,
        }
    }
}

/// Declarative description of the VPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub cidr: Ipv4Cidr,
    pub max_azs: usize,
    pub nat_gateways: usize,
    pub tiers: Vec<SubnetTier>,
}

impl NetworkSpec {
    pub fn new(cidr: Ipv4Cidr) -> Self {
        Self {
            cidr,
            max_azs: 3,
            nat_gateways: 1,
            tiers: Vec::new(),
        }
    }

    pub fn with_max_azs(mut self, max_azs: usize) -> Self {
        self.max_azs = max_azs;
        self
    }

    pub fn with_nat_gateways(mut self, nat_gateways: usize) -> Self {
        self.nat_gateways = nat_gateways;
        self
    }

    pub fn with_tier(mut self, tier: SubnetTier) -> Self {
        self.tiers.push(tier);
        self
    }

    fn has_kind(&self, kind: SubnetKind) -> bool {
        self.tiers.iter().any(|t| t.kind == kind)
    }

    /// Check the layout before anything is declared.
    pub fn validate(&self) -> StackResult<()> {
        let invalid = |msg: String| Err(StackError::InvalidNetwork(msg));

        if !(16..=28).contains(&self.cidr.prefix()) {
            return invalid(format!("VPC range {} must be between /16 and /28", self.cidr));
        }
        if !self.cidr.is_aligned() {
            return invalid(format!(
                "VPC range {} has host bits set; use {}",
                self.cidr,
                self.cidr.normalized()
            ));
        }
        if self.max_azs == 0 {
            return invalid("at least one availability zone is required".to_string());
        }
        if self.tiers.is_empty() {
            return invalid("at least one subnet tier is required".to_string());
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            if tier.name.is_empty() || !tier.name.chars().all(|c| c.is_ascii_alphanumeric()) {
                return invalid(format!("tier name must be alphanumeric: {:?}", tier.name));
            }
            if self.tiers[..i].iter().any(|t| t.name == tier.name) {
                return invalid(format!("duplicate tier name: {}", tier.name));
            }
            if tier.cidr_mask < self.cidr.prefix() || tier.cidr_mask > 28 {
                return invalid(format!(
                    "tier {} mask /{} must be between /{} and /28",
                    tier.name,
                    tier.cidr_mask,
                    self.cidr.prefix()
                ));
            }
        }
        if self.nat_gateways > 0 && !self.has_kind(SubnetKind::Public) {
            return invalid("NAT gateways need a public tier to live in".to_string());
        }
        if self.has_kind(SubnetKind::PrivateWithNat) && self.nat_gateways == 0 {
            return invalid("private tiers need at least one NAT gateway".to_string());
        }
        if self.nat_gateways > self.max_azs {
            return invalid(format!(
                "{} NAT gateways requested for {} zones",
                self.nat_gateways, self.max_azs
            ));
        }
        Ok(())
    }
}

/// One declared subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRef {
    pub logical_id: String,
    pub route_table_id: String,
    pub az_index: usize,
    pub cidr: Ipv4Cidr,
    /// Route table association and default route; anything placed in the
    /// subnet that needs the internet waits for these.
    pub connectivity: Vec<String>,
}

/// All subnets of one tier, ordered by zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierHandle {
    pub name: String,
    pub kind: SubnetKind,
    pub subnets: Vec<SubnetRef>,
}

/// Handle to a declared VPC, consumed by the downstream builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpcHandle {
    pub logical_id: String,
    pub cidr: Ipv4Cidr,
    pub tiers: Vec<TierHandle>,
    /// Internet gateway attachment, present when the VPC has a public tier.
    pub gateway_attachment: Option<String>,
}

impl VpcHandle {
    pub fn vpc_ref(&self) -> Value {
        reference(&self.logical_id)
    }

    pub fn tier(&self, name: &str) -> StackResult<&TierHandle> {
        self.tiers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| StackError::SubnetTierNotFound {
                vpc: self.logical_id.clone(),
                tier: name.to_string(),
            })
    }

    /// First tier of the given kind.
    pub fn tier_of_kind(&self, kind: SubnetKind) -> StackResult<&TierHandle> {
        self.tiers
            .iter()
            .find(|t| t.kind == kind)
            .ok_or_else(|| StackError::SubnetTierNotFound {
                vpc: self.logical_id.clone(),
                tier: kind.to_string(),
            })
    }
}

fn gateway_attachment_id(vpc_id: &str) -> String {
    format!("{}VPCGW", vpc_id)
}

fn default_route_id(subnet_id: &str) -> String {
    format!("{}DefaultRoute", subnet_id)
}

fn name_tag(value: &str) -> Value {
    json!({ "Key": "Name", "Value": value })
}

/// Declare the VPC and everything that makes its tiers routable.
pub fn declare_vpc(stack: &mut Stack, id: &str, spec: &NetworkSpec) -> StackResult<VpcHandle> {
    spec.validate()?;
    info!(
        "Declaring VPC {} ({}, {} zones, {} NAT gateways)",
        id, spec.cidr, spec.max_azs, spec.nat_gateways
    );

    let path = format!("{}/{}", stack.name(), id);
    stack.add_resource(
        id,
        Resource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": spec.cidr.to_string(),
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "InstanceTenancy": "default",
                "Tags": [name_tag(&path)],
            }),
        ),
    )?;

    // Every tier gets a default route once the VPC has a public tier.
    let routed = spec.has_kind(SubnetKind::Public);
    let mut allocator = CidrAllocator::new(spec.cidr);
    let mut tiers = Vec::with_capacity(spec.tiers.len());

    for tier in &spec.tiers {
        let mut subnets = Vec::with_capacity(spec.max_azs);
        for az in 0..spec.max_azs {
            let cidr = allocator.allocate(tier.cidr_mask)?;
            let subnet_id = format!("{}{}Subnet{}", id, tier.name, az + 1);
            let route_table_id = format!("{}RouteTable", subnet_id);
            let association_id = format!("{}RouteTableAssociation", subnet_id);

            stack.add_resource(
                &subnet_id,
                Resource::new(
                    "AWS::EC2::Subnet",
                    json!({
                        "AvailabilityZone": select_az(az),
                        "CidrBlock": cidr.to_string(),
                        "MapPublicIpOnLaunch": tier.kind == SubnetKind::Public,
                        "Tags": [
                            { "Key": "aws-cdk:subnet-name", "Value": tier.name },
                            { "Key": "aws-cdk:subnet-type", "Value": tier.kind.as_str() },
                            name_tag(&format!("{}/{}Subnet{}", path, tier.name, az + 1)),
                        ],
                        "VpcId": reference(id),
                    }),
                ),
            )?;
            stack.add_resource(
                &route_table_id,
                Resource::new(
                    "AWS::EC2::RouteTable",
                    json!({
                        "Tags": [name_tag(&format!("{}/{}Subnet{}", path, tier.name, az + 1))],
                        "VpcId": reference(id),
                    }),
                ),
            )?;
            stack.add_resource(
                &association_id,
                Resource::new(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({
                        "RouteTableId": reference(&route_table_id),
                        "SubnetId": reference(&subnet_id),
                    }),
                ),
            )?;

            debug!("Subnet {} -> {} (zone {})", subnet_id, cidr, az);
            let mut connectivity = vec![association_id];
            if routed {
                connectivity.push(default_route_id(&subnet_id));
            }
            subnets.push(SubnetRef {
                logical_id: subnet_id,
                route_table_id,
                az_index: az,
                cidr,
                connectivity,
            });
        }
        tiers.push(TierHandle {
            name: tier.name.clone(),
            kind: tier.kind,
            subnets,
        });
    }

    let handle = VpcHandle {
        logical_id: id.to_string(),
        cidr: spec.cidr,
        tiers,
        gateway_attachment: routed.then(|| gateway_attachment_id(id)),
    };

    if handle.tiers.iter().any(|t| t.kind == SubnetKind::Public) {
        declare_internet_routing(stack, &handle, spec.nat_gateways)?;
    }

    Ok(handle)
}

/// Internet gateway, public default routes, NAT gateways and the private
/// default routes that use them.
fn declare_internet_routing(stack: &mut Stack, vpc: &VpcHandle, nat_gateways: usize) -> StackResult<()> {
    let id = &vpc.logical_id;
    let igw_id = format!("{}IGW", id);
    let attachment_id = gateway_attachment_id(id);

    stack.add_resource(
        &igw_id,
        Resource::new(
            "AWS::EC2::InternetGateway",
            json!({ "Tags": [name_tag(&format!("{}/{}", stack.name(), id))] }),
        ),
    )?;
    stack.add_resource(
        &attachment_id,
        Resource::new(
            "AWS::EC2::VPCGatewayAttachment",
            json!({
                "InternetGatewayId": reference(&igw_id),
                "VpcId": reference(id),
            }),
        ),
    )?;

    for tier in vpc.tiers.iter().filter(|t| t.kind == SubnetKind::Public) {
        for subnet in &tier.subnets {
            stack.add_resource(
                default_route_id(&subnet.logical_id),
                Resource::new(
                    "AWS::EC2::Route",
                    json!({
                        "DestinationCidrBlock": "0.0.0.0/0",
                        "GatewayId": reference(&igw_id),
                        "RouteTableId": reference(&subnet.route_table_id),
                    }),
                )
                .depends_on(&attachment_id),
            )?;
        }
    }

    // NAT gateways go into the first public tier, one per zone from the start.
    let public = vpc.tier_of_kind(SubnetKind::Public)?;
    let mut nat_ids = Vec::with_capacity(nat_gateways);
    for subnet in public.subnets.iter().take(nat_gateways) {
        let eip_id = format!("{}EIP", subnet.logical_id);
        let nat_id = format!("{}NATGateway", subnet.logical_id);

        stack.add_resource(
            &eip_id,
            Resource::new(
                "AWS::EC2::EIP",
                json!({
                    "Domain": "vpc",
                    "Tags": [name_tag(&format!("{}/{}", stack.name(), subnet.logical_id))],
                }),
            ),
        )?;
        stack.add_resource(
            &nat_id,
            Resource::new(
                "AWS::EC2::NatGateway",
                json!({
                    "AllocationId": get_att(&eip_id, "AllocationId"),
                    "SubnetId": reference(&subnet.logical_id),
                    "Tags": [name_tag(&format!("{}/{}", stack.name(), subnet.logical_id))],
                }),
            )
            .depends_on(default_route_id(&subnet.logical_id))
            .depends_on(format!("{}RouteTableAssociation", subnet.logical_id)),
        )?;
        nat_ids.push(nat_id);
    }

    if nat_ids.is_empty() {
        return Ok(());
    }

    for tier in vpc.tiers.iter().filter(|t| t.kind == SubnetKind::PrivateWithNat) {
        for subnet in &tier.subnets {
            let nat_id = &nat_ids[subnet.az_index % nat_ids.len()];
            stack.add_resource(
                default_route_id(&subnet.logical_id),
                Resource::new(
                    "AWS::EC2::Route",
                    json!({
                        "DestinationCidrBlock": "0.0.0.0/0",
                        "NatGatewayId": reference(nat_id),
                        "RouteTableId": reference(&subnet.route_table_id),
                    }),
                ),
            )?;
        }
    }

    Ok(())
}

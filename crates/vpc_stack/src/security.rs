//! Access-control builder: security groups and their allow-rules.
//!
//! Groups are staged in an [`AccessControlPlan`] and only written to the
//! stack by [`AccessControlPlan::materialize`]. Rules may therefore name a
//! group that is declared later in the plan; what matters is that every
//! referenced group is declared by the time the plan is materialized.
//!
//! Rules with a CIDR peer are inlined into the group. Rules with a group peer
//! become standalone ingress/egress resources, ordered by a topological sort
//! so that each one follows both groups it connects. Mutual references such
//! as frontend egress to backend plus backend ingress from frontend are
//! legal.

use std::collections::HashMap;
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::cidr::Ipv4Cidr;
use crate::error::{StackError, StackResult};
use crate::network::VpcHandle;
use crate::stack::Stack;
use crate::template::{get_att, Resource};

/// Protocol and port range of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortSpec {
    Tcp(u16),
    TcpRange(u16, u16),
    Udp(u16),
    AllTraffic,
    IcmpAll,
}

impl PortSpec {
    /// `IpProtocol`, `FromPort`, `ToPort` as the template expects them.
    fn fields(&self) -> (&'static str, Option<i32>, Option<i32>) {
        match *self {
            PortSpec::Tcp(p) => ("tcp", Some(p as i32), Some(p as i32)),
            PortSpec::TcpRange(from, to) => ("tcp", Some(from as i32), Some(to as i32)),
            PortSpec::Udp(p) => ("udp", Some(p as i32), Some(p as i32)),
            PortSpec::AllTraffic => ("-1", None, None),
            PortSpec::IcmpAll => ("icmp", Some(-1), Some(-1)),
        }
    }

    fn write_fields(&self, entry: &mut Map<String, Value>) {
        let (protocol, from, to) = self.fields();
        entry.insert("IpProtocol".to_string(), json!(protocol));
        if let Some(from) = from {
            entry.insert("FromPort".to_string(), json!(from));
        }
        if let Some(to) = to {
            entry.insert("ToPort".to_string(), json!(to));
        }
    }

    fn id_suffix(&self) -> String {
        match *self {
            PortSpec::Tcp(p) => p.to_string(),
            PortSpec::TcpRange(from, to) => format!("{}to{}", from, to),
            PortSpec::Udp(p) => format!("Udp{}", p),
            PortSpec::AllTraffic => "AllTraffic".to_string(),
            PortSpec::IcmpAll => "IcmpAll".to_string(),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PortSpec::Tcp(p) => write!(f, "tcp/{}", p),
            PortSpec::TcpRange(from, to) => write!(f, "tcp/{}-{}", from, to),
            PortSpec::Udp(p) => write!(f, "udp/{}", p),
            PortSpec::AllTraffic => write!(f, "all traffic"),
            PortSpec::IcmpAll => write!(f, "icmp"),
        }
    }
}

pub const SECURITY_GROUP_TYPE: &str = "AWS::EC2::SecurityGroup";

/// Handle to a security group, identified by its logical id.
///
/// A handle can be created for a group that has not been declared yet; the
/// plan rejects it at materialization if it never is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecurityGroupHandle(String);

impl SecurityGroupHandle {
    pub fn named(logical_id: impl Into<String>) -> Self {
        Self(logical_id.into())
    }

    pub fn logical_id(&self) -> &str {
        &self.0
    }

    /// `Fn::GetAtt <id>.GroupId`
    pub fn group_id(&self) -> Value {
        get_att(&self.0, "GroupId")
    }

    /// True only if `stack` declares this id as a security group.
    pub fn is_declared_in(&self, stack: &Stack) -> bool {
        stack.resource(&self.0).map(|r| r.resource_type.as_str()) == Some(SECURITY_GROUP_TYPE)
    }
}

impl fmt::Display for SecurityGroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The other end of a rule. There is no implicit default: a group that
/// should talk to itself names itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    Cidr(Ipv4Cidr),
    Group(SecurityGroupHandle),
}

impl Peer {
    pub fn any_ipv4() -> Self {
        Peer::Cidr(Ipv4Cidr::any())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub peer: Peer,
    pub port: PortSpec,
    pub description: String,
}

impl Rule {
    pub fn new(peer: Peer, port: PortSpec, description: impl Into<String>) -> Self {
        Self {
            peer,
            port,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

/// Declarative description of one security group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupSpec {
    pub logical_id: String,
    pub vpc_id: String,
    pub description: String,
    pub allow_all_outbound: bool,
    pub ingress: Vec<Rule>,
    pub egress: Vec<Rule>,
}

impl SecurityGroupSpec {
    pub fn new(logical_id: impl Into<String>, vpc: &VpcHandle, description: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            vpc_id: vpc.logical_id.clone(),
            description: description.into(),
            allow_all_outbound: false,
            ingress: Vec::new(),
            egress: Vec::new(),
        }
    }

    pub fn allow_all_outbound(mut self, allow: bool) -> Self {
        self.allow_all_outbound = allow;
        self
    }

    pub fn with_ingress(mut self, rule: Rule) -> Self {
        self.ingress.push(rule);
        self
    }

    pub fn with_egress(mut self, rule: Rule) -> Self {
        self.egress.push(rule);
        self
    }

    pub fn handle(&self) -> SecurityGroupHandle {
        SecurityGroupHandle::named(&self.logical_id)
    }

    fn rules(&self, direction: Direction) -> &[Rule] {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PlanNode {
    Group(usize),
    Rule {
        group: usize,
        direction: Direction,
        index: usize,
    },
}

/// Security groups staged for one stack.
#[derive(Debug, Default)]
pub struct AccessControlPlan {
    groups: Vec<SecurityGroupSpec>,
}

impl AccessControlPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a group. Fails if a group with the same id is already staged.
    ///
    /// A rule repeating the peer and port of an earlier rule in the same
    /// direction is dropped; the first description wins.
    pub fn add(&mut self, mut spec: SecurityGroupSpec) -> StackResult<SecurityGroupHandle> {
        if self.groups.iter().any(|g| g.logical_id == spec.logical_id) {
            return Err(StackError::DuplicateLogicalId(spec.logical_id));
        }
        dedup_rules(&spec.logical_id, &mut spec.ingress);
        dedup_rules(&spec.logical_id, &mut spec.egress);
        debug!(
            "Staged security group {} ({} ingress, {} egress)",
            spec.logical_id,
            spec.ingress.len(),
            spec.egress.len()
        );
        let handle = spec.handle();
        self.groups.push(spec);
        Ok(handle)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[SecurityGroupSpec] {
        &self.groups
    }

    /// Dependency graph over groups and group-referencing rules.
    ///
    /// A peer may also be a group that an earlier plan already wrote to the
    /// stack; such a peer adds no edge.
    fn dependency_graph(&self, stack: &Stack) -> StackResult<DiGraph<PlanNode, ()>> {
        let mut graph = DiGraph::new();
        let mut group_nodes: HashMap<&str, NodeIndex> = HashMap::new();

        for (i, spec) in self.groups.iter().enumerate() {
            group_nodes.insert(spec.logical_id.as_str(), graph.add_node(PlanNode::Group(i)));
        }

        for (i, spec) in self.groups.iter().enumerate() {
            for direction in [Direction::Ingress, Direction::Egress] {
                for (index, rule) in spec.rules(direction).iter().enumerate() {
                    let Peer::Group(peer) = &rule.peer else {
                        continue;
                    };
                    let peer_node = group_nodes.get(peer.logical_id()).copied();
                    if peer_node.is_none() && !peer.is_declared_in(stack) {
                        return Err(StackError::UnknownSecurityGroup {
                            group: spec.logical_id.clone(),
                            missing: peer.logical_id().to_string(),
                        });
                    }
                    if direction == Direction::Egress && spec.allow_all_outbound {
                        continue;
                    }
                    let owner_node = group_nodes[spec.logical_id.as_str()];
                    let rule_node = graph.add_node(PlanNode::Rule {
                        group: i,
                        direction,
                        index,
                    });
                    graph.add_edge(owner_node, rule_node, ());
                    if let Some(peer_node) = peer_node.filter(|n| *n != owner_node) {
                        graph.add_edge(peer_node, rule_node, ());
                    }
                }
            }
        }

        Ok(graph)
    }

    /// Write every staged group and rule to the stack in dependency order.
    pub fn materialize(&self, stack: &mut Stack) -> StackResult<()> {
        let graph = self.dependency_graph(stack)?;
        // Edges only run from groups to rules, so the sort cannot fail today.
        let order = toposort(&graph, None).map_err(|cycle| {
            StackError::DependencyCycle(format!("{:?}", graph[cycle.node_id()]))
        })?;

        info!(
            "Materializing {} security groups ({} graph nodes)",
            self.groups.len(),
            order.len()
        );

        for node in order {
            match graph[node] {
                PlanNode::Group(i) => self.declare_group(stack, &self.groups[i])?,
                PlanNode::Rule {
                    group,
                    direction,
                    index,
                } => {
                    let spec = &self.groups[group];
                    self.declare_rule(stack, spec, direction, &spec.rules(direction)[index])?
                }
            }
        }
        Ok(())
    }

    fn declare_group(&self, stack: &mut Stack, spec: &SecurityGroupSpec) -> StackResult<()> {
        let ingress: Vec<Value> = spec
            .ingress
            .iter()
            .filter_map(|rule| match &rule.peer {
                Peer::Cidr(cidr) => Some(cidr_entry(cidr, rule)),
                Peer::Group(_) => None,
            })
            .collect();

        let egress: Vec<Value> = if spec.allow_all_outbound {
            for rule in &spec.egress {
                warn!(
                    "Ignoring egress rule '{}' on {}: all outbound traffic is already allowed",
                    rule.description, spec.logical_id
                );
            }
            vec![json!({
                "CidrIp": "0.0.0.0/0",
                "Description": "Allow all outbound traffic by default",
                "IpProtocol": "-1",
            })]
        } else {
            let inline: Vec<Value> = spec
                .egress
                .iter()
                .filter_map(|rule| match &rule.peer {
                    Peer::Cidr(cidr) => Some(cidr_entry(cidr, rule)),
                    Peer::Group(_) => None,
                })
                .collect();
            // An omitted egress list means allow-all to the engine.
            if inline.is_empty() {
                vec![json!({
                    "CidrIp": "255.255.255.255/32",
                    "Description": "Disallow all traffic",
                    "FromPort": 252,
                    "IpProtocol": "icmp",
                    "ToPort": 86,
                })]
            } else {
                inline
            }
        };

        let mut properties = Map::new();
        properties.insert("GroupDescription".to_string(), json!(spec.description));
        if !ingress.is_empty() {
            properties.insert("SecurityGroupIngress".to_string(), Value::Array(ingress));
        }
        if !egress.is_empty() {
            properties.insert("SecurityGroupEgress".to_string(), Value::Array(egress));
        }
        properties.insert("VpcId".to_string(), json!({ "Ref": spec.vpc_id }));

        stack.add_resource(
            &spec.logical_id,
            Resource::new(SECURITY_GROUP_TYPE, Value::Object(properties)),
        )
    }

    fn declare_rule(
        &self,
        stack: &mut Stack,
        spec: &SecurityGroupSpec,
        direction: Direction,
        rule: &Rule,
    ) -> StackResult<()> {
        let Peer::Group(peer) = &rule.peer else {
            return Ok(());
        };
        let owner = spec.handle();

        let mut properties = Map::new();
        properties.insert("Description".to_string(), json!(rule.description));
        properties.insert("GroupId".to_string(), owner.group_id());
        rule.port.write_fields(&mut properties);

        let (resource_type, logical_id) = match direction {
            Direction::Ingress => {
                properties.insert("SourceSecurityGroupId".to_string(), peer.group_id());
                (
                    "AWS::EC2::SecurityGroupIngress",
                    format!("{}from{}{}", owner, peer, rule.port.id_suffix()),
                )
            }
            Direction::Egress => {
                properties.insert("DestinationSecurityGroupId".to_string(), peer.group_id());
                (
                    "AWS::EC2::SecurityGroupEgress",
                    format!("{}to{}{}", owner, peer, rule.port.id_suffix()),
                )
            }
        };

        stack.add_resource(logical_id, Resource::new(resource_type, Value::Object(properties)))
    }
}

fn dedup_rules(group: &str, rules: &mut Vec<Rule>) {
    let mut seen: Vec<(Peer, PortSpec)> = Vec::with_capacity(rules.len());
    rules.retain(|rule| {
        let key = (rule.peer.clone(), rule.port);
        if seen.contains(&key) {
            debug!("Skipping duplicate rule '{}' on {}", rule.description, group);
            false
        } else {
            seen.push(key);
            true
        }
    });
}

fn cidr_entry(cidr: &Ipv4Cidr, rule: &Rule) -> Value {
    let mut entry = Map::new();
    entry.insert("CidrIp".to_string(), json!(cidr.to_string()));
    entry.insert("Description".to_string(), json!(rule.description));
    rule.port.write_fields(&mut entry);
    Value::Object(entry)
}

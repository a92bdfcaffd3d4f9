//! Checks a synthesized template against the intended topology.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, info};

use crate::cidr::Ipv4Cidr;
use crate::storage::AUTO_DELETE_RESOURCE_TYPE;
use crate::template::{get_att_target, ref_target, RemovalPolicy, Template};
use crate::topology::{BACKEND_SG, BASTION_SG, FRONTEND_SG, HTTP_PORT, SSH_PORT};

/// Outcome of validating one template.
#[derive(Debug)]
pub struct ValidationReport {
    pub checks: Vec<ValidationCheck>,
    pub passed: bool,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            checks: Vec::new(),
            passed: true,
        }
    }

    pub fn add_check(&mut self, name: &str, passed: bool, message: &str) {
        if !passed {
            self.passed = false;
        }
        self.checks.push(ValidationCheck {
            name: name.to_string(),
            passed,
            message: message.to_string(),
        });
    }

    pub fn check(&self, name: &str) -> Option<&ValidationCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

/// Validator for the VPC setup topology.
#[derive(Debug, Default)]
pub struct TopologyValidator {
    operator_cidr: Option<Ipv4Cidr>,
}

impl TopologyValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also require the bastion SSH rule to admit exactly this range.
    pub fn with_operator_cidr(mut self, cidr: Ipv4Cidr) -> Self {
        self.operator_cidr = Some(cidr);
        self
    }

    pub fn validate(&self, template: &Template) -> ValidationReport {
        let mut report = ValidationReport::new();

        self.check_resource_counts(template, &mut report);
        self.check_references(template, &mut report);
        self.check_backend_ingress(template, &mut report);
        self.check_frontend_ingress(template, &mut report);
        self.check_bastion_ingress(template, &mut report);
        self.check_instance_exposure(template, &mut report);
        self.check_buckets(template, &mut report);

        info!(
            "Validation {}: {} checks, {} failed",
            if report.passed { "passed" } else { "failed" },
            report.checks.len(),
            report.failures().count()
        );
        report
    }

    fn check_resource_counts(&self, template: &Template, report: &mut ValidationReport) {
        let expected = [
            ("AWS::EC2::VPC", 1),
            ("AWS::EC2::SecurityGroup", 3),
            ("AWS::EC2::Instance", 3),
            ("AWS::S3::Bucket", 1),
            ("AWS::EC2::EIPAssociation", 2),
        ];
        let mismatches: Vec<String> = expected
            .iter()
            .filter(|(t, n)| !template.resource_count_is(t, *n))
            .map(|(t, n)| format!("{}: expected {}, found {}", t, n, template.resource_count(t)))
            .collect();

        if mismatches.is_empty() {
            report.add_check("resource-counts", true, "Expected resource counts");
        } else {
            report.add_check("resource-counts", false, &mismatches.join("; "));
        }
    }

    /// Every `Ref`, `Fn::GetAtt` and `DependsOn` names something declared.
    fn check_references(&self, template: &Template, report: &mut ValidationReport) {
        let mut declared: HashSet<&str> = template.resources.keys().map(String::as_str).collect();
        declared.extend(template.parameters.keys().map(String::as_str));

        let mut dangling = Vec::new();
        for (id, resource) in &template.resources {
            let mut targets = Vec::new();
            collect_references(&resource.properties, &mut targets);
            targets.extend(resource.depends_on.iter().map(String::as_str));
            for target in targets {
                if !target.starts_with("AWS::") && !declared.contains(target) {
                    dangling.push(format!("{} -> {}", id, target));
                }
            }
        }
        for (name, output) in &template.outputs {
            let mut targets = Vec::new();
            collect_references(&output.value, &mut targets);
            for target in targets.into_iter().filter(|t| !declared.contains(t)) {
                dangling.push(format!("output {} -> {}", name, target));
            }
        }

        if dangling.is_empty() {
            report.add_check("references", true, "All references resolve");
        } else {
            report.add_check("references", false, &format!("Dangling: {}", dangling.join(", ")));
        }
    }

    fn check_backend_ingress(&self, template: &Template, report: &mut ValidationReport) {
        let open: Vec<&Value> = inline_ingress(template, BACKEND_SG)
            .into_iter()
            .filter(|rule| is_unrestricted(rule))
            .collect();

        if open.is_empty() {
            report.add_check("backend-ingress", true, "Backend accepts no traffic from 0.0.0.0/0");
        } else {
            report.add_check(
                "backend-ingress",
                false,
                &format!("Backend has {} unrestricted ingress rules", open.len()),
            );
        }
    }

    fn check_frontend_ingress(&self, template: &Template, report: &mut ValidationReport) {
        let open: Vec<&Value> = inline_ingress(template, FRONTEND_SG)
            .into_iter()
            .filter(|rule| is_unrestricted(rule))
            .collect();
        let http_only = !open.is_empty() && open.iter().all(|rule| is_tcp_port(rule, HTTP_PORT));

        if http_only {
            report.add_check("frontend-ingress", true, "Frontend is open to the internet on HTTP only");
        } else {
            report.add_check(
                "frontend-ingress",
                false,
                "Frontend must be open to 0.0.0.0/0 on HTTP and nothing else",
            );
        }
    }

    fn check_bastion_ingress(&self, template: &Template, report: &mut ValidationReport) {
        let ssh: Vec<&Value> = inline_ingress(template, BASTION_SG)
            .into_iter()
            .filter(|rule| is_tcp_port(rule, SSH_PORT))
            .collect();

        let restricted = !ssh.is_empty() && !ssh.iter().any(|rule| is_unrestricted(rule));
        let matches_operator = match &self.operator_cidr {
            Some(cidr) => ssh
                .iter()
                .all(|rule| rule.get("CidrIp").and_then(Value::as_str) == Some(cidr.to_string().as_str())),
            None => true,
        };

        if restricted && matches_operator {
            report.add_check("bastion-ingress", true, "Bastion SSH is limited to the operator address");
        } else {
            report.add_check(
                "bastion-ingress",
                false,
                "Bastion SSH must be limited to the operator address",
            );
        }
    }

    /// Instances in public subnets have an elastic IP; private ones do not.
    fn check_instance_exposure(&self, template: &Template, report: &mut ValidationReport) {
        let bound: HashSet<&str> = template
            .resources_of_type("AWS::EC2::EIPAssociation")
            .filter_map(|(_, r)| r.property("InstanceId").and_then(ref_target))
            .collect();

        let mut problems = Vec::new();
        for (id, instance) in template.resources_of_type("AWS::EC2::Instance") {
            let public = instance
                .property("SubnetId")
                .and_then(ref_target)
                .and_then(|subnet| template.resource(subnet))
                .and_then(|subnet| subnet.property("MapPublicIpOnLaunch"))
                .and_then(Value::as_bool);

            match (public, bound.contains(id)) {
                (None, _) => problems.push(format!("{} is not placed in a declared subnet", id)),
                (Some(true), false) => problems.push(format!("{} is public but has no elastic IP", id)),
                (Some(false), true) => problems.push(format!("{} is private but has an elastic IP", id)),
                _ => debug!("{} exposure matches its subnet tier", id),
            }
        }

        if problems.is_empty() {
            report.add_check("instance-exposure", true, "Instance exposure matches subnet tiers");
        } else {
            report.add_check("instance-exposure", false, &problems.join("; "));
        }
    }

    fn check_buckets(&self, template: &Template, report: &mut ValidationReport) {
        let cleaned: HashSet<&str> = template
            .resources_of_type(AUTO_DELETE_RESOURCE_TYPE)
            .filter_map(|(_, r)| r.property("BucketName").and_then(ref_target))
            .collect();

        let mut problems = Vec::new();
        for (id, bucket) in template.resources_of_type("AWS::S3::Bucket") {
            let versioned = bucket
                .property("VersioningConfiguration")
                .and_then(|v| v.get("Status"))
                .and_then(Value::as_str)
                == Some("Enabled");
            if !versioned {
                problems.push(format!("{} is not versioned", id));
            }
            if bucket.deletion_policy != Some(RemovalPolicy::Delete) {
                problems.push(format!("{} is not deleted with the stack", id));
            }
            if !cleaned.contains(id) {
                problems.push(format!("{} is not emptied on teardown", id));
            }
        }

        if problems.is_empty() {
            report.add_check("bucket-teardown", true, "Buckets are versioned and emptied on teardown");
        } else {
            report.add_check("bucket-teardown", false, &problems.join("; "));
        }
    }
}

/// Inline ingress entries of one security group.
fn inline_ingress<'a>(template: &'a Template, group: &str) -> Vec<&'a Value> {
    template
        .resource(group)
        .and_then(|sg| sg.property("SecurityGroupIngress"))
        .and_then(Value::as_array)
        .map(|rules| rules.iter().collect())
        .unwrap_or_default()
}

fn is_unrestricted(rule: &Value) -> bool {
    rule.get("CidrIp").and_then(Value::as_str) == Some("0.0.0.0/0")
}

fn is_tcp_port(rule: &Value, port: u16) -> bool {
    rule.get("IpProtocol").and_then(Value::as_str) == Some("tcp")
        && rule.get("FromPort").and_then(Value::as_i64) == Some(port as i64)
        && rule.get("ToPort").and_then(Value::as_i64) == Some(port as i64)
}

fn collect_references<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    if let Some(target) = ref_target(value).or_else(|| get_att_target(value)) {
        out.push(target);
        return;
    }
    match value {
        Value::Object(map) => map.values().for_each(|v| collect_references(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}

//! Integration tests for the synthesized VPC setup stack.

use std::collections::{BTreeSet, VecDeque};
use std::fs;

use serde_json::{json, Value};
use tempfile::tempdir;

use vpc_stack::artifact::MANIFEST_FILE;
use vpc_stack::topology::{
    BACKEND_INSTANCE, BACKEND_SG, BASTION_INSTANCE, BASTION_SG, BUCKET_ID, FRONTEND_INSTANCE, FRONTEND_SG,
};
use vpc_stack::{
    ArtifactManifest, ArtifactWriter, MachineImage, RemovalPolicy, StackConfig, StackError, Template,
    TopologyValidator, VpcSetupStack,
};

const OPERATOR_IP: &str = "203.0.113.5/32";
const PINNED_AMI: &str = "ami-0123456789abcdef0";

fn fixture_config() -> StackConfig {
    StackConfig::new(OPERATOR_IP, "lab-key").with_machine_image(MachineImage::Pinned(PINNED_AMI.to_string()))
}

fn synth(config: &StackConfig) -> Template {
    VpcSetupStack::build(config).unwrap().to_template()
}

fn ingress(template: &Template, group: &str) -> Vec<Value> {
    template
        .resource(group)
        .and_then(|r| r.property("SecurityGroupIngress"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Every logical id `id` reaches through `Ref`, `Fn::GetAtt` and `DependsOn`.
fn dependencies_of(template: &Template, id: &str) -> BTreeSet<String> {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                if let Some(Value::String(target)) = map.get("Ref") {
                    out.push(target.clone());
                }
                if let Some(Value::String(target)) = map.get("Fn::GetAtt").and_then(|v| v.get(0)) {
                    out.push(target.clone());
                }
                map.values().for_each(|v| collect(v, out));
            }
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            _ => {}
        }
    }

    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([id.to_string()]);
    while let Some(current) = queue.pop_front() {
        let Some(resource) = template.resource(&current) else {
            continue;
        };
        let mut targets = resource.depends_on.clone();
        collect(&resource.properties, &mut targets);
        for target in targets {
            if seen.insert(target.clone()) {
                queue.push_back(target);
            }
        }
    }
    seen
}

#[test]
fn test_resource_counts() {
    let template = synth(&fixture_config());

    assert!(template.resource_count_is("AWS::EC2::VPC", 1));
    assert!(template.resource_count_is("AWS::EC2::SecurityGroup", 3));
    assert!(template.resource_count_is("AWS::EC2::Instance", 3));
    assert!(template.resource_count_is("AWS::S3::Bucket", 1));
    assert!(template.resource_count_is("AWS::EC2::EIPAssociation", 2));
    assert!(template.resource_count_is("AWS::EC2::Subnet", 6));
    assert!(template.resource_count_is("AWS::EC2::NatGateway", 1));
}

#[test]
fn test_no_messaging_resources_are_declared() {
    let template = synth(&fixture_config());

    assert!(template.resource_count_is("AWS::SQS::Queue", 0));
    assert!(template.resource_count_is("AWS::SNS::Topic", 0));
    assert!(!template.has_resource_properties("AWS::SQS::Queue", &json!({ "VisibilityTimeout": 300 })));
}

#[test]
fn test_backend_has_no_unrestricted_ingress() {
    let template = synth(&fixture_config());

    assert!(ingress(&template, BACKEND_SG)
        .iter()
        .all(|rule| rule["CidrIp"] != "0.0.0.0/0"));
    for (_, rule) in template.resources_of_type("AWS::EC2::SecurityGroupIngress") {
        assert!(rule.property("CidrIp").is_none());
    }
    assert!(template.has_resource_properties(
        "AWS::EC2::SecurityGroupIngress",
        &json!({
            "Description": "Allow inbound from Frontend",
            "FromPort": 8080,
            "GroupId": { "Fn::GetAtt": [BACKEND_SG, "GroupId"] },
            "IpProtocol": "tcp",
            "SourceSecurityGroupId": { "Fn::GetAtt": [FRONTEND_SG, "GroupId"] },
            "ToPort": 8080,
        })
    ));
}

#[test]
fn test_frontend_only_open_on_http() {
    let template = synth(&fixture_config());
    let open: Vec<Value> = ingress(&template, FRONTEND_SG)
        .into_iter()
        .filter(|rule| rule["CidrIp"] == "0.0.0.0/0")
        .collect();

    assert_eq!(
        open,
        vec![json!({
            "CidrIp": "0.0.0.0/0",
            "Description": "Allow HTTP from anywhere",
            "FromPort": 80,
            "IpProtocol": "tcp",
            "ToPort": 80,
        })]
    );
}

#[test]
fn test_frontend_egress_targets_backend_group() {
    let template = synth(&fixture_config());

    assert!(template.has_resource_properties(
        "AWS::EC2::SecurityGroupEgress",
        &json!({
            "DestinationSecurityGroupId": { "Fn::GetAtt": [BACKEND_SG, "GroupId"] },
            "GroupId": { "Fn::GetAtt": [FRONTEND_SG, "GroupId"] },
            "FromPort": 8080,
        })
    ));
    // No inline egress may widen the frontend beyond the backend rule.
    let frontend = template.resource(FRONTEND_SG).unwrap();
    assert_eq!(
        frontend.property("SecurityGroupEgress").unwrap()[0]["Description"],
        "Disallow all traffic"
    );
}

#[test]
fn test_group_rules_follow_both_groups() {
    let stack = VpcSetupStack::build(&fixture_config()).unwrap();
    let order = stack.construction_order();
    let pos = |id: &str| order.iter().position(|x| *x == id).unwrap();

    for rule in ["FrontendSGtoBackendSG8080", "BackendSGfromFrontendSG8080", "BackendSGfromBastionSG22"] {
        assert!(pos(FRONTEND_SG) < pos(rule), "{}", rule);
        assert!(pos(BACKEND_SG) < pos(rule), "{}", rule);
    }
    assert!(pos(BASTION_SG) < pos("FrontendSGfromBastionSG22"));
}

#[test]
fn test_instance_placement_matches_exposure() {
    let template = synth(&fixture_config());
    let subnet_of = |instance: &str| {
        template.resource(instance).unwrap().property("SubnetId").unwrap()["Ref"]
            .as_str()
            .unwrap()
            .to_string()
    };

    assert!(subnet_of(BASTION_INSTANCE).starts_with("MyVpcPublicSubnet"));
    assert!(subnet_of(FRONTEND_INSTANCE).starts_with("MyVpcPublicSubnet"));
    assert!(subnet_of(BACKEND_INSTANCE).starts_with("MyVpcPrivateSubnet"));

    let bound: Vec<&str> = template
        .resources_of_type("AWS::EC2::EIPAssociation")
        .filter_map(|(_, r)| r.property("InstanceId").and_then(|v| v["Ref"].as_str()))
        .collect();
    assert!(bound.contains(&BASTION_INSTANCE));
    assert!(bound.contains(&FRONTEND_INSTANCE));
    assert!(!bound.contains(&BACKEND_INSTANCE));
}

#[test]
fn test_public_addresses_wait_for_the_internet_gateway() {
    let template = synth(&fixture_config());

    for id in [
        "BastionEIP",
        "BastionEIPAssociation",
        "FrontendEIP",
        "FrontendEIPAssociation",
        BASTION_INSTANCE,
        FRONTEND_INSTANCE,
        BACKEND_INSTANCE,
    ] {
        assert!(dependencies_of(&template, id).contains("MyVpcVPCGW"), "{}", id);
    }
    assert!(dependencies_of(&template, BACKEND_INSTANCE).contains("MyVpcPublicSubnetSubnet1NATGateway"));
}

#[test]
fn test_instances_share_key_and_type() {
    let template = synth(&fixture_config());

    for (_, instance) in template.resources_of_type("AWS::EC2::Instance") {
        assert_eq!(instance.property("KeyName"), Some(&json!("lab-key")));
        assert_eq!(instance.property("InstanceType"), Some(&json!("t2.micro")));
        assert_eq!(instance.property("ImageId"), Some(&json!(PINNED_AMI)));
    }
    assert!(template.parameters.is_empty());
}

#[test]
fn test_latest_image_stays_a_deploy_time_reference() {
    let template = synth(&StackConfig::new(OPERATOR_IP, "lab-key"));

    let param = template.parameters.values().next().unwrap();
    assert_eq!(param.param_type, "AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>");
    for (_, instance) in template.resources_of_type("AWS::EC2::Instance") {
        assert!(instance.property("ImageId").unwrap().get("Ref").is_some());
    }
}

#[test]
fn test_bucket_is_versioned_and_auto_emptied() {
    let template = synth(&fixture_config());
    let bucket = template.resource(BUCKET_ID).unwrap();

    assert_eq!(bucket.deletion_policy, Some(RemovalPolicy::Delete));
    assert_eq!(
        bucket.property("VersioningConfiguration"),
        Some(&json!({ "Status": "Enabled" }))
    );
    assert!(template.has_resource_properties(
        "Custom::S3AutoDeleteObjects",
        &json!({ "BucketName": { "Ref": BUCKET_ID } })
    ));
}

#[test]
fn test_operator_ip_only_changes_bastion_ssh_rule() {
    let first = synth(&fixture_config());
    let second = synth(&fixture_config().with_operator_ip("198.51.100.20"));

    let ssh = ingress(&first, BASTION_SG);
    assert_eq!(ssh.len(), 1);
    assert_eq!(ssh[0]["CidrIp"], OPERATOR_IP);
    assert_eq!(ssh[0]["FromPort"], 22);
    assert_eq!(ingress(&second, BASTION_SG)[0]["CidrIp"], "198.51.100.20/32");

    let changed: Vec<&String> = first
        .resources
        .iter()
        .filter(|(id, r)| second.resources.get(*id) != Some(r))
        .map(|(id, _)| id)
        .collect();
    assert_eq!(changed, vec![&BASTION_SG.to_string()]);
    assert_eq!(first.outputs, second.outputs);
}

#[test]
fn test_outputs() {
    let template = synth(&fixture_config());

    let names: Vec<&str> = template.outputs.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        vec![
            "BackendInstancePrivateIP",
            "BastionInstancePublicIP",
            "FrontendInstancePublicIP",
            "S3BucketName",
        ]
    );
    assert_eq!(template.outputs["S3BucketName"].value, json!({ "Ref": BUCKET_ID }));
    assert_eq!(
        template.outputs["FrontendInstancePublicIP"].description.as_deref(),
        Some("Public IP of Frontend Instance")
    );
}

#[test]
fn test_validator_accepts_synthesized_topology() {
    let config = fixture_config();
    let template = synth(&config);
    let report = TopologyValidator::new()
        .with_operator_cidr(config.operator_cidr().unwrap())
        .validate(&template);

    assert!(report.passed, "{:?}", report.checks);
}

#[test]
fn test_synthesis_is_deterministic() {
    let a = synth(&fixture_config()).to_json_pretty().unwrap();
    let b = synth(&fixture_config()).to_json_pretty().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_invalid_operator_ip_is_rejected() {
    let err = VpcSetupStack::build(&StackConfig::new("203.0.113.500", "lab-key")).unwrap_err();
    assert!(matches!(err, StackError::InvalidConfig(_)));
}

#[test]
fn test_artifact_round_trip() {
    let dir = tempdir().unwrap();
    let stack = VpcSetupStack::build(&fixture_config()).unwrap();
    let template = stack.to_template();

    let path = ArtifactWriter::new(dir.path()).write(stack.name(), &template).unwrap();

    assert!(path.ends_with("VpcSetupStack.template.json"));
    let read_back = Template::from_json(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(read_back, template);
    let manifest = ArtifactManifest::from_file(&dir.path().join(MANIFEST_FILE)).unwrap();
    assert!(manifest.artifacts.contains_key("VpcSetupStack"));
}

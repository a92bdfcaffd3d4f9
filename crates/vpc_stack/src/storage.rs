//! Storage builder: the object-storage bucket and its teardown cleanup.

use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::{StackError, StackResult};
use crate::stack::Stack;
use crate::template::{get_att, reference, RemovalPolicy, Resource};

pub const AUTO_DELETE_TAG: &str = "aws-cdk:auto-delete-objects";
pub const AUTO_DELETE_RESOURCE_TYPE: &str = "Custom::S3AutoDeleteObjects";

const PROVIDER_ROLE_ID: &str = "CustomS3AutoDeleteObjectsCustomResourceProviderRole";
const PROVIDER_HANDLER_ID: &str = "CustomS3AutoDeleteObjectsCustomResourceProviderHandler";

/// Empties every object version of the bucket when the stack deletes it.
const AUTO_DELETE_HANDLER: &str = r#"import boto3
import cfnresponse


def handler(event, context):
    try:
        if event["RequestType"] == "Delete":
            bucket = event["ResourceProperties"]["BucketName"]
            boto3.resource("s3").Bucket(bucket).object_versions.delete()
        cfnresponse.send(event, context, cfnresponse.SUCCESS, {})
    except Exception as exc:
        print(exc)
        cfnresponse.send(event, context, cfnresponse.FAILED, {})
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSpec {
    pub versioned: bool,
    pub removal_policy: RemovalPolicy,
    pub auto_delete_objects: bool,
}

impl Default for BucketSpec {
    /// Versioned, deleted with the stack, emptied first.
    fn default() -> Self {
        Self {
            versioned: true,
            removal_policy: RemovalPolicy::Delete,
            auto_delete_objects: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketHandle {
    pub logical_id: String,
}

impl BucketHandle {
    pub fn bucket_name(&self) -> Value {
        reference(&self.logical_id)
    }

    pub fn arn(&self) -> Value {
        get_att(&self.logical_id, "Arn")
    }
}

pub fn declare_bucket(stack: &mut Stack, id: &str, spec: &BucketSpec) -> StackResult<BucketHandle> {
    if spec.auto_delete_objects && spec.removal_policy != RemovalPolicy::Delete {
        return Err(StackError::InvalidConfig(format!(
            "bucket {}: auto-deleting objects requires the Delete removal policy",
            id
        )));
    }

    info!(
        "Declaring bucket {} (versioned: {}, auto-delete: {})",
        id, spec.versioned, spec.auto_delete_objects
    );

    let mut properties = Map::new();
    if spec.auto_delete_objects {
        properties.insert(
            "Tags".to_string(),
            json!([{ "Key": AUTO_DELETE_TAG, "Value": "true" }]),
        );
    }
    if spec.versioned {
        properties.insert(
            "VersioningConfiguration".to_string(),
            json!({ "Status": "Enabled" }),
        );
    }

    stack.add_resource(
        id,
        Resource::new("AWS::S3::Bucket", Value::Object(properties)).with_removal_policy(spec.removal_policy),
    )?;

    let handle = BucketHandle {
        logical_id: id.to_string(),
    };
    if spec.auto_delete_objects {
        declare_auto_delete(stack, &handle)?;
    }
    Ok(handle)
}

fn declare_auto_delete(stack: &mut Stack, bucket: &BucketHandle) -> StackResult<()> {
    ensure_auto_delete_provider(stack)?;

    let policy_id = format!("{}Policy", bucket.logical_id);
    stack.add_resource(
        &policy_id,
        Resource::new(
            "AWS::S3::BucketPolicy",
            json!({
                "Bucket": bucket.bucket_name(),
                "PolicyDocument": {
                    "Statement": [{
                        "Action": [
                            "s3:PutBucketPolicy",
                            "s3:GetBucket*",
                            "s3:List*",
                            "s3:DeleteObject*",
                        ],
                        "Effect": "Allow",
                        "Principal": { "AWS": get_att(PROVIDER_ROLE_ID, "Arn") },
                        "Resource": [
                            bucket.arn(),
                            { "Fn::Join": ["", [bucket.arn(), "/*"]] },
                        ],
                    }],
                    "Version": "2012-10-17",
                },
            }),
        ),
    )?;

    stack.add_resource(
        format!("{}AutoDeleteObjectsCustomResource", bucket.logical_id),
        Resource::new(
            AUTO_DELETE_RESOURCE_TYPE,
            json!({
                "BucketName": bucket.bucket_name(),
                "ServiceToken": get_att(PROVIDER_HANDLER_ID, "Arn"),
            }),
        )
        .depends_on(&policy_id)
        .with_removal_policy(RemovalPolicy::Delete),
    )
}

/// The cleanup function is shared by every auto-deleted bucket in the stack.
fn ensure_auto_delete_provider(stack: &mut Stack) -> StackResult<()> {
    if stack.contains(PROVIDER_HANDLER_ID) {
        return Ok(());
    }

    stack.add_resource(
        PROVIDER_ROLE_ID,
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": {
                    "Statement": [{
                        "Action": "sts:AssumeRole",
                        "Effect": "Allow",
                        "Principal": { "Service": "lambda.amazonaws.com" },
                    }],
                    "Version": "2012-10-17",
                },
                "ManagedPolicyArns": [{
                    "Fn::Sub": "arn:${AWS::Partition}:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole",
                }],
            }),
        ),
    )?;
    stack.add_resource(
        PROVIDER_HANDLER_ID,
        Resource::new(
            "AWS::Lambda::Function",
            json!({
                "Code": { "ZipFile": AUTO_DELETE_HANDLER },
                "Description": "Empties the bucket when it is deleted from the stack",
                "Handler": "index.handler",
                "MemorySize": 128,
                "Role": get_att(PROVIDER_ROLE_ID, "Arn"),
                "Runtime": "python3.12",
                "Timeout": 900,
            }),
        )
        .depends_on(PROVIDER_ROLE_ID),
    )
}

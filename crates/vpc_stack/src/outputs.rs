//! Output publisher: named values read back after deployment.

use serde_json::Value;
use tracing::debug;

use crate::error::{StackError, StackResult};
use crate::stack::Stack;
use crate::template::{get_att_target, ref_target, Output};

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub value: Value,
    pub description: String,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, value: Value, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            description: description.into(),
        }
    }
}

/// Register an output. Its value must point at something already declared.
pub fn declare_output(stack: &mut Stack, spec: OutputSpec) -> StackResult<()> {
    if let Some(target) = ref_target(&spec.value).or_else(|| get_att_target(&spec.value)) {
        if !stack.contains(target) {
            return Err(StackError::DanglingReference {
                owner: spec.name,
                target: target.to_string(),
            });
        }
    }

    debug!("Output {} = {}", spec.name, spec.value);
    stack.add_output(
        spec.name,
        Output {
            description: Some(spec.description),
            value: spec.value,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{get_att, reference, Resource};
    use serde_json::json;

    #[test]
    fn test_output_on_declared_resource() {
        let mut stack = Stack::new("Test");
        stack
            .add_resource("Bucket", Resource::new("AWS::S3::Bucket", json!({})))
            .unwrap();
        declare_output(
            &mut stack,
            OutputSpec::new("S3BucketName", reference("Bucket"), "Name of the S3 Bucket"),
        )
        .unwrap();

        let template = stack.to_template();
        let output = &template.outputs["S3BucketName"];
        assert_eq!(output.value, json!({ "Ref": "Bucket" }));
        assert_eq!(output.description.as_deref(), Some("Name of the S3 Bucket"));
    }

    #[test]
    fn test_output_on_missing_resource_is_rejected() {
        let mut stack = Stack::new("Test");
        let err = declare_output(
            &mut stack,
            OutputSpec::new("Ip", get_att("Ghost", "PublicIp"), "nothing"),
        )
        .unwrap_err();
        assert!(matches!(err, StackError::DanglingReference { ref target, .. } if target == "Ghost"));
    }

    #[test]
    fn test_duplicate_output_is_rejected() {
        let mut stack = Stack::new("Test");
        declare_output(&mut stack, OutputSpec::new("Region", json!("eu-west-1"), "r")).unwrap();
        assert!(declare_output(&mut stack, OutputSpec::new("Region", json!("x"), "r")).is_err());
    }
}

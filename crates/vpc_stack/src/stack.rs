//! In-memory resource graph for one deployable stack.

use std::collections::HashSet;

use regex::Regex;
use tracing::debug;

use crate::error::{StackError, StackResult};
use crate::template::{Output, Parameter, Resource, Template};

/// A named stack: the resources, parameters and outputs declared so far,
/// in declaration order.
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    description: Option<String>,
    parameters: Vec<(String, Parameter)>,
    resources: Vec<(String, Resource)>,
    outputs: Vec<(String, Output)>,
    /// Parameters and resources share one logical id namespace.
    ids: HashSet<String>,
    output_ids: HashSet<String>,
    id_pattern: Regex,
}

impl Stack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: Vec::new(),
            resources: Vec::new(),
            outputs: Vec::new(),
            ids: HashSet::new(),
            output_ids: HashSet::new(),
            id_pattern: Regex::new("^[A-Za-z][A-Za-z0-9]{0,254}$").expect("static logical id pattern"),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_id(&self, logical_id: &str) -> StackResult<()> {
        if !self.id_pattern.is_match(logical_id) {
            return Err(StackError::InvalidLogicalId(logical_id.to_string()));
        }
        Ok(())
    }

    fn claim_id(&mut self, logical_id: &str) -> StackResult<()> {
        self.check_id(logical_id)?;
        if !self.ids.insert(logical_id.to_string()) {
            return Err(StackError::DuplicateLogicalId(logical_id.to_string()));
        }
        Ok(())
    }

    /// Declare a resource. Fails on a malformed or already used logical id.
    pub fn add_resource(&mut self, logical_id: impl Into<String>, resource: Resource) -> StackResult<()> {
        let logical_id = logical_id.into();
        self.claim_id(&logical_id)?;
        debug!("Declared {} ({})", logical_id, resource.resource_type);
        self.resources.push((logical_id, resource));
        Ok(())
    }

    /// Declare a parameter. Fails on a malformed or already used logical id.
    pub fn add_parameter(&mut self, logical_id: impl Into<String>, parameter: Parameter) -> StackResult<()> {
        let logical_id = logical_id.into();
        self.claim_id(&logical_id)?;
        debug!("Declared parameter {} ({})", logical_id, parameter.param_type);
        self.parameters.push((logical_id, parameter));
        Ok(())
    }

    /// Declare a parameter unless one with the same id already exists.
    pub fn ensure_parameter(&mut self, logical_id: &str, parameter: Parameter) -> StackResult<()> {
        if self.parameters.iter().any(|(id, _)| id == logical_id) {
            return Ok(());
        }
        self.add_parameter(logical_id, parameter)
    }

    pub fn add_output(&mut self, name: impl Into<String>, output: Output) -> StackResult<()> {
        let name = name.into();
        self.check_id(&name)?;
        if !self.output_ids.insert(name.clone()) {
            return Err(StackError::DuplicateLogicalId(name));
        }
        self.outputs.push((name, output));
        Ok(())
    }

    pub fn contains(&self, logical_id: &str) -> bool {
        self.ids.contains(logical_id)
    }

    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources
            .iter()
            .find(|(id, _)| id == logical_id)
            .map(|(_, r)| r)
    }

    /// Logical ids of all resources in the order they were declared.
    pub fn construction_order(&self) -> Vec<&str> {
        self.resources.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&str, &Output)> {
        self.outputs.iter().map(|(name, o)| (name.as_str(), o))
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Serialize the graph into a template.
    pub fn to_template(&self) -> Template {
        let mut template = Template::new(self.description.clone());
        template.parameters.extend(self.parameters.iter().cloned());
        template.resources.extend(self.resources.iter().cloned());
        template.outputs.extend(self.outputs.iter().cloned());
        template
    }
}

//! Validate command - Build the stack and check the topology.

use anyhow::Result;
use clap::Args;
use tracing::info;

use vpc_stack::TopologyValidator;

use super::{StackArgs, ValidationFailed};

#[derive(Args)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub stack: StackArgs,
}

pub async fn execute(args: ValidateArgs) -> Result<()> {
    let (config, stack) = args.stack.build()?;
    info!("Validating stack: {}", stack.name());

    let report = TopologyValidator::new()
        .with_operator_cidr(config.operator_cidr()?)
        .validate(&stack.to_template());

    println!("🔒 Topology checks for {}", stack.name());
    for check in &report.checks {
        let mark = if check.passed { "✅" } else { "❌" };
        println!("   {} {}: {}", mark, check.name, check.message);
    }

    println!();
    if report.passed {
        println!("✅ All checks passed!");
        Ok(())
    } else {
        println!("❌ Some checks failed. Please fix the issues above.");
        Err(ValidationFailed {
            failed: report.failures().count(),
        }
        .into())
    }
}

//! Synth command - Build the stack and write the cloud assembly.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use vpc_stack::{ArtifactWriter, TopologyValidator};

use super::{StackArgs, ValidationFailed};

#[derive(Args)]
pub struct SynthArgs {
    #[command(flatten)]
    pub stack: StackArgs,

    /// Output directory for the template and manifest
    #[arg(short, long, default_value = "cdk.out")]
    pub output: PathBuf,

    /// Write the template even if topology checks fail
    #[arg(long)]
    pub skip_validation: bool,
}

pub async fn execute(args: SynthArgs) -> Result<()> {
    let (config, stack) = args.stack.build()?;
    let template = stack.to_template();

    if !args.skip_validation {
        let report = TopologyValidator::new()
            .with_operator_cidr(config.operator_cidr()?)
            .validate(&template);
        if !report.passed {
            for check in report.failures() {
                eprintln!("   ❌ {}: {}", check.name, check.message);
            }
            return Err(ValidationFailed {
                failed: report.failures().count(),
            }
            .into());
        }
    }

    let path = ArtifactWriter::new(&args.output)
        .write(stack.name(), &template)
        .with_context(|| format!("failed to write cloud assembly to {}", args.output.display()))?;
    info!("Wrote {}", path.display());

    println!("✅ Synthesized {} ({} resources)", stack.name(), template.resources.len());
    println!("   Template: {}", path.display());
    Ok(())
}

//! Outputs command - Print the declared stack outputs.

use anyhow::Result;
use clap::Args;

use super::StackArgs;

#[derive(Args)]
pub struct OutputsArgs {
    #[command(flatten)]
    pub stack: StackArgs,

    /// Print the outputs section as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: OutputsArgs) -> Result<()> {
    let (_, stack) = args.stack.build()?;
    let template = stack.to_template();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&template.outputs)?);
        return Ok(());
    }

    println!("📤 Outputs of {}", stack.name());
    for (name, output) in stack.outputs() {
        println!("   {} = {}", name, output.value);
        if let Some(description) = &output.description {
            println!("      {}", description);
        }
    }
    Ok(())
}

//! `convert` command implementation.

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::ConvertArgs;
use crate::error::CliError;

/// Execute the `convert` command
pub fn run_convert(args: &ConvertArgs) -> Result<()> {
    if !args.input.exists() {
        return Err(CliError::invalid_argument(
            "input",
            format!("file not found: {}", args.input.display()),
        )
        .into());
    }
    if args.input == args.output {
        return Err(CliError::invalid_argument("output", "must differ from --input").into());
    }

    let count = dispatcher::convert(&args.input, &args.output, args.layout.into())
        .with_context(|| format!("Failed to convert {}", args.input.display()))?;

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        records = count,
        "Conversion finished"
    );
    println!(
        "✓ Converted {} record(s): {} → {}",
        count,
        args.input.display(),
        args.output.display()
    );
    Ok(())
}

use anyhow::Result;

use apdu_shell::cli::commands::run_cli;

fn main() -> Result<()> {
    run_cli()
}

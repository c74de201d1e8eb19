use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = railway_ops_cli::Cli::parse();
    railway_ops_cli::run_cli(cli)
}

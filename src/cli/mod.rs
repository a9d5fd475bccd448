pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use self::commands::{compile, inspect};

#[derive(Parser)]
#[command(name = "cil2cpp")]
#[command(about = "AOT compiler core: .NET assemblies to a C++-ready IR", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile an assembly and its references into the IR, write reports
    Compile(Box<compile::CompileArgs>),

    /// Load an assembly and print a summary of its IR
    Inspect(Box<inspect::InspectArgs>),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile(args) => compile::execute(*args),
        Commands::Inspect(args) => inspect::execute(*args),
    }
}

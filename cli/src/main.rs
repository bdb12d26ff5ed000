// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use std::{io, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use log::info;
use x2017::{loader, vm::VM};

/// Executes an x2017 binary, printing the values of its PRINT instructions.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the x2017 binary.
    path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let functions = loader::load_file(&args.path)?;
    let mut vm = VM::new(&functions)
        .with_context(|| format!("Failed to load {}", args.path.display()))?;

    info!("running {}", args.path.display());
    vm.run(&mut io::stdout().lock())?;
    Ok(())
}

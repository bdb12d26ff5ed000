// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use std::{
    io::{self, Write},
    path::PathBuf,
};

use clap::Parser;
use x2017::loader;

/// Lists the functions of an x2017 binary, highest label first.
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

    let mut out = io::stdout().lock();
    for function in functions.iter().rev().flatten() {
        write!(out, "{}", function)?;
    }
    Ok(())
}

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use tracing::error;

use clickpath::utils::{setup_logging, validate_args};
use clickpath::vocabulary::DEFAULT_VOCABULARY_FILE;
use clickpath::{execute, init_default_vocabulary, Args, Command};

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    if let Command::Init = args.command {
        return init_default_vocabulary(Path::new(DEFAULT_VOCABULARY_FILE));
    }

    validate_args(&args)?;

    match execute(&args) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

use adcp_processor::cli::{self, Args};
use clap::Parser;
use std::process;

fn main() {
    let args = Args::parse();
    cli::setup_logging(args.verbose);

    match cli::run(&args) {
        Ok(_stats) => {
            // Success - the summary has already been reported
            process::exit(0);
        }
        Err(error) => {
            eprintln!("Error: {error:#}");
            process::exit(1);
        }
    }
}

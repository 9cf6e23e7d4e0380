//! Command-line driver for the obfuscation pipeline.
//!
//! # Usage
//!
//! ```bash
//! # Run every pass with seed 7 and print the result
//! obfuscate input.oir --passes split,opaque,flattening,apihiding,string,outlining --seed 7
//!
//! # Tune a pass and write to a file
//! obfuscate input.oir --passes split --set split.probability=0.5 -o out.oir
//!
//! # Load settings from JSON, then execute `main` on the result
//! obfuscate input.oir --config obf.json --exec main --stats
//! ```

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use clap::Parser;
use obfuscator::{Interpreter, Module, PassRegistry, Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(name = "obfuscate")]
#[command(about = "Apply obfuscation passes to a textual IR module", long_about = None)]
struct Cli {
    /// Input `.oir` file; reads stdin when omitted
    input: Option<PathBuf>,

    /// Write the transformed module here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Passes to enable, comma separated
    #[arg(long, value_delimiter = ',')]
    passes: Vec<String>,

    /// Seed for every pass
    #[arg(long)]
    seed: Option<u64>,

    /// Per-pass override of the form `pass.key=value`
    #[arg(long = "set", value_name = "PASS.KEY=VALUE")]
    settings: Vec<String>,

    /// JSON configuration file, applied before the other flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads (0 = one per core, 1 = sequential)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Verify once at the end instead of after every pass
    #[arg(long)]
    no_verify_each: bool,

    /// Execute this function on the result and print its return value and output
    #[arg(long, value_name = "FUNCTION")]
    exec: Option<String>,

    /// Integer arguments for --exec
    #[arg(long = "arg", allow_negative_numbers = true)]
    exec_args: Vec<i64>,

    /// Print pass statistics and diagnostics to stderr
    #[arg(long)]
    stats: bool,

    /// List the registered passes and exit
    #[arg(long)]
    list_passes: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .try_init();
}

fn build_config(cli: &Cli) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(jobs) = cli.jobs {
        config.jobs = jobs;
    }
    if cli.no_verify_each {
        config.verify_each = false;
    }
    for name in &cli.passes {
        config.enable(name)?;
    }
    for setting in &cli.settings {
        config.apply_setting(setting)?;
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.list_passes {
        for name in PassRegistry::names() {
            println!("{name}");
        }
        return Ok(());
    }

    // Configuration errors abort before any input is read.
    let pipeline = Pipeline::new(build_config(&cli)?)?;

    let text = match &cli.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let mut module = Module::parse(&text)?;
    let report = pipeline.run(&mut module);

    if cli.stats {
        eprintln!("{}", report.stats);
        for diagnostic in &report.diagnostics {
            eprintln!("note: {diagnostic}");
        }
    }
    for failure in &report.failures {
        eprintln!("error: {failure}");
    }

    let printed = module.to_string();
    match &cli.output {
        Some(path) => fs::write(path, &printed)?,
        None => print!("{printed}"),
    }

    if let Some(name) = &cli.exec {
        let args: Vec<u64> = cli.exec_args.iter().map(|&a| a as u64).collect();
        let result = Interpreter::new(&module).call(name, &args)?;
        eprint!("{}", result.stdout());
        match result.value {
            Some(value) => eprintln!("{name} returned {}", value as i64),
            None => eprintln!("{name} returned"),
        }
    }

    if !report.is_clean() {
        eprintln!("{} function(s) failed", report.failures.len());
        std::process::exit(1);
    }
    Ok(())
}

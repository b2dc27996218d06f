//! Command-line argument parsing for meshvoice

use anyhow::{bail, Context, Result};
use std::time::Duration;

use crate::transport::Impairment;

/// Parsed command line arguments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub loopback: bool,
    pub duration: Option<Duration>,
    pub impairment: Impairment,
    pub stats_json: bool,
    pub validate: bool,
    pub help: bool,
}

pub fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from(&args)
}

/// Parse an argument vector; `args[0]` is the program name
pub fn parse_args_from(args: &[String]) -> Result<Args> {
    let mut result = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--loopback" => result.loopback = true,
            "--stats-json" => result.stats_json = true,
            "--validate" => result.validate = true,
            "--help" | "-h" => result.help = true,
            "--duration" => {
                let secs: f64 = value(args, &mut i)?;
                if !secs.is_finite() || secs <= 0.0 {
                    bail!("--duration must be a positive number of seconds");
                }
                result.duration = Some(Duration::from_secs_f64(secs));
            }
            "--loss" => result.impairment.loss = percent(args, &mut i)?,
            "--duplicate" => result.impairment.duplicate = percent(args, &mut i)?,
            "--reorder" => result.impairment.reorder = percent(args, &mut i)?,
            "--seed" => result.impairment.seed = Some(value(args, &mut i)?),
            other => bail!("unknown argument '{}' (see --help)", other),
        }
        i += 1;
    }

    if !result.loopback && !result.impairment.is_clean() {
        bail!("--loss, --duplicate and --reorder only apply with --loopback");
    }

    Ok(result)
}

/// Parse the value following the flag at `args[*i]`
fn value<T>(args: &[String], i: &mut usize) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let flag = &args[*i];
    *i += 1;
    let raw = args
        .get(*i)
        .with_context(|| format!("{} needs a value", flag))?;
    raw.parse()
        .with_context(|| format!("invalid value '{}' for {}", raw, flag))
}

/// Percentage flag converted to a probability
fn percent(args: &[String], i: &mut usize) -> Result<f64> {
    let flag = args[*i].clone();
    let pct: f64 = value(args, i)?;
    if !(0.0..=100.0).contains(&pct) {
        bail!("{} must be a percentage between 0 and 100", flag);
    }
    Ok(pct / 100.0)
}

pub fn print_help() {
    println!("meshvoice - jitter-buffered voice over a lossy packet transport\n");
    println!("USAGE:");
    println!("    meshvoice [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --loopback              Talk to ourselves over an in-process transport");
    println!("    --loss PCT              Loopback only: drop PCT% of frames");
    println!("    --duplicate PCT         Loopback only: duplicate PCT% of frames");
    println!("    --reorder PCT           Loopback only: swap PCT% of frames with the next one");
    println!("    --seed N                Loopback only: seed the impairment model");
    println!("    --duration SECS         Stop after SECS seconds (default: until Ctrl-C)");
    println!("    --stats-json            Print the final session report as JSON");
    println!("    --validate              Validate configuration and exit");
    println!("    --help, -h              Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    MESHVOICE_* variables, optionally from .env; UDP mode needs MESHVOICE_PEER_ADDR");
}

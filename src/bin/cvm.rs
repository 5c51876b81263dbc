//! cvm - run a compiled bytecode artifact as a process.
//!
//! Usage: cvm [OPTIONS] <artifact.json> [ARGS...]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;

use cvm::{exec, Binary, VmError, DEFAULT_HEAP_SIZE, DEFAULT_STACK_SIZE};

struct Options {
    artifact: PathBuf,
    args: Vec<String>,
    heap_size: usize,
    stack_size: usize,
    trace_path: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();

    let argv: Vec<String> = std::env::args().collect();
    let opts = match parse_args(&argv) {
        Ok(Some(opts)) => opts,
        Ok(None) => return ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("cvm: {}", msg);
            print_usage();
            return ExitCode::from(2);
        }
    };

    match run(opts) {
        Ok(status) => ExitCode::from(status as u8),
        Err(e) => {
            eprintln!("cvm: {:#}", e);
            ExitCode::from(255)
        }
    }
}

fn run(opts: Options) -> anyhow::Result<i32> {
    let bytes = std::fs::read(&opts.artifact)
        .with_context(|| format!("reading {}", opts.artifact.display()))?;
    let binary: Binary = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", opts.artifact.display()))?;

    // argv[0] is the artifact name, like a shell would pass it.
    let mut args = vec![opts.artifact.display().to_string()];
    args.extend(opts.args.iter().cloned());

    let status = exec(
        binary,
        &args,
        Box::new(std::io::stdin()),
        Box::new(std::io::stdout()),
        Box::new(std::io::stderr()),
        opts.heap_size,
        opts.stack_size,
        opts.trace_path,
    );
    match status {
        Ok(s) => Ok(s),
        Err(VmError::Killed) => Ok(-1),
        Err(e) => Err(e.into()),
    }
}

fn parse_args(argv: &[String]) -> Result<Option<Options>, String> {
    let mut heap_size = DEFAULT_HEAP_SIZE;
    let mut stack_size = DEFAULT_STACK_SIZE;
    let mut trace_path = None;

    let mut i = 1;
    while i < argv.len() && argv[i].starts_with('-') {
        match argv[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("cvm {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "-H" | "--heap" => {
                i += 1;
                heap_size = parse_size(argv.get(i)).ok_or("bad --heap value")?;
            }
            "-S" | "--stack" => {
                i += 1;
                stack_size = parse_size(argv.get(i)).ok_or("bad --stack value")?;
            }
            "-t" | "--trace-path" => {
                i += 1;
                trace_path = Some(PathBuf::from(
                    argv.get(i).ok_or("missing --trace-path value")?,
                ));
            }
            other => return Err(format!("unknown option: {}", other)),
        }
        i += 1;
    }

    let artifact = match argv.get(i) {
        Some(p) => PathBuf::from(p),
        None => return Err("missing artifact path".into()),
    };
    Ok(Some(Options {
        artifact,
        args: argv[i + 1..].to_vec(),
        heap_size,
        stack_size,
        trace_path,
    }))
}

/// Sizes accept a k/m/g suffix.
fn parse_size(s: Option<&String>) -> Option<usize> {
    let s = s?.to_ascii_lowercase();
    let (num, mult) = match s.strip_suffix(['k', 'm', 'g']) {
        Some(n) => {
            let mult = match s.as_bytes().last()? {
                b'k' => 1 << 10,
                b'm' => 1 << 20,
                _ => 1 << 30,
            };
            (n, mult)
        }
        None => (s.as_str(), 1),
    };
    num.parse::<usize>().ok().map(|v| v * mult)
}

fn print_usage() {
    println!("cvm - C bytecode virtual machine");
    println!();
    println!("USAGE:");
    println!("    cvm [OPTIONS] <artifact.json> [ARGS...]");
    println!();
    println!("OPTIONS:");
    println!("    -H, --heap <BYTES>        guest heap size (default 1m; k/m/g suffixes)");
    println!("    -S, --stack <BYTES>       main thread stack size (default 1m)");
    println!("    -t, --trace-path <DIR>    directory of guest sources for stack traces");
    println!("    -V, --version             print version");
    println!("    -h, --help                print this help");
}

//! The main compiler binary. Reads Simple C source from a file or standard
//! input and writes its compiled form to standard output.
//!
//! run with `--help` for more info.

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use scc::front::lex::Lexer;
use scc::front::parse;
use scc::middle::lower;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input file; reads standard input if omitted
    file: Option<PathBuf>,
    /// what to print
    #[arg(value_enum, short, long = "emit", default_value_t = Emit::Asm)]
    emit: Emit,
    /// raise the log level; repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Emit {
    /// the list of tokens
    Tokens,
    /// the untyped syntax tree
    Ast,
    /// the typed, resolved tree
    Tir,
    /// the resulting assembly code
    Asm,
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::filter::LevelFilter;

    let default_level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn read_input(file: &Option<PathBuf>) -> anyhow::Result<String> {
    match file {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading standard input")?;
            Ok(buf)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let input = read_input(&args.file)?;

    match args.emit {
        Emit::Tokens => {
            let mut lexer = Lexer::new(&input);
            loop {
                match lexer.next() {
                    Ok(Some(token)) => println!("{token}"),
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("{e}");
                        std::process::exit(1);
                    }
                }
            }
        }
        Emit::Ast => match parse(&input) {
            Ok(ast) => println!("{ast:#?}"),
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        },
        Emit::Tir => match compile_to_tir(&input) {
            Ok(tir) => println!("{tir:#?}"),
            Err(()) => std::process::exit(1),
        },
        Emit::Asm => match compile_to_tir(&input) {
            Ok(tir) => print!("{}", scc::back::generate(&tir)),
            Err(()) => std::process::exit(1),
        },
    }

    Ok(())
}

/// Parses and lowers `input`, printing every diagnostic (`line N: <message>`)
/// to standard error on failure. `Err(())` signals that diagnostics were
/// already reported and the process should exit nonzero.
fn compile_to_tir(input: &str) -> Result<scc::middle::tir::Program, ()> {
    let ast = parse(input).map_err(|e| eprintln!("{e}"))?;
    lower(ast).map_err(|errors| {
        for e in &errors {
            eprintln!("{e}");
        }
    })
}

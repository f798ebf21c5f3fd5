use std::process::ExitCode;

use clap::Parser;
use inkline::cli::{self, Args, Command, Project};
use inkline::compiler::InkCompiler;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the LSP stream.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("INKLINE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();

    match run(args.command.unwrap_or(Command::Serve)).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("inkline: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Serve => {
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting language server");
            inkline::server::run_server(None).await;
        }
        Command::Check {
            file,
            root,
            no_compiler,
        } => {
            let project = Project::around(&file, root.as_deref())?;
            let compiler = project.compiler();
            let compiler: Option<&dyn InkCompiler> = if no_compiler {
                None
            } else {
                Some(&compiler)
            };

            let (report, failed) = cli::check(&project, &file, compiler)?;
            print!("{report}");
            if failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Outline { root } => {
            let project = Project::load(&root)?;
            println!("{}", cli::outline(&project)?);
        }
        Command::Compile { file, root } => {
            let project = Project::around(&file, root.as_deref())?;
            let value = cli::compile(&project, &file, &project.compiler())?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

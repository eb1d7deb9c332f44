//! qita binary entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use qitos_cli::{board, export};

#[derive(Parser)]
#[command(name = "qita", about = "QitOS trace tools", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the qita web board over a runs directory.
    Board {
        /// Trace runs root directory.
        #[arg(long, default_value = "./runs")]
        logdir: PathBuf,
        /// Bind host.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Bind port.
        #[arg(long, default_value_t = 8765)]
        port: u16,
    },
    /// Serve one run in replay mode.
    Replay {
        /// Run directory path.
        #[arg(long)]
        run: PathBuf,
        /// Bind host.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Bind port.
        #[arg(long, default_value_t = 8765)]
        port: u16,
    },
    /// Export one run to standalone HTML.
    Export {
        /// Run directory path.
        #[arg(long)]
        run: PathBuf,
        /// Output html file path.
        #[arg(long)]
        html: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    let outcome = match cli.command {
        Command::Board { logdir, host, port } => board::serve(logdir, &host, port).await,
        Command::Replay { run, host, port } => {
            let run_dir = match run.canonicalize() {
                Ok(dir) if dir.is_dir() => dir,
                _ => {
                    eprintln!("[qita] run dir not found: {}", run.display());
                    return ExitCode::from(2);
                }
            };
            let root = run_dir
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            println!(
                "[qita] open: http://{host}:{port}/replay/{}",
                run_dir
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default()
            );
            board::serve(root, &host, port).await
        }
        Command::Export { run, html } => export::export_run(&run, &html).map(|()| {
            println!("[qita] exported: {}", html.display());
        }),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[qita] {err}");
            ExitCode::from(2)
        }
    }
}

//! Warden - sandboxed command execution confined to a root directory.
//!
//! Usage:
//!   warden --root ./sandbox exec -- echo hello
//!   warden --root ./sandbox exec --workdir data --timeout 30 -- ls -la
//!   warden --root ./sandbox blacklist

use clap::{Parser, Subcommand};

use warden::types::{ExecuteCommandRequest, PermissionLevel};
use warden::SandboxService;

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Sandboxed command execution confined to a root directory")]
struct Args {
    /// Sandbox root directory; created if missing
    #[arg(long, default_value = "./sandbox")]
    root: std::path::PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute one command inside the sandbox and print its output
    Exec {
        /// Working directory relative to the sandbox root
        #[arg(long, default_value = ".")]
        workdir: String,

        /// Timeout in seconds (0 = default)
        #[arg(long, default_value = "0")]
        timeout: u64,

        /// Permission level: readonly, standard, elevated, admin
        #[arg(long)]
        level: Option<String>,

        /// Command and arguments to run
        #[arg(last = true, required = true)]
        cmd_args: Vec<String>,
    },
    /// Print the effective command and directory blacklists
    Blacklist,
}

#[tokio::main]
async fn main() {
    use std::process::exit;

    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let service = match SandboxService::new(&args.root) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Error: {e}");
            exit(1);
        }
    };

    match args.command {
        Commands::Exec {
            workdir,
            timeout,
            level,
            cmd_args,
        } => {
            if let Some(level) = level {
                match parse_level(&level) {
                    Some(level) => service.set_permission_level(level).await,
                    None => {
                        eprintln!("Error: unknown permission level '{level}'");
                        exit(1);
                    }
                }
            }

            let Some((command, rest)) = cmd_args.split_first() else {
                eprintln!("Error: no command specified");
                exit(1);
            };
            let req = ExecuteCommandRequest {
                command: command.clone(),
                args: rest.to_vec(),
                work_dir: workdir,
                timeout,
            };

            match service.execute_command(&req).await {
                Ok(res) => {
                    print!("{}", res.stdout);
                    eprint!("{}", res.stderr);
                    if !res.success && res.stderr.is_empty() {
                        eprintln!("{}", res.message);
                    }
                    exit(res.exit_code.clamp(0, 255));
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    exit(1);
                }
            }
        }
        Commands::Blacklist => {
            let snapshot = service.get_command_blacklist().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&snapshot).unwrap_or_default()
            );
        }
    }
}

fn parse_level(s: &str) -> Option<PermissionLevel> {
    match s.to_ascii_lowercase().as_str() {
        "readonly" | "read-only" => Some(PermissionLevel::ReadOnly),
        "standard" => Some(PermissionLevel::Standard),
        "elevated" => Some(PermissionLevel::Elevated),
        "admin" => Some(PermissionLevel::Admin),
        _ => None,
    }
}

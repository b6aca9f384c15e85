// src/bin/worker.rs

//! Worker process for the process strategy. Reads one JSON task request per
//! line on stdin, answers on stdout, and exits when stdin closes. Logs go to
//! stderr, which the parent inherits.

use clap::Parser;
use std::io;
use tracing::{error, info};
use TaskBlaster::pool::serve;
use TaskBlaster::tasks::TaskRegistry;
use TaskBlaster::utils::init_tracing;

#[derive(Parser, Debug)]
#[command(author, version, about = "Task worker speaking line-delimited JSON on stdin/stdout", long_about = None)]
struct Args {
    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// List the tasks this worker serves and exit
    #[arg(long)]
    list_tasks: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.json_logs, None, "worker.log")?;

    let registry = TaskRegistry::builtin();
    if args.list_tasks {
        for name in registry.names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let pid = std::process::id();
    info!(pid, "worker ready");
    let stdin = io::stdin();
    let stdout = io::stdout();
    match serve(&registry, stdin.lock(), stdout.lock()) {
        Ok(served) => {
            info!(pid, served, "stdin closed, worker exiting");
            Ok(())
        }
        Err(e) => {
            error!(pid, error = %e, "worker loop failed");
            Err(e.into())
        }
    }
}

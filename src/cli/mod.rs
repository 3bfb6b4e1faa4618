mod retrieval;
mod run;
mod serve;

use anyhow::Result;
use console::style;

use crate::core::terminal::print_error;
use crate::interfaces::server::CORE_VERSION;
use crate::logging;

/// Default location of the on-disk retrieval index, relative to the
/// working tree.
pub(crate) const INDEX_DB_PATH: &str = ".specrun/retrieval.db";

fn print_help() {
    println!("\n{} LLM scripts over markdown specifications\n", style("specrun").bold().green());

    println!(" {}", style("Commands").bold());
    println!("   {}        Run a script against a specification", style("run").green());
    println!("   {}      Start the WebSocket RPC server", style("serve").green());
    println!("   {}  Manage the retrieval index (index, search, clear)", style("retrieval").green());
    println!("   {}    Print the version", style("version").green());

    println!("\n {} {} <command> [flags]\n", style("Usage:").bold(), style("specrun").green());
    println!(" Run `specrun run --help` for the full flag list.\n");
}

/// Entry point behind `main`. Returns the process exit code; `Err` is
/// reserved for usage-level failures.
pub(crate) async fn run_main() -> Result<i32> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    args.retain(|a| a != "--verbose" && a != "-v");
    logging::init(verbose);

    match args.first().map(String::as_str) {
        Some("run") => run::command(&args, 1).await,
        Some("serve") => serve::command(&args, 1).await,
        Some("retrieval") => retrieval::command(&args, 1).await,
        Some("version") | Some("--version") => {
            println!("specrun {CORE_VERSION}");
            Ok(0)
        }
        Some("help") | Some("--help") | None => {
            print_help();
            Ok(0)
        }
        Some(other) => {
            print_error(&format!("unknown command: {other}"));
            print_help();
            Ok(1)
        }
    }
}

mod cli;
mod core;
mod interfaces;
mod logging;

use crate::core::terminal;

#[tokio::main]
async fn main() {
    let code = match cli::run_main().await {
        Ok(code) => code,
        Err(e) => {
            terminal::print_error(&format!("{e:#}"));
            1
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
}

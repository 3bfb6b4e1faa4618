use anyhow::Result;
use std::sync::Arc;

use crate::core::fetch::NativeFetch;
use crate::core::retrieval::RetrievalService;
use crate::core::retrieval::backend::SqliteBackend;
use crate::core::terminal::print_step;
use crate::interfaces::server::{self, DEFAULT_PORT};

pub(crate) fn parse_serve_flags(args: &[String], start: usize) -> u16 {
    let mut port = DEFAULT_PORT;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port = args[i + 1].parse().unwrap_or(DEFAULT_PORT);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    port
}

pub(crate) async fn command(args: &[String], start: usize) -> Result<i32> {
    let port = parse_serve_flags(args, start);

    let backend = Arc::new(SqliteBackend::open(super::INDEX_DB_PATH)?);
    let retrieval = Arc::new(RetrievalService::new(backend, Arc::new(NativeFetch::new())));

    print_step(&format!("Starting specrun server on port {port}"));
    server::start_server(retrieval, port).await?;
    Ok(0)
}

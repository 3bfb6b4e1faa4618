pub mod errors;
pub mod fetch;
pub mod llm;
pub mod output;
pub mod project;
pub mod retrieval;
pub mod runner;
pub mod terminal;

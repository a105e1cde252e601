// Library interface for the curator modules
// This allows tests and the binaries to import modules

pub mod candidate;
pub mod client;
pub mod cluster;
pub mod consensus;
pub mod control;
pub mod decision;
pub mod dedupe;
pub mod extract;
pub mod ingestion;
pub mod llm;
pub mod output;
pub mod pipeline;
pub mod scheduler;

// Tidewater Kernel
//
// Core correctness primitives for bulk ingestion, version cutover
// and read-time compute against served values.

pub mod activation;
pub mod compression;
pub mod compute;
pub mod config;
pub mod invariants;
pub mod log;
pub mod meta;
pub mod partitioner;
pub mod replay;
pub mod replica;
pub mod schema;
pub mod simulate;
pub mod source;
pub mod status;
pub mod storage;
pub mod writer;

//! Retrieval-augmented memory storage — the search/learn/forget interface
//! the Compactor and RPC surface consume. Indexing strategy is an external
//! concern; this crate only stores and serves what it is given.

pub mod db;
pub mod error;
pub mod manager;
pub mod types;

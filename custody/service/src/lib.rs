// Copyright (c) 2024 The Botho Foundation

//! Custody settlement workers.
//!
//! One process runs per worker role and chain. Workers share nothing in
//! memory; they coordinate through the SQLite store, the durable block
//! queue and the sequenced event log, all of which live in the same
//! database file.

pub mod adapter;
pub mod db;
pub mod detector;
pub mod executor;
pub mod gateway;
pub mod log;
pub mod observer;
pub mod processor;
pub mod producer;
pub mod queue;
pub mod rpc;
pub mod supervisor;
pub mod tokens;
pub mod worker;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

//! Practice log for a metronome: sessions are stored in a local journal, grouped into the last
//! seven calendar days and summed both on the client and inside the store. Other devices'
//! journals can be merged in, and a small widget keeps its own running total.

pub mod cli;
pub mod config;
pub mod repository;
pub mod service;
pub mod store;
pub mod utils;
pub mod widget;

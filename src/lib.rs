// lib.rs

pub mod bot;
pub mod config;
pub mod exchange;
pub mod feed;
pub mod liquidity;
pub mod queue;
pub mod replica;
pub mod signal;
pub mod trader;
pub mod worker;

//! Compile-time configuration constants shared by the NIC crates.
//!
//! Per-device values that may differ at runtime are carried in each driver's
//! own config struct; the constants here are only the defaults it starts from.

#![no_std]

pub mod memory;
pub mod network;

//! Core types: distributions, coordinate conversions and model containers

pub mod containers;
pub mod conversion;
pub mod distribution;

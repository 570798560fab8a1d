//! Test utilities shared by the unit tests of every module

pub mod fixtures;

pub use fixtures::*;

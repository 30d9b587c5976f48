#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod backend;
pub mod cli;
pub mod constants;
pub mod error;
pub mod logging;
pub mod probe;
pub mod profile;
pub mod provision;

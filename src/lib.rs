#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod guest;
pub mod locator;
pub mod reader;
pub mod session;
pub mod soap;
pub mod vim;

#[cfg(test)]
mod testing;

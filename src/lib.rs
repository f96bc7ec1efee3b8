pub mod cli;
pub mod client;
pub mod command;
pub mod error;
pub mod handlers;
pub mod host;
pub mod image;
pub mod runtime;
pub mod stress;
pub mod vdisk;

#[cfg(test)]
mod testing;

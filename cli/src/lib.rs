#[macro_use]
extern crate log;

pub mod args;
pub mod pipeline;

mod analyze;
mod frame;

pub mod assemble;
pub mod backend;
pub mod cli;
pub mod collect;
pub mod dataset;
pub mod flatten;
pub mod registry;
pub mod report;

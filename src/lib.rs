pub mod adapters;
pub mod cli;
pub mod flow;
pub mod notify;
pub mod pipeline;

pub mod budget;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod input;
pub mod pipeline;
pub mod report;
pub mod request;
pub mod schema;
pub mod sink;
pub mod stats;
pub mod util;

pub mod audit;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod sql;
pub mod state;
pub mod util;

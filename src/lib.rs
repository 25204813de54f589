pub mod benchmarks;
pub mod command;
pub mod compare;
pub mod config;
pub mod error;
pub mod git;
pub mod output;
pub mod path_utils;
pub mod ui;
pub mod workdir;

pub mod alert;
pub mod config;
pub mod error;
pub mod exchange;
pub mod indicators;
pub mod logging;
pub mod model;
pub mod strategy;
pub mod workflow;

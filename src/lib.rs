pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod model;
pub mod pipeline;
pub mod runtime;
pub mod storage;
pub mod tvmaze;

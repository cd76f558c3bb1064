pub mod config;
pub mod directory;
pub mod error;
pub mod models;
pub mod persistence;
pub mod pipeline;
pub mod storage;
pub mod web;

// src/lib.rs

pub mod api;
pub mod app_state;
pub mod backend;
pub mod bus;
pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod ledger;
pub mod model;
pub mod packaging;
pub mod safe_path;
pub mod scheduler;
pub mod service;

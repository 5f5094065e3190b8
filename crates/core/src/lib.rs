//! # Signal Ledger Core
//!
//! 核心基础设施：配置、数据库、日志、错误

pub mod config;
pub mod database;
pub mod error;
pub mod logger;

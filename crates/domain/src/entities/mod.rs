//! 业务实体模块

pub mod signal_record;

pub use signal_record::{NewSignal, SignalId, SignalRecord};

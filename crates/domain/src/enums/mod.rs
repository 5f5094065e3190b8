//! 业务枚举模块

pub mod signal_enums;

pub use signal_enums::{Direction, ExitPattern, SignalKind, SignalStatus};

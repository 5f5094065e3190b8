// 错误处理模块

pub use thiserror::Error;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AppError::ConfigError("DATABASE_URL must be set".to_string());
        assert_eq!(err.to_string(), "Configuration error: DATABASE_URL must be set");

        let err: anyhow::Error = AppError::DatabaseError("timeout".to_string()).into();
        assert!(err.downcast_ref::<AppError>().is_some());
    }
}

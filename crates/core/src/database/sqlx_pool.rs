//! SQLx 数据库连接池管理
//!
//! 信号账本使用 MySQL，连接串来自 `DATABASE_URL`

use once_cell::sync::OnceCell;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{MySql, Pool};
use std::time::Duration;
use tracing::info;

use crate::config::env_usize;
use crate::error::AppError;

static DB_POOL: OnceCell<Pool<MySql>> = OnceCell::new();

/// 初始化数据库连接池
pub async fn init_db_pool() -> anyhow::Result<()> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| AppError::ConfigError("DATABASE_URL must be set".to_string()))?;
    let max_connections = env_usize("DB_MAX_CONNECTIONS", 20) as u32;

    info!("正在初始化数据库连接池... max_connections={}", max_connections);

    let options: MySqlConnectOptions = database_url
        .parse()
        .map_err(|e| anyhow::anyhow!("数据库URL解析失败: {}", e))?;

    let pool = MySqlPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .max_lifetime(Some(Duration::from_secs(3600)))
        .connect_with(options)
        .await
        .map_err(|e| AppError::DatabaseError(format!("数据库连接失败: {}", e)))?;

    DB_POOL
        .set(pool)
        .map_err(|_| anyhow::anyhow!("数据库连接池已初始化"))?;

    info!("✓ 数据库连接池初始化成功");
    Ok(())
}

/// 获取数据库连接池
pub fn get_db_pool() -> anyhow::Result<&'static Pool<MySql>> {
    DB_POOL
        .get()
        .ok_or_else(|| anyhow::anyhow!("数据库连接池未初始化，请先调用 init_db_pool()"))
}

/// 关闭数据库连接池
pub async fn close_db_pool() -> anyhow::Result<()> {
    if let Some(pool) = DB_POOL.get() {
        info!("正在关闭数据库连接池...");
        pool.close().await;
        info!("✓ 数据库连接池已关闭");
    }
    Ok(())
}

/// 健康检查
pub async fn health_check() -> anyhow::Result<()> {
    let pool = get_db_pool()?;
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| anyhow::anyhow!("数据库健康检查失败: {}", e))?;
    Ok(())
}

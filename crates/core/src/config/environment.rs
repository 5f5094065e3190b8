use std::env;

/// 读取布尔型环境变量：支持 true/false/1/0（大小写不敏感）
pub fn env_is_true(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => {
            let v = v.trim();
            v.eq_ignore_ascii_case("true") || v == "1"
        }
        Err(_) => default,
    }
}

/// 读取字符串环境变量，若不存在则返回默认值
pub fn env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) => v,
        Err(_) => default.to_string(),
    }
}

/// 读取 i64 环境变量，不存在或解析失败返回默认值
pub fn env_i64(key: &str, default: i64) -> i64 {
    match env::var(key) {
        Ok(v) => v.trim().parse::<i64>().ok().unwrap_or(default),
        Err(_) => default,
    }
}

/// 读取 usize 环境变量，不存在、解析失败或为 0 时返回默认值
pub fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(v) => match v.trim().parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => default,
        },
        Err(_) => default,
    }
}

/// 读取 f64 环境变量，不存在或不是有限数时返回默认值
pub fn env_f64(key: &str, default: f64) -> f64 {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_fallbacks() {
        env::set_var("SIGNAL_LEDGER_TEST_BOOL", "TRUE");
        env::set_var("SIGNAL_LEDGER_TEST_USIZE", "0");
        env::set_var("SIGNAL_LEDGER_TEST_F64", "abc");

        assert!(env_is_true("SIGNAL_LEDGER_TEST_BOOL", false));
        assert!(!env_is_true("SIGNAL_LEDGER_TEST_MISSING", false));
        assert_eq!(env_usize("SIGNAL_LEDGER_TEST_USIZE", 7), 7);
        assert_eq!(env_f64("SIGNAL_LEDGER_TEST_F64", 0.1), 0.1);
        assert_eq!(env_i64("SIGNAL_LEDGER_TEST_MISSING", -1), -1);
        assert_eq!(env_or_default("SIGNAL_LEDGER_TEST_MISSING", "x"), "x");
    }
}

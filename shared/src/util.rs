/// 获取当前 UTC 时间戳（毫秒）
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lowercased copy of a binding path, used as a case-insensitive map key.
pub fn path_key(path: &str) -> String {
    path.to_ascii_lowercase()
}

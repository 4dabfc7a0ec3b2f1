//! 缓存键派生
//!
//! 以 SHA-256 对语句文本（以及可选的调用点、描述）求摘要，输出定长十六进制字符串。
//! 输入按原样视为字节，空白规范化由调用方通过 [`normalize_sql`] 完成。

use sha2::{Digest, Sha256};

/// 缓存键长度（十六进制字符数）
pub const KEY_LEN: usize = 64;

/// 折叠连续空白并去除首尾空白
pub fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 由语句派生缓存键
///
/// 调用方选择区分调用点时传入 `call_site` / `description`，
/// 文本相同但来自不同调用点的请求即拥有不同的键。
pub fn derive_key(sql: &str, call_site: Option<&str>, description: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    // 分隔符带标签，避免 "a"+"bc" 与 "ab"+"c" 碰撞
    if let Some(site) = call_site {
        hasher.update(b"\x00site\x00");
        hasher.update(site.as_bytes());
    }
    if let Some(desc) = description {
        hasher.update(b"\x00desc\x00");
        hasher.update(desc.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

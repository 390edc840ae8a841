//! 存储键派生
//!
//! 存储键 = `prefix` + `base64(sha256(identity))`。摘要定长（44 个字符），
//! 不加盐，同一个身份在进程重启后得到相同的键。

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// 身份摘要
pub fn digest(identity: &str) -> String {
    STANDARD.encode(Sha256::digest(identity.as_bytes()))
}

/// 派生存储键
///
/// # 示例
/// ```rust
/// use antiflood::key::store_key;
///
/// let key = store_key("login:", "127.0.0.1");
/// assert!(key.starts_with("login:"));
/// assert_eq!(key.len(), "login:".len() + 44);
/// ```
pub fn store_key(prefix: &str, identity: &str) -> String {
    let mut key = String::with_capacity(prefix.len() + 44);
    key.push_str(prefix);
    key.push_str(&digest(identity));
    key
}

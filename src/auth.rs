//! MySQL 인증 처리
//!
//! mysql_native_password, caching_sha2_password(fast auth) 스크램블 생성

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// 플러그인에 맞는 인증 응답 생성. 모르는 플러그인은 None
pub fn scramble_for(plugin: &str, password: &str, scramble: &[u8]) -> Option<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD | "" => Some(native_password(password, scramble)),
        CACHING_SHA2_PASSWORD => Some(caching_sha2_password(password, scramble)),
        _ => None,
    }
}

/// Native password 인증 응답 생성
///
/// XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
pub fn native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};

    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(&scramble[..scramble.len().min(20)]);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password fast auth 응답 생성
///
/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + scramble))
pub fn caching_sha2_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};

    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(&scramble[..scramble.len().min(20)]);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// 인증 패킷 생성
pub fn create_handshake_response(
    username: &str,
    password: &str,
    scramble: &[u8],
    collation: u8,
    plugin: &str,
) -> Result<Vec<u8>, std::io::Error> {
    let mut buffer = Vec::new();

    let capabilities = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;

    buffer.write_u32::<LittleEndian>(capabilities)?;

    // Max packet size (4 bytes) - 0 means default (16MB)
    buffer.write_u32::<LittleEndian>(0)?;

    // Character set (1 byte)
    buffer.write_u8(collation)?;

    // Reserved (23 bytes of zeros)
    buffer.write_all(&[0u8; 23])?;

    // Username (null-terminated string)
    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    // 모르는 플러그인이면 native로 응답하고 auth switch를 기다린다
    let (plugin, auth_response) = match scramble_for(plugin, password, scramble) {
        Some(resp) => (plugin, resp),
        None => (NATIVE_PASSWORD, native_password(password, scramble)),
    };
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(&auth_response)?;

    // Authentication plugin name (null-terminated)
    buffer.write_all(if plugin.is_empty() { NATIVE_PASSWORD } else { plugin }.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRAMBLE: [u8; 20] = [
        0x40, 0x3B, 0x57, 0x68, 0x3A, 0x77, 0x23, 0x29, 0x11, 0x22,
        0x33, 0x44, 0x55, 0x66, 0x77, 0x01, 0x02, 0x03, 0x04, 0x05,
    ];

    #[test]
    fn test_empty_password_has_empty_response() {
        assert!(native_password("", &SCRAMBLE).is_empty());
        assert!(caching_sha2_password("", &SCRAMBLE).is_empty());
    }

    #[test]
    fn test_scramble_lengths() {
        assert_eq!(native_password("password", &SCRAMBLE).len(), 20);
        assert_eq!(caching_sha2_password("password", &SCRAMBLE).len(), 32);
        assert!(scramble_for("sha256_password", "password", &SCRAMBLE).is_none());
    }

    #[test]
    fn test_native_password_is_deterministic() {
        let a = native_password("secret", &SCRAMBLE);
        let b = native_password("secret", &SCRAMBLE);
        let c = native_password("other", &SCRAMBLE);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_create_handshake_response() {
        let packet =
            create_handshake_response("root", "password", &SCRAMBLE, 33, NATIVE_PASSWORD).unwrap();

        // capabilities(4) + max packet(4) + charset(1) + reserved(23) + "root\0" + len + 20
        assert_eq!(packet[8], 33);
        assert_eq!(&packet[32..37], b"root\0");
        assert_eq!(packet[37], 20);
        assert!(packet.ends_with(b"mysql_native_password\0"));
    }
}

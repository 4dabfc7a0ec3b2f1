//! 负载编码管线
//!
//! `值 -> bincode -> gzip -> base64`，得到紧凑、压缩、可安全存入文本列或文件的形式。
//! 压缩前写入一个格式版本字节，解码时校验。

use crate::data::{CacheError, Result};
use crate::models::ResultSet;
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// 当前负载格式版本
pub const FORMAT_VERSION: u8 = 1;

/// 序列化并压缩（带版本头）
pub fn pack<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)
        .map_err(|e| CacheError::Serialization(format!("bincode 序列化失败: {e}")))?;

    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2 + 16), Compression::default());
    encoder
        .write_all(&[FORMAT_VERSION])
        .and_then(|_| encoder.write_all(&body))
        .map_err(|e| CacheError::Serialization(format!("压缩失败: {e}")))?;
    encoder
        .finish()
        .map_err(|e| CacheError::Serialization(format!("压缩失败: {e}")))
}

/// 解压并反序列化
pub fn unpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut decoder = GzDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| CacheError::Serialization(format!("解压失败: {e}")))?;

    match raw.split_first() {
        Some((&FORMAT_VERSION, body)) => bincode::deserialize(body)
            .map_err(|e| CacheError::Serialization(format!("bincode 反序列化失败: {e}"))),
        Some((version, _)) => Err(CacheError::Serialization(format!(
            "不支持的负载格式版本: {version}"
        ))),
        None => Err(CacheError::Serialization("负载为空".to_string())),
    }
}

/// 编码结果集为可存储文本
pub fn encode_result_set(result: &ResultSet) -> Result<String> {
    Ok(STANDARD.encode(pack(result)?))
}

/// 从可存储文本解码结果集
pub fn decode_result_set(encoded: &str) -> Result<ResultSet> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CacheError::Serialization(format!("base64 解码失败: {e}")))?;
    unpack(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Value;

    fn sample() -> ResultSet {
        ResultSet::new(
            vec!["id".into(), "name".into(), "score".into(), "avatar".into(), "note".into()],
            vec![
                vec![
                    Value::Integer(1),
                    Value::Text("Alice".into()),
                    Value::Real(9.5),
                    Value::Blob(vec![0, 159, 146, 150, 255]),
                    Value::Null,
                ],
                vec![
                    Value::Integer(-2),
                    Value::Text("鸭子 'quoted' \"text\"\n".into()),
                    Value::Real(-0.25),
                    Value::Blob(Vec::new()),
                    Value::Text(String::new()),
                ],
            ],
        )
    }

    #[test]
    fn test_roundtrip_rows_with_binary() {
        let rs = sample();
        let encoded = encode_result_set(&rs).unwrap();
        assert!(encoded.is_ascii());
        assert_eq!(decode_result_set(&encoded).unwrap(), rs);
    }

    #[test]
    fn test_roundtrip_empty_result_set() {
        let rs = ResultSet::new(vec!["id".into()], Vec::new());
        assert_eq!(decode_result_set(&encode_result_set(&rs).unwrap()).unwrap(), rs);

        let bare = ResultSet::default();
        assert_eq!(decode_result_set(&encode_result_set(&bare).unwrap()).unwrap(), bare);
    }

    #[test]
    fn test_repetitive_rows_compress() {
        let rows = (0..500)
            .map(|i| vec![Value::Integer(i), Value::Text("same text every row".into())])
            .collect();
        let rs = ResultSet::new(vec!["id".into(), "t".into()], rows);
        let raw = bincode::serialize(&rs).unwrap();
        assert!(pack(&rs).unwrap().len() < raw.len() / 2);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            decode_result_set("not base64!!"),
            Err(CacheError::Serialization(_))
        ));
        let not_gzip = STANDARD.encode(b"plain bytes");
        assert!(decode_result_set(&not_gzip).is_err());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[99, 1, 2, 3]).unwrap();
        let bytes = encoder.finish().unwrap();
        let err = unpack::<ResultSet>(&bytes).unwrap_err();
        assert!(err.to_string().contains("99"));
    }
}

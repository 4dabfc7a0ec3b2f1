//! 结果集模型
//!
//! 与具体驱动无关的行/列表示，所有连接器都把查询结果转换为 `ResultSet`。

use serde::{Deserialize, Serialize};

/// 单元格的值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// 以整数读取（兼容驱动把数字返回为文本的情况）
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Real(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse::<i64>().ok().or_else(|| {
                s.trim().parse::<f64>().ok().map(|f| f as i64)
            }),
            _ => None,
        }
    }

    /// 以浮点数读取
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// 以文本读取
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// 查询结果集
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// 行数
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 按列名查找列下标（大小写不敏感）
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// 获取指定单元格
    pub fn get(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// 第一行第一列（标量查询）
    pub fn scalar(&self) -> Option<&Value> {
        self.get(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_coercion() {
        assert_eq!(Value::Integer(42).as_i64(), Some(42));
        assert_eq!(Value::Text(" 1700000000 ".to_string()).as_i64(), Some(1_700_000_000));
        assert_eq!(Value::Text("12.5".to_string()).as_f64(), Some(12.5));
        assert_eq!(Value::Null.as_i64(), None);
        assert!(Value::Null.is_null());
    }

    #[test]
    fn test_result_set_access() {
        let rs = ResultSet::new(
            vec!["id".to_string(), "Name".to_string()],
            vec![vec![Value::Integer(1), Value::Text("Alice".to_string())]],
        );
        assert_eq!(rs.len(), 1);
        assert_eq!(rs.column_index("name"), Some(1));
        assert_eq!(rs.scalar(), Some(&Value::Integer(1)));
        assert_eq!(rs.get(0, 1).and_then(Value::as_str), Some("Alice"));
        assert!(rs.get(1, 0).is_none());
    }
}

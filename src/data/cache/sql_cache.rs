//! SQL 语句分析
//!
//! 提供：
//! - 表名提取（启发式，仅覆盖引擎支持的语句子集）
//! - 可缓存性判定（保守过滤）
//! - 判定结果的有界记忆
//!
//! # 使用示例
//!
//! ```rust
//! use crate::data::cache::{extract_tables, is_cacheable};
//!
//! let sql = "SELECT * FROM orders o JOIN customers c ON o.cust_id = c.id";
//! assert!(is_cacheable(sql));
//! assert_eq!(extract_tables(sql), Some(vec!["orders".into(), "customers".into()]));
//! ```

use super::key::{derive_key, normalize_sql};
use super::LruCache;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Mutex;

static FROM_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i) from ").expect("FROM 正则"));
static JOIN_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i) join ").expect("JOIN 正则"));
static JOIN_CONDITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i) (?:on|using) ").expect("ON 正则"));
static CLAUSE_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i) (?:where|limit|order by|group by|having|union) ").expect("子句正则")
});

/// 从 SQL 语句中提取表名
///
/// 大小写不敏感地定位第一个 ` FROM `：
/// - 存在 ` JOIN ` 时，取 FROM 与第一个 JOIN 之间的表，以及每个 JOIN 之后到 `ON` 之前的表
/// - 否则取 FROM 到 ` WHERE ` / ` LIMIT `（或语句结尾）之间的内容
///
/// 每个片段去除引号、去除首尾空白，并丢弃第一个空格之后的别名。
/// 结果保持出现顺序并去重。
///
/// # 返回
///
/// - `Some(tables)`: 至少识别出一张表
/// - `None`: 没有 FROM，或片段为空（调用方需显式提供表名或放弃缓存）
///
/// 注意：这不是完整的 SQL 语法分析，子查询、CTE、聚合计数等语句应先被
/// [`is_cacheable`] 排除。
pub fn extract_tables(sql: &str) -> Option<Vec<String>> {
    let normalized = normalize_sql(sql);
    let from = FROM_KEYWORD.find(&normalized)?;
    // 保留关键字前的空格，使紧随其后的子句关键字也能被识别
    let body = &normalized[from.end() - 1..];

    let mut fragments: Vec<&str> = Vec::new();
    let joins: Vec<(usize, usize)> = JOIN_KEYWORD
        .find_iter(body)
        .map(|m| (m.start(), m.end()))
        .collect();

    if let Some(&(first_join, _)) = joins.first() {
        fragments.extend(body[..first_join].split(','));
        for (idx, &(_, start)) in joins.iter().enumerate() {
            let next = joins.get(idx + 1).map(|j| j.0).unwrap_or(body.len());
            let segment = &body[start - 1..next];
            let end = JOIN_CONDITION
                .find(segment)
                .map(|m| m.start())
                .into_iter()
                .chain(CLAUSE_END.find(segment).map(|m| m.start()))
                .min()
                .unwrap_or(segment.len());
            fragments.push(&segment[..end]);
        }
    } else {
        let end = CLAUSE_END
            .find(body)
            .map(|m| m.start())
            .unwrap_or(body.len());
        fragments.extend(body[..end].split(','));
    }

    let mut tables: Vec<String> = Vec::new();
    for fragment in fragments {
        if let Some(table) = clean_fragment(fragment) {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
    }

    if tables.is_empty() {
        None
    } else {
        Some(tables)
    }
}

/// 去引号、去别名、去模式前缀
fn clean_fragment(fragment: &str) -> Option<String> {
    let stripped: String = fragment
        .chars()
        .filter(|c| !matches!(c, '`' | '\'' | '"' | '[' | ']'))
        .collect();
    let trimmed = stripped.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() || trimmed.starts_with('(') {
        return None;
    }

    let name = trimmed.split(' ').next().unwrap_or(trimmed);
    // main.users -> users
    let name = name.rsplit('.').next().unwrap_or(name).trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// 判断语句是否可以提供缓存
///
/// 去除首尾空白并转为小写后，必须同时满足：
/// - 以 `select ` 开头
/// - 包含 ` from ` 与 ` join `
/// - 不包含 `count(`
/// - 不包含第二个 `select`
///
/// 这是保守过滤：不满足的语句只是不提供缓存，而不会被错误缓存。
pub fn is_cacheable(sql: &str) -> bool {
    let lower = normalize_sql(sql).to_ascii_lowercase();
    lower.starts_with("select ")
        && lower.contains(" from ")
        && lower.contains(" join ")
        && !lower.contains("count(")
        && !lower.contains(" select ")
        && !lower.contains("(select ")
}

/// 可缓存性判定的记忆表
///
/// 以语句摘要为键，生命周期归属于持有它的查询编排器。
#[derive(Debug)]
pub struct EligibilityMemo {
    memo: Mutex<LruCache<String, bool>>,
}

impl EligibilityMemo {
    pub fn new(capacity: usize) -> Self {
        Self {
            memo: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// 判定语句是否可缓存（命中记忆时不再重新分析）
    pub fn check(&self, sql: &str) -> bool {
        let digest = derive_key(sql, None, None);
        match self.memo.lock() {
            Ok(mut memo) => *memo.get_or_insert_with(digest, || is_cacheable(sql)),
            // 记忆表中毒不影响判定本身
            Err(_) => is_cacheable(sql),
        }
    }

    /// 已记忆的语句数
    pub fn len(&self) -> usize {
        self.memo.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(sql: &str) -> Vec<String> {
        extract_tables(sql).unwrap()
    }

    #[test]
    fn test_extract_tables_join_with_aliases() {
        let sql = "SELECT * FROM orders o JOIN customers c ON o.cust_id = c.id WHERE o.total > 100";
        assert_eq!(tables(sql), vec!["orders", "customers"]);
    }

    #[test]
    fn test_extract_tables_limit() {
        assert_eq!(tables("SELECT * FROM orders LIMIT 10"), vec!["orders"]);
    }

    #[test]
    fn test_extract_tables_no_from() {
        assert_eq!(extract_tables("SELECT 1"), None);
    }

    #[test]
    fn test_extract_tables_empty_fragment() {
        assert_eq!(extract_tables("SELECT * FROM  WHERE x = 1"), None);
    }

    #[test]
    fn test_extract_tables_multiple_joins() {
        let sql = "SELECT * FROM users u LEFT JOIN posts p ON u.id = p.user_id \
                   INNER JOIN comments c ON p.id = c.post_id";
        assert_eq!(tables(sql), vec!["users", "posts", "comments"]);
    }

    #[test]
    fn test_extract_tables_strips_quotes_and_schema() {
        let sql = "SELECT * FROM `shop`.`orders` JOIN \"customers\" ON orders.cid = customers.id";
        assert_eq!(tables(sql), vec!["orders", "customers"]);
        let sql = "SELECT * FROM [dbo].[orders] o JOIN [items] i ON o.id = i.oid";
        assert_eq!(tables(sql), vec!["orders", "items"]);
    }

    #[test]
    fn test_extract_tables_case_insensitive_keywords() {
        let sql = "select * from Users join Sessions on Users.id = Sessions.user_id";
        assert_eq!(tables(sql), vec!["Users", "Sessions"]);
    }

    #[test]
    fn test_extract_tables_deduplicates() {
        let sql = "SELECT * FROM nodes a JOIN nodes b ON a.parent = b.id";
        assert_eq!(tables(sql), vec!["nodes"]);
    }

    #[test]
    fn test_extract_tables_multiline() {
        let sql = "SELECT *\n  FROM orders\n  JOIN items\n    ON orders.id = items.order_id\n WHERE 1";
        assert_eq!(tables(sql), vec!["orders", "items"]);
    }

    #[test]
    fn test_extract_tables_comma_list() {
        assert_eq!(
            tables("SELECT * FROM a, b x WHERE a.id = x.id"),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_extract_tables_join_using() {
        let sql = "SELECT * FROM a JOIN b USING (id) ORDER BY a.id";
        assert_eq!(tables(sql), vec!["a", "b"]);
    }

    #[test]
    fn test_is_cacheable() {
        assert!(is_cacheable("SELECT * FROM a JOIN b ON a.id=b.id"));
        assert!(is_cacheable("  select x\nfrom a\njoin b on a.id = b.id  "));
        assert!(!is_cacheable("SELECT COUNT(*) FROM a JOIN b ON a.id=b.id"));
        assert!(!is_cacheable("UPDATE a SET x=1"));
        assert!(!is_cacheable("SELECT * FROM a"));
        assert!(!is_cacheable(
            "SELECT * FROM a JOIN b ON a.id = b.id WHERE a.x IN (SELECT y FROM c)"
        ));
        assert!(!is_cacheable(
            "SELECT * FROM a JOIN b ON a.id = b.id UNION SELECT * FROM c JOIN d ON c.id = d.id"
        ));
    }

    #[test]
    fn test_eligibility_memo() {
        let memo = EligibilityMemo::new(2);
        assert!(memo.check("SELECT * FROM a JOIN b ON a.id=b.id"));
        assert!(memo.check("SELECT * FROM a JOIN b ON a.id=b.id"));
        assert_eq!(memo.len(), 1);

        assert!(!memo.check("DELETE FROM a"));
        assert!(!memo.check("SELECT 1"));
        // 容量为 2，最旧的被淘汰
        assert_eq!(memo.len(), 2);
    }
}

//! sql-result-cache 命令行
//!
//! ```bash
//! # 通过缓存执行查询（可用 --tables 显式指定表）
//! sql-result-cache cache.toml app.db query "SELECT * FROM orders o JOIN customers c ON o.cust_id = c.id"
//!
//! # 签名比对、必要时重建，并执行淘汰
//! sql-result-cache cache.toml app.db maintain
//!
//! # 汇总统计、最近的事务日志与条目概况
//! sql-result-cache cache.toml app.db stats 20
//!
//! # 清空本库的缓存
//! sql-result-cache cache.toml app.db clear
//! ```
//!
//! 配置文件路径为 `-` 时使用默认配置。

use anyhow::{bail, Context, Result};
use sql_result_cache::models::{CacheSettings, ResultSet, Value};
use sql_result_cache::services::maintenance;
use sql_result_cache::{
    init_logger, CacheRegistry, QueryRequest, QueryResponse, SqliteConnector,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

struct Args {
    config: Option<PathBuf>,
    database: PathBuf,
    command: Command,
}

enum Command {
    Query { sql: String, tables: Option<Vec<String>> },
    Maintain,
    Stats { recent: usize },
    Clear,
}

const USAGE: &str = "用法: sql-result-cache <config.toml|-> <sqlite-db> <query \"<sql>\" [--tables a,b] | maintain | stats [n] | clear>";

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) if path == "-" => None,
        Some(path) => Some(PathBuf::from(path)),
        None => bail!("{USAGE}"),
    };
    let database = args.next().map(PathBuf::from).context(USAGE)?;
    let command = match args.next().as_deref() {
        Some("query") => {
            let sql = args.next().context("query 需要 SQL 语句")?;
            let tables = match args.next().as_deref() {
                Some("--tables") => Some(
                    args.next()
                        .context("--tables 需要表名列表")?
                        .split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect(),
                ),
                Some(other) => bail!("未知参数: {other}"),
                None => None,
            };
            Command::Query { sql, tables }
        }
        Some("maintain") => Command::Maintain,
        Some("stats") => Command::Stats {
            recent: match args.next() {
                Some(n) => n.parse().with_context(|| format!("无效的记录数: {n}"))?,
                None => 10,
            },
        },
        Some("clear") => Command::Clear,
        Some(other) => bail!("未知命令: {other}\n{USAGE}"),
        None => bail!("{USAGE}"),
    };
    Ok(Args {
        config,
        database,
        command,
    })
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

fn print_result(result: &ResultSet) {
    println!("{}", result.columns.join("\t"));
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(format_value).collect();
        println!("{}", cells.join("\t"));
    }
}

fn run(args: Args) -> Result<()> {
    let mut settings = match &args.config {
        Some(path) => CacheSettings::load(path)
            .with_context(|| format!("加载配置失败: {}", path.display()))?,
        None => CacheSettings::default(),
    };
    if settings.log.file_path.is_none() {
        settings.log.file_path = Some(settings.cache_dir.join("logs").to_string_lossy().into_owned());
    }
    init_logger(&settings.log)?;

    let connector = Arc::new(
        SqliteConnector::open(&args.database)
            .with_context(|| format!("打开数据库失败: {}", args.database.display()))?,
    );
    let namespace = args
        .database
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".to_string());

    let registry = CacheRegistry::new(settings)?;
    let cache = registry.register(&namespace, connector)?;

    match args.command {
        Command::Query { sql, tables } => {
            let mut request = QueryRequest::new(sql);
            if let Some(tables) = tables {
                request = request.tables(tables);
            }
            match cache.query(&request)? {
                QueryResponse::Served(served) => {
                    print_result(&served.result);
                    eprintln!(
                        "-- {} | {} | {:.3} ms | {}",
                        served.state.as_str(),
                        served.location,
                        served.elapsed_ms,
                        served.key
                    );
                }
                QueryResponse::NotCacheable => {
                    let result = cache.connector().execute_read(&request.sql)?;
                    print_result(&result);
                    eprintln!("-- 不可缓存，已直接查询数据库");
                }
            }
        }
        Command::Maintain => {
            let report = maintenance::run(&registry)?;
            println!("rebuilt: {}", report.rebuilt);
            for (namespace, eviction) in report.evictions {
                println!(
                    "{namespace}: {} -> {} (evicted {})",
                    eviction.before,
                    eviction.after,
                    eviction.evicted.len()
                );
            }
        }
        Command::Stats { recent } => {
            let stats = registry.stats();
            println!("{}", serde_json::to_string_pretty(&stats.aggregate()?)?);
            for record in stats.recent_records(recent)? {
                println!("{record}");
            }
            for entry in cache.entries()? {
                println!(
                    "{:.4}\t{:?}\t{}\t{}",
                    entry.importance,
                    entry.staleness,
                    entry.meta.cache_stats.impression_count,
                    entry.meta.sql
                );
            }
        }
        Command::Clear => {
            println!("removed: {}", cache.clear()?);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(2);
        }
    };
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("错误: {e:#}");
            ExitCode::FAILURE
        }
    }
}

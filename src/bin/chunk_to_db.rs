//! chunk-to-db - 把 chunk 目录转换为 SQLite 归档
//!
//! 用法：`chunk-to-db <chunk dir> <db path>`
//!
//! 每个分段按文件名顺序回放，chunk 原样写入一个新会话（mode = convert）。

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chunk_archive::{ChunkDB, ChunkDirectory, DbConfig, SessionInfo};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("chunk_archive=debug".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (src, dst) = match args.as_slice() {
        [src, dst] => (PathBuf::from(src), PathBuf::from(dst)),
        _ => bail!("usage: chunk-to-db <chunk dir> <db path>"),
    };

    tracing::info!("chunk-to-db v{}", env!("CARGO_PKG_VERSION"));

    let dir = ChunkDirectory::open(&src)
        .with_context(|| format!("打开 chunk 目录失败: {:?}", src))?;
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut info = SessionInfo::new("convert");
    info.args = args.join(" ");
    let db = ChunkDB::open(DbConfig::local(&dst), &info)
        .with_context(|| format!("打开数据库失败: {:?}", dst))?;

    let mut total = 0usize;
    for key in dir.keys()? {
        let mut count = 0usize;
        for chunk in dir.replay(&key)? {
            db.insert_chunk(&chunk?)
                .with_context(|| format!("写入分段 {} 失败", key))?;
            count += 1;
        }
        if !dir.is_finalised(&key) {
            tracing::warn!(key = %key, "segment was never finalised");
        }
        tracing::info!(key = %key, chunks = count, "segment converted");
        total += count;
    }

    db.close()?;
    tracing::info!(
        session = db.session_id(),
        chunks = total,
        "conversion complete"
    );
    Ok(())
}

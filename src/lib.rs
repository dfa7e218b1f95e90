//! chunk-archive - 分块归档库
//!
//! 把工作区导出的数据（频道、用户、消息、线程、文件、搜索结果）
//! 以 chunk 为单位写入存储后端，并在每个会话单元完成时触发导出转换。
//!
//! # 核心功能
//!
//! - **存储后端**: 目录（每个单元一个 gzip JSONL 段）或 SQLite（每个 chunk 一个事务）
//! - **引用计数**: 频道及其线程全部写完才算完成
//! - **转换协调**: 用户列表就绪前排队，就绪后后台转换
//! - **控制器**: 并发运行生成器与各类工作任务，汇总错误
//!
//! # 架构
//!
//! Streamer（拉取）→ 处理器（Recorder）→ ChunkStore（持久化）→ Transformer（导出）

pub mod chunk;
pub mod config;
pub mod controller;
pub mod db;
pub mod directory;
pub mod entity_list;
pub mod error;
pub mod export;
pub mod migrations;
pub mod processor;
pub mod reader;
pub mod recorder;
pub mod schema;
pub mod storage;
pub mod tracker;
pub mod transform;
pub mod types;
pub mod workers;

// Re-exports
pub use chunk::{Chunk, ChunkType, FileKey, Payload};
pub use config::{CoordinatorConfig, DbConfig, Flags, SessionInfo};
pub use controller::{Controller, ControllerConfig, SearchKinds};
pub use db::ChunkDB;
pub use directory::ChunkDirectory;
pub use entity_list::{EntityList, WorkItem};
pub use error::{Error, Result, Stage};
pub use export::{DirFs, ExportConverter, FsAdapter};
pub use reader::{ArchiveReader, Rows};
pub use storage::{ChunkStore, Source};
pub use tracker::{ReferenceTracker, Release};
pub use transform::{Converter, ExportCoordinator, NopTransformer, Transformer};
pub use types::*;

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

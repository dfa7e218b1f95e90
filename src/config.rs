//! 配置
//!
//! - `DbConfig`: 关系型后端的连接配置
//! - `SessionInfo`: 一次归档运行的元数据（写入 SESSION 表）
//! - `Flags`: 控制器开关
//! - `CoordinatorConfig`: 转换协调器配置

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::Span;

use crate::error::{Error, Result};

/// 数据库连接配置
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// 连接 URL
    /// - 本地: 直接路径
    /// - 远程: "libsql://host:port" (未来支持)
    pub url: String,

    /// 连接模式
    pub mode: ConnectionMode,
}

/// 连接模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// 本地 SQLite 文件
    Local,
    /// 远程 libSQL (未来支持)
    Remote,
}

impl DbConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        Self {
            url: path.display().to_string(),
            mode: ConnectionMode::Local,
        }
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        if let Ok(url) = std::env::var("CHUNK_ARCHIVE_DB_URL") {
            if url.starts_with("libsql://") {
                return Self {
                    url,
                    mode: ConnectionMode::Remote,
                };
            }
            return Self::local(url);
        }

        // 默认路径: ~/.chunk-archive/archive.db
        let default_path = dirs::home_dir()
            .map(|h| h.join(".chunk-archive").join("archive.db"))
            .unwrap_or_else(|| PathBuf::from("archive.db"));

        Self::local(default_path)
    }

    /// 获取数据库文件路径 (仅本地模式)
    pub fn path(&self) -> Option<PathBuf> {
        match self.mode {
            ConnectionMode::Local => Some(PathBuf::from(&self.url)),
            ConnectionMode::Remote => None,
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// 会话参数
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// 父会话（续跑 / 重扫时）
    pub parent_id: Option<i64>,
    /// 时间窗口起点
    pub from_ts: Option<DateTime<Utc>>,
    /// 时间窗口终点
    pub to_ts: Option<DateTime<Utc>>,
    pub files_enabled: bool,
    pub avatars_enabled: bool,
    /// 运行模式，例如 "archive"、"convert"
    pub mode: String,
    /// 原始命令行参数
    pub args: String,
}

impl SessionInfo {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            ..Default::default()
        }
    }

    /// 校验时间窗口
    pub fn validate(&self) -> Result<()> {
        if let (Some(from), Some(to)) = (self.from_ts, self.to_ts) {
            if from > to {
                return Err(Error::Config(format!(
                    "时间窗口无效: {} 晚于 {}",
                    from, to
                )));
            }
        }
        Ok(())
    }
}

/// 控制器开关
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    /// 只归档自己是成员的频道
    pub member_only: bool,
    /// 是否把文件列表也记录为 chunk
    pub record_files: bool,
    /// 允许用户列表为空（不启动转换）
    pub allow_empty_users: bool,
}

/// 转换协调器默认队列长度
pub const DEFAULT_TRANSFORM_BUFFER: usize = 100;

/// 转换协调器配置
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// 队列容量，小于 1 时使用默认值
    pub buffer_size: usize,
    /// 日志上下文
    pub span: Span,
}

impl CoordinatorConfig {
    pub(crate) fn capacity(&self) -> usize {
        if self.buffer_size < 1 {
            DEFAULT_TRANSFORM_BUFFER
        } else {
            self.buffer_size
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_TRANSFORM_BUFFER,
            span: tracing::info_span!("transform"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_local_config_path() {
        let config = DbConfig::local("/tmp/archive.db");
        assert_eq!(config.mode, ConnectionMode::Local);
        assert_eq!(config.path(), Some(PathBuf::from("/tmp/archive.db")));
    }

    #[test]
    fn test_session_window_validation() {
        let mut info = SessionInfo::new("archive");
        assert!(info.validate().is_ok());

        info.from_ts = Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        info.to_ts = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert!(matches!(info.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_coordinator_capacity_fallback() {
        let config = CoordinatorConfig {
            buffer_size: 0,
            ..Default::default()
        };
        assert_eq!(config.capacity(), DEFAULT_TRANSFORM_BUFFER);
    }
}

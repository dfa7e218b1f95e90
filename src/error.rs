//! 错误类型定义

use std::fmt;

use thiserror::Error;

/// 子任务阶段（错误聚合时的标签）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// 初始化
    Init,
    /// 生成工作项
    Generator,
    /// 拉取 / 写入
    Worker,
    /// 关闭处理器
    Close,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Generator => "generator",
            Stage::Worker => "worker",
            Stage::Close => "close",
        };
        f.write_str(s)
    }
}

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 对象不存在（未知 FileKey、会话等）
    #[error("未找到: {0}")]
    NotFound(String),

    /// 组件已关闭或已失败
    #[error("已关闭: {0}")]
    Closed(String),

    /// 分段关闭后仍被写入（编程错误）
    #[error("分段已关闭，禁止写入: {0}")]
    WriteAfterClose(String),

    /// 已完成的单元被重新创建
    #[error("单元已完成，不能重新打开: {0}")]
    AlreadyFinalised(String),

    /// 引用计数异常
    #[error("引用计数错误: {0}")]
    RefCount(String),

    /// 用户列表为空
    #[error("没有获取到任何用户")]
    NoUsers,

    /// 运行被取消
    #[error("操作已取消")]
    Cancelled,

    /// chunk 内容与类型不符
    #[error("无效的 chunk ({chunk_type}, {channel_id}): {reason}")]
    InvalidPayload {
        chunk_type: String,
        channel_id: String,
        reason: String,
    },

    /// 运行结束时仍未完成的单元
    #[error("未完成的单元: {}", .0.join(", "))]
    Incomplete(Vec<String>),

    /// 带标签的子任务错误
    #[error("{subroutine} ({stage}): {source}")]
    Subroutine {
        subroutine: &'static str,
        stage: Stage,
        #[source]
        source: Box<Error>,
    },

    /// 多个错误合并
    #[error("{}", join_display(.0))]
    Joined(Vec<Error>),

    /// 任务 panic / join 失败
    #[error("任务错误: {0}")]
    Task(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

fn join_display(errs: &[Error]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl Error {
    /// 给错误打上子任务标签
    pub fn tagged(subroutine: &'static str, stage: Stage, err: Error) -> Self {
        Error::Subroutine {
            subroutine,
            stage,
            source: Box::new(err),
        }
    }

    /// 合并多个错误：空返回 None，单个原样返回
    pub fn join(mut errs: Vec<Error>) -> Option<Error> {
        match errs.len() {
            0 => None,
            1 => errs.pop(),
            _ => Some(Error::Joined(errs)),
        }
    }

    /// 是否（包含）取消错误
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Subroutine { source, .. } => source.is_cancelled(),
            Error::Joined(errs) => errs.iter().any(Error::is_cancelled),
            _ => false,
        }
    }

    /// 展开后的所有叶子错误
    pub fn leaves(&self) -> Vec<&Error> {
        match self {
            Error::Subroutine { source, .. } => source.leaves(),
            Error::Joined(errs) => errs.iter().flat_map(Error::leaves).collect(),
            other => vec![other],
        }
    }

    /// 是否包含某个子任务的错误
    pub fn has_subroutine(&self, name: &str) -> bool {
        match self {
            Error::Subroutine { subroutine, .. } => *subroutine == name,
            Error::Joined(errs) => errs.iter().any(|e| e.has_subroutine(name)),
            _ => false,
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_empty_and_single() {
        assert!(Error::join(vec![]).is_none());

        let err = Error::join(vec![Error::NoUsers]).unwrap();
        assert!(matches!(err, Error::NoUsers));
    }

    #[test]
    fn test_joined_cancelled_lookup() {
        let err = Error::join(vec![
            Error::tagged("users", Stage::Worker, Error::NoUsers),
            Error::tagged("conversations", Stage::Worker, Error::Cancelled),
        ])
        .unwrap();

        assert!(err.is_cancelled());
        assert!(err.has_subroutine("users"));
        assert!(!err.has_subroutine("workspace"));
        assert_eq!(err.leaves().len(), 2);

        let text = err.to_string();
        assert!(text.contains("users (worker)"));
        assert!(text.contains("conversations (worker)"));
    }
}

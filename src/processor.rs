//! 处理器与协作方接口
//!
//! Streamer 把分页结果推给这里定义的处理器，而不是返回列表。
//! Filer / Avatars / Downloader 是可替换的副作用协作方，
//! 关闭下载时使用 `NopFiler` / `NopAvatars`。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::entity_list::WorkItem;
use crate::error::{Error, Result};
use crate::types::{Channel, File, Message, SearchMessage, User, WorkspaceInfo};

/// 会话（频道消息 + 线程 + 文件）处理器
#[async_trait]
pub trait ConversationProcessor: Send + Sync {
    /// 频道信息，线程专属归档时带 thread_ts
    async fn channel_info(&self, channel: &Channel, thread_ts: Option<&str>) -> Result<()>;

    /// 频道消息页
    async fn messages(
        &self,
        channel_id: &str,
        num_threads: usize,
        is_last: bool,
        messages: &[Message],
    ) -> Result<()>;

    /// 线程消息页
    async fn thread_messages(
        &self,
        channel_id: &str,
        parent: &Message,
        thread_only: bool,
        is_last: bool,
        replies: &[Message],
    ) -> Result<()>;

    /// 消息附带的文件
    async fn files(&self, channel: &Channel, parent: &Message, files: &[File]) -> Result<()>;

    /// 频道成员
    async fn channel_users(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        users: &[String],
    ) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 用户处理器
#[async_trait]
pub trait UserProcessor: Send + Sync {
    async fn users(&self, users: &[User]) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 频道列表处理器
#[async_trait]
pub trait ChannelProcessor: Send + Sync {
    async fn channels(&self, channels: &[Channel]) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 工作区信息处理器
#[async_trait]
pub trait WorkspaceProcessor: Send + Sync {
    async fn workspace_info(&self, info: &WorkspaceInfo) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 搜索结果处理器
#[async_trait]
pub trait SearchProcessor: Send + Sync {
    async fn search_messages(&self, query: &str, messages: &[SearchMessage]) -> Result<()>;

    async fn search_files(&self, query: &str, files: &[File]) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 频道列表过滤参数
#[derive(Debug, Clone)]
pub struct ChannelFilter {
    /// 频道类型，例如 public_channel / private_channel / mpim / im
    pub types: Vec<String>,
}

impl Default for ChannelFilter {
    fn default() -> Self {
        Self {
            types: ["public_channel", "private_channel", "mpim", "im"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// 远端 API 拉取方
///
/// 所有方法在 `cancel` 触发后应尽快返回 `Error::Cancelled`。
#[async_trait]
pub trait Streamer: Send + Sync {
    async fn list_channels(
        &self,
        cancel: &CancellationToken,
        proc: &dyn ChannelProcessor,
        filter: &ChannelFilter,
    ) -> Result<()>;

    async fn users(&self, cancel: &CancellationToken, proc: &dyn UserProcessor) -> Result<()>;

    /// 消费工作项，直到通道关闭
    async fn conversations(
        &self,
        cancel: &CancellationToken,
        proc: &dyn ConversationProcessor,
        items: tokio::sync::mpsc::Receiver<WorkItem>,
    ) -> Result<()>;

    async fn workspace_info(
        &self,
        cancel: &CancellationToken,
        proc: &dyn WorkspaceProcessor,
    ) -> Result<()>;

    async fn search_messages(
        &self,
        cancel: &CancellationToken,
        proc: &dyn SearchProcessor,
        query: &str,
    ) -> Result<()>;

    async fn search_files(
        &self,
        cancel: &CancellationToken,
        proc: &dyn SearchProcessor,
        query: &str,
    ) -> Result<()>;
}

/// 文件处理方
#[async_trait]
pub trait Filer: Send + Sync {
    async fn files(&self, channel: &Channel, parent: &Message, files: &[File]) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 头像处理方
#[async_trait]
pub trait Avatars: Send + Sync {
    async fn users(&self, users: &[User]) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 下载器
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, dest: &Path, url: &str) -> Result<()>;
}

/// 不处理文件
#[derive(Debug, Clone, Copy, Default)]
pub struct NopFiler;

#[async_trait]
impl Filer for NopFiler {
    async fn files(&self, _: &Channel, _: &Message, _: &[File]) -> Result<()> {
        Ok(())
    }
}

/// 不处理头像
#[derive(Debug, Clone, Copy, Default)]
pub struct NopAvatars;

#[async_trait]
impl Avatars for NopAvatars {
    async fn users(&self, _: &[User]) -> Result<()> {
        Ok(())
    }
}

/// 上传文件目录
pub const UPLOADS_DIR: &str = "__uploads";

/// 通过 Downloader 下载文件到 `__uploads/<file id>/<name>`
pub struct DownloadFiler {
    downloader: Arc<dyn Downloader>,
    base: PathBuf,
}

impl DownloadFiler {
    pub fn new(downloader: Arc<dyn Downloader>, base: impl Into<PathBuf>) -> Self {
        Self {
            downloader,
            base: base.into(),
        }
    }

    /// 文件的目标路径
    pub fn file_path(&self, file: &File) -> PathBuf {
        let name = if file.name.is_empty() {
            file.id.as_str()
        } else {
            file.name.as_str()
        };
        self.base.join(UPLOADS_DIR).join(&file.id).join(name)
    }
}

#[async_trait]
impl Filer for DownloadFiler {
    async fn files(&self, channel: &Channel, parent: &Message, files: &[File]) -> Result<()> {
        for file in files {
            let Some(url) = file.url_private.as_deref() else {
                // 外部文件 / 已删除的文件没有下载地址
                tracing::debug!(
                    channel = %channel.id,
                    ts = %parent.ts,
                    file = %file.id,
                    "skipping file without url"
                );
                continue;
            };
            let dest = self.file_path(file);
            self.downloader
                .download(&dest, url)
                .await
                .map_err(|e| match e {
                    Error::Cancelled => Error::Cancelled,
                    other => Error::Other(anyhow::anyhow!(
                        "下载文件 {} 失败: {}",
                        file.id,
                        other
                    )),
                })?;
        }
        Ok(())
    }
}

//! 工作任务
//!
//! 每类任务一个 tokio 任务：工作项生成、工作区信息、用户、会话、搜索。
//! 任务只把自己的错误发到共享的错误通道，不直接影响其他任务。
//! 所有跨任务的发送都同时等待取消信号。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::entity_list::{EntityList, WorkItem};
use crate::error::{Error, Result, Stage};
use crate::processor::{
    ChannelFilter, ChannelProcessor, ConversationProcessor, SearchProcessor, Streamer,
    UserProcessor, WorkspaceProcessor,
};
use crate::types::Channel;

pub const SUB_GENERATOR: &str = "generator";
pub const SUB_WORKSPACE: &str = "workspace";
pub const SUB_USERS: &str = "users";
pub const SUB_CONVERSATIONS: &str = "conversations";
pub const SUB_SEARCH_MESSAGES: &str = "search_messages";
pub const SUB_SEARCH_FILES: &str = "search_files";

/// 带标签地发出错误
pub(crate) async fn emit(
    errc: &mpsc::Sender<Error>,
    subroutine: &'static str,
    stage: Stage,
    err: Error,
) {
    // 接收端在所有任务结束前不会关闭
    let _ = errc.send(Error::tagged(subroutine, stage, err)).await;
}

/// 发送工作项，取消时返回 `Error::Cancelled`
async fn send_item(
    cancel: &CancellationToken,
    links: &mpsc::Sender<WorkItem>,
    item: WorkItem,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = links.send(item) => res.map_err(|_| Error::Closed("工作项通道已关闭".into())),
    }
}

// ==================== 生成器 ====================

/// 从显式列表生成（只发包含项）
pub async fn generate_from_list(
    cancel: &CancellationToken,
    links: &mpsc::Sender<WorkItem>,
    list: &EntityList,
) -> Result<()> {
    let mut sent = 0usize;
    for item in list.includes() {
        send_item(cancel, links, item.clone()).await?;
        sent += 1;
    }
    info!(sent, "generator from list done");
    Ok(())
}

/// 频道过滤：跳过排除项、非成员频道和重复频道，其余作为工作项发出
pub struct ChannelGenerator {
    cancel: CancellationToken,
    links: mpsc::Sender<WorkItem>,
    list: EntityList,
    member_only: bool,
    seen: Mutex<HashSet<String>>,
    /// 同时记录频道列表
    next: Option<Arc<dyn ChannelProcessor>>,
}

impl ChannelGenerator {
    pub fn new(
        cancel: CancellationToken,
        links: mpsc::Sender<WorkItem>,
        list: EntityList,
        member_only: bool,
        next: Option<Arc<dyn ChannelProcessor>>,
    ) -> Self {
        Self {
            cancel,
            links,
            list,
            member_only,
            seen: Mutex::new(HashSet::new()),
            next,
        }
    }

    fn wanted(&self, ch: &Channel) -> bool {
        if self.list.is_excluded(&ch.id) {
            debug!(channel = %ch.id, "excluded");
            return false;
        }
        if self.member_only && !ch.is_member {
            debug!(channel = %ch.id, "not a member, skipped");
            return false;
        }
        self.seen.lock().insert(ch.id.clone())
    }
}

#[async_trait]
impl ChannelProcessor for ChannelGenerator {
    async fn channels(&self, channels: &[Channel]) -> Result<()> {
        if let Some(next) = &self.next {
            next.channels(channels).await?;
        }
        for ch in channels {
            if !self.wanted(ch) {
                continue;
            }
            // 列表里有时间窗口时沿用
            let item = self
                .list
                .get(&ch.id)
                .cloned()
                .unwrap_or_else(|| WorkItem::include(ch.id.clone()));
            send_item(&self.cancel, &self.links, item).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        match &self.next {
            Some(next) => next.close().await,
            None => Ok(()),
        }
    }
}

/// 通过 API 列出频道生成
pub async fn generate_from_api(
    cancel: &CancellationToken,
    streamer: &dyn Streamer,
    generator: &ChannelGenerator,
) -> Result<()> {
    streamer
        .list_channels(cancel, generator, &ChannelFilter::default())
        .await?;
    info!(channels = generator.seen.lock().len(), "generator from api done");
    Ok(())
}

// ==================== 工作任务 ====================

/// 工作区信息：一次调用，一个 chunk
pub async fn workspace_worker(
    cancel: CancellationToken,
    streamer: Arc<dyn Streamer>,
    proc: Arc<dyn WorkspaceProcessor>,
    errc: mpsc::Sender<Error>,
) {
    if let Err(e) = streamer.workspace_info(&cancel, proc.as_ref()).await {
        emit(&errc, SUB_WORKSPACE, Stage::Worker, e).await;
    }
    if let Err(e) = proc.close().await {
        emit(&errc, SUB_WORKSPACE, Stage::Close, e).await;
    }
    info!("workspace info done");
}

/// 用户：拉取完成后先关闭记录器，再通知收集器（打开转换闸门）；
/// 拉取失败时不通知收集器
pub async fn user_worker(
    cancel: CancellationToken,
    streamer: Arc<dyn Streamer>,
    recorder: Arc<dyn UserProcessor>,
    collector: Arc<dyn UserProcessor>,
    errc: mpsc::Sender<Error>,
) {
    let joint = crate::recorder::JointUsers::new(vec![collector.clone(), recorder.clone()]);
    match streamer.users(&cancel, &joint).await {
        Ok(()) => {
            if let Err(e) = joint.close().await {
                emit(&errc, SUB_USERS, Stage::Close, e).await;
            }
        }
        Err(e) => {
            emit(&errc, SUB_USERS, Stage::Worker, e).await;
            if let Err(e) = recorder.close().await {
                emit(&errc, SUB_USERS, Stage::Close, e).await;
            }
        }
    }
    info!("users done");
}

/// 会话：消费工作项直到通道关闭
pub async fn conversation_worker(
    cancel: CancellationToken,
    streamer: Arc<dyn Streamer>,
    proc: Arc<dyn ConversationProcessor>,
    links: mpsc::Receiver<WorkItem>,
    errc: mpsc::Sender<Error>,
) {
    if let Err(e) = streamer.conversations(&cancel, proc.as_ref(), links).await {
        emit(&errc, SUB_CONVERSATIONS, Stage::Worker, e).await;
    }
    if let Err(e) = proc.close().await {
        emit(&errc, SUB_CONVERSATIONS, Stage::Close, e).await;
    }
    info!("conversations done");
}

/// 搜索消息
pub async fn search_messages_worker(
    cancel: CancellationToken,
    streamer: Arc<dyn Streamer>,
    proc: Arc<dyn SearchProcessor>,
    query: String,
    errc: mpsc::Sender<Error>,
) {
    if let Err(e) = streamer.search_messages(&cancel, proc.as_ref(), &query).await {
        emit(&errc, SUB_SEARCH_MESSAGES, Stage::Worker, e).await;
    }
    info!(query = %query, "search messages done");
}

/// 搜索文件
pub async fn search_files_worker(
    cancel: CancellationToken,
    streamer: Arc<dyn Streamer>,
    proc: Arc<dyn SearchProcessor>,
    query: String,
    errc: mpsc::Sender<Error>,
) {
    if let Err(e) = streamer.search_files(&cancel, proc.as_ref(), &query).await {
        emit(&errc, SUB_SEARCH_FILES, Stage::Worker, e).await;
    }
    info!(query = %query, "search files done");
}

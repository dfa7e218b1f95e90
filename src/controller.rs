//! 控制器
//!
//! 组装处理器、为每类任务启动一个 tokio 任务，并汇总所有任务的错误。
//! 错误通道在全部任务结束（所有发送端释放）后关闭，控制器读完后合并返回，
//! 不会因为第一个错误提前结束。
//!
//! `close` 尽力关闭每个持有的资源，合并关闭错误；关闭过程中的 panic 只记录日志。

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument, Span};

use crate::config::Flags;
use crate::entity_list::{EntityList, WorkItem};
use crate::error::{Error, Result, Stage};
use crate::processor::{
    Avatars, ChannelProcessor, ConversationProcessor, Filer, NopAvatars, NopFiler,
    SearchProcessor, Streamer, UserProcessor, WorkspaceProcessor,
};
use crate::recorder::{
    AvatarUsers, ChannelRecorder, ConversationRecorder, JointUsers, SearchRecorder, UserCollector,
    UserRecorder, WorkspaceRecorder,
};
use crate::storage::ChunkStore;
use crate::transform::{NopTransformer, Transformer};
use crate::workers::{self, ChannelGenerator, SUB_GENERATOR};

/// 错误通道容量
const ERROR_BUFFER: usize = 16;

/// 控制器配置
pub struct ControllerConfig {
    /// 默认不转换
    pub transformer: Arc<dyn Transformer>,
    /// 默认不下载文件
    pub filer: Arc<dyn Filer>,
    /// 默认不下载头像
    pub avatars: Arc<dyn Avatars>,
    pub flags: Flags,
    /// 生成器到会话任务的通道容量，至少为 1
    pub link_buffer: usize,
    /// 日志上下文
    pub span: Span,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            transformer: Arc::new(NopTransformer),
            filer: Arc::new(NopFiler),
            avatars: Arc::new(NopAvatars),
            flags: Flags::default(),
            link_buffer: 1,
            span: tracing::info_span!("controller"),
        }
    }
}

impl ControllerConfig {
    fn validate(&self) -> Result<()> {
        if self.link_buffer == 0 {
            return Err(Error::Config("link_buffer 至少为 1".into()));
        }
        Ok(())
    }
}

/// 要执行的搜索
#[derive(Debug, Clone, Copy)]
pub struct SearchKinds {
    pub messages: bool,
    pub files: bool,
}

impl Default for SearchKinds {
    fn default() -> Self {
        Self {
            messages: true,
            files: true,
        }
    }
}

/// 控制器
pub struct Controller {
    store: Arc<dyn ChunkStore>,
    streamer: Arc<dyn Streamer>,
    transformer: Arc<dyn Transformer>,
    filer: Arc<dyn Filer>,
    avatars: Arc<dyn Avatars>,
    flags: Flags,
    link_buffer: usize,
    span: Span,
    closed: AtomicBool,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        streamer: Arc<dyn Streamer>,
        config: ControllerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            streamer,
            transformer: config.transformer,
            filer: config.filer,
            avatars: config.avatars,
            flags: config.flags,
            link_buffer: config.link_buffer,
            span: config.span,
            closed: AtomicBool::new(false),
        })
    }

    /// 归档列表中的（或 API 列出的）全部频道
    pub async fn run(&self, cancel: &CancellationToken, list: &EntityList) -> Result<()> {
        self.run_inner(cancel, list)
            .instrument(self.span.clone())
            .await
    }

    async fn run_inner(&self, cancel: &CancellationToken, list: &EntityList) -> Result<()> {
        let init = |e| Error::tagged("controller", Stage::Init, e);

        let conversations: Arc<dyn ConversationProcessor> = Arc::new(ConversationRecorder::new(
            self.store.clone(),
            self.filer.clone(),
            self.transformer.clone(),
            self.flags,
        ));
        let workspace: Arc<dyn WorkspaceProcessor> =
            Arc::new(WorkspaceRecorder::new(self.store.clone()).map_err(init)?);
        let user_recorder: Arc<dyn UserProcessor> = Arc::new(JointUsers::new(vec![
            Arc::new(UserRecorder::new(self.store.clone()).map_err(init)?),
            Arc::new(AvatarUsers(self.avatars.clone())),
        ]));
        let collector: Arc<dyn UserProcessor> = Arc::new(UserCollector::new(
            self.transformer.clone(),
            self.flags.allow_empty_users,
        ));
        // 显式列表时不需要记录频道列表
        let channels: Option<Arc<dyn ChannelProcessor>> = if list.has_includes() {
            None
        } else {
            Some(Arc::new(
                ChannelRecorder::new(self.store.clone()).map_err(init)?,
            ))
        };

        let (errc, mut errors) = mpsc::channel::<Error>(ERROR_BUFFER);
        let (links_tx, links_rx) = mpsc::channel::<WorkItem>(self.link_buffer);
        let mut tasks = JoinSet::new();

        // 生成器
        {
            let cancel = cancel.clone();
            let errc = errc.clone();
            let list = list.clone();
            let streamer = self.streamer.clone();
            let member_only = self.flags.member_only;
            tasks.spawn(
                async move {
                    match channels {
                        None => {
                            if let Err(e) = workers::generate_from_list(&cancel, &links_tx, &list).await {
                                workers::emit(&errc, SUB_GENERATOR, Stage::Generator, e).await;
                            }
                        }
                        Some(channels) => {
                            let gen = ChannelGenerator::new(
                                cancel.clone(),
                                links_tx,
                                list,
                                member_only,
                                Some(channels),
                            );
                            if let Err(e) =
                                workers::generate_from_api(&cancel, streamer.as_ref(), &gen).await
                            {
                                workers::emit(&errc, SUB_GENERATOR, Stage::Generator, e).await;
                            }
                            if let Err(e) = gen.close().await {
                                workers::emit(&errc, SUB_GENERATOR, Stage::Close, e).await;
                            }
                        }
                    }
                    info!("generator done");
                }
                .in_current_span(),
            );
        }

        tasks.spawn(
            workers::workspace_worker(cancel.clone(), self.streamer.clone(), workspace, errc.clone())
                .in_current_span(),
        );
        tasks.spawn(
            workers::user_worker(
                cancel.clone(),
                self.streamer.clone(),
                user_recorder,
                collector,
                errc.clone(),
            )
            .in_current_span(),
        );
        tasks.spawn(
            workers::conversation_worker(
                cancel.clone(),
                self.streamer.clone(),
                conversations,
                links_rx,
                errc.clone(),
            )
            .in_current_span(),
        );
        drop(errc);

        let errs = collect(&mut errors, &mut tasks).await;
        info!(errors = errs.len(), "run finished");
        Error::join(errs).map_or(Ok(()), Err)
    }

    /// 搜索消息和 / 或文件
    pub async fn search(
        &self,
        cancel: &CancellationToken,
        query: &str,
        kinds: SearchKinds,
    ) -> Result<()> {
        let span = self.span.clone();
        async move {
            let recorder: Arc<dyn SearchProcessor> = Arc::new(
                SearchRecorder::new(self.store.clone(), self.filer.clone())
                    .map_err(|e| Error::tagged("controller", Stage::Init, e))?,
            );

            let (errc, mut errors) = mpsc::channel::<Error>(ERROR_BUFFER);
            let mut tasks = JoinSet::new();
            if kinds.messages {
                tasks.spawn(
                    workers::search_messages_worker(
                        cancel.clone(),
                        self.streamer.clone(),
                        recorder.clone(),
                        query.to_string(),
                        errc.clone(),
                    )
                    .in_current_span(),
                );
            }
            if kinds.files {
                tasks.spawn(
                    workers::search_files_worker(
                        cancel.clone(),
                        self.streamer.clone(),
                        recorder.clone(),
                        query.to_string(),
                        errc.clone(),
                    )
                    .in_current_span(),
                );
            }
            drop(errc);

            let mut errs = collect(&mut errors, &mut tasks).await;
            if let Err(e) = recorder.close().await {
                errs.push(Error::tagged("search", Stage::Close, e));
            }
            Error::join(errs).map_or(Ok(()), Err)
        }
        .instrument(span)
        .await
    }

    /// 关闭所有持有的资源（幂等）
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut errs = Vec::new();
        close_quietly("transformer", self.transformer.close(), &mut errs).await;
        close_quietly("filer", self.filer.close(), &mut errs).await;
        close_quietly("avatars", self.avatars.close(), &mut errs).await;
        let store = self.store.clone();
        close_quietly("storage", async move { store.close() }, &mut errs).await;
        Error::join(errs).map_or(Ok(()), Err)
    }
}

/// 读完错误通道，再等待全部任务结束
async fn collect(errors: &mut mpsc::Receiver<Error>, tasks: &mut JoinSet<()>) -> Vec<Error> {
    let mut errs = Vec::new();
    while let Some(e) = errors.recv().await {
        error!(error = %e, "subroutine failed");
        errs.push(e);
    }
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "task failed");
            errs.push(Error::Task(e.to_string()));
        }
    }
    errs
}

async fn close_quietly<F>(component: &'static str, fut: F, errs: &mut Vec<Error>)
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(component, error = %e, "close failed");
            errs.push(Error::tagged(component, Stage::Close, e));
        }
        Err(panic) => {
            warn!(component, panic = %panic_message(panic.as_ref()), "recovered panic during close");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

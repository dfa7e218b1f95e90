//! 记录器
//!
//! 把 Streamer 推来的数据写成 chunk。会话记录器同时维护引用计数，
//! 单元完成时关闭分段并触发转换，每个单元只触发一次。

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chunk::{Chunk, FileKey};
use crate::config::Flags;
use crate::error::{Error, Result};
use crate::processor::{
    Avatars, ChannelProcessor, ConversationProcessor, Filer, SearchProcessor, UserProcessor,
    WorkspaceProcessor,
};
use crate::storage::ChunkStore;
use crate::tracker::{ReferenceTracker, Release};
use crate::transform::Transformer;
use crate::types::{Channel, File, Message, SearchMessage, User, WorkspaceInfo};

// ==================== 会话 ====================

/// 会话记录器
pub struct ConversationRecorder {
    store: Arc<dyn ChunkStore>,
    tracker: ReferenceTracker,
    filer: Arc<dyn Filer>,
    transformer: Arc<dyn Transformer>,
    record_files: bool,
}

impl ConversationRecorder {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        filer: Arc<dyn Filer>,
        transformer: Arc<dyn Transformer>,
        flags: Flags,
    ) -> Self {
        Self {
            store,
            tracker: ReferenceTracker::new(),
            filer,
            transformer,
            record_files: flags.record_files,
        }
    }

    /// 当前引用计数（调试 / 测试用）
    pub fn ref_count(&self, key: &FileKey) -> Option<i64> {
        self.tracker.count(key)
    }

    /// 确保单元已登记、分段已打开
    fn ensure(&self, key: &FileKey) -> Result<()> {
        if self.tracker.register(key)? {
            self.store.open(key)?;
        }
        Ok(())
    }

    fn write(&self, key: &FileKey, chunk: &Chunk) -> Result<()> {
        self.ensure(key)?;
        self.store.write(key, chunk)
    }

    /// 完成一个工作单元，归零时关闭分段并触发转换
    async fn release(&self, key: &FileKey) -> Result<()> {
        match self.tracker.release(key)? {
            Release::Pending(_) => Ok(()),
            Release::Finalised => {
                self.store.finalise(key)?;
                debug!(key = %key, "unit finalised");
                self.transformer.transform(key).await
            }
        }
    }
}

#[async_trait]
impl ConversationProcessor for ConversationRecorder {
    async fn channel_info(&self, channel: &Channel, thread_ts: Option<&str>) -> Result<()> {
        let chunk = Chunk::channel_info(channel.clone(), thread_ts);
        self.write(&chunk.file_key(), &chunk)
    }

    async fn messages(
        &self,
        channel_id: &str,
        num_threads: usize,
        is_last: bool,
        messages: &[Message],
    ) -> Result<()> {
        let chunk = Chunk::messages(channel_id, num_threads, is_last, messages.to_vec());
        let key = chunk.file_key();
        self.write(&key, &chunk)?;
        // 先预留线程，再释放频道本身
        self.tracker.add(&key, num_threads)?;
        if is_last {
            self.release(&key).await?;
        }
        Ok(())
    }

    async fn thread_messages(
        &self,
        channel_id: &str,
        parent: &Message,
        thread_only: bool,
        is_last: bool,
        replies: &[Message],
    ) -> Result<()> {
        let chunk = Chunk::thread_messages(
            channel_id,
            parent.clone(),
            thread_only,
            is_last,
            replies.to_vec(),
        );
        let key = chunk.file_key();
        self.write(&key, &chunk)?;
        if is_last {
            self.release(&key).await?;
        }
        Ok(())
    }

    async fn files(&self, channel: &Channel, parent: &Message, files: &[File]) -> Result<()> {
        self.filer.files(channel, parent, files).await?;
        if !self.record_files {
            return Ok(());
        }
        let mut chunk = Chunk::files(channel.clone(), parent.clone(), files.to_vec());
        // 线程专属归档中的文件写到线程分段
        if let Some(ts) = parent.thread_ts.as_deref() {
            let own = FileKey::thread(&channel.id, ts, true);
            if self.tracker.count(&own).is_some() {
                chunk.thread_only = true;
            }
        }
        self.write(&chunk.file_key(), &chunk)
    }

    async fn channel_users(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        users: &[String],
    ) -> Result<()> {
        let chunk = Chunk::channel_users(channel_id, thread_ts, users.to_vec());
        self.write(&chunk.file_key(), &chunk)
    }

    /// 未归零的单元视为未完成
    async fn close(&self) -> Result<()> {
        let open = self.tracker.drain_open();
        if open.is_empty() {
            return Ok(());
        }
        for (key, count) in &open {
            warn!(key = %key, count, "unit left unfinished");
        }
        Err(Error::Incomplete(
            open.into_iter().map(|(k, _)| k.to_string()).collect(),
        ))
    }
}

// ==================== 字典类 ====================

/// 用户记录器
pub struct UserRecorder {
    store: Arc<dyn ChunkStore>,
}

impl UserRecorder {
    pub fn new(store: Arc<dyn ChunkStore>) -> Result<Self> {
        store.open(&FileKey::users())?;
        Ok(Self { store })
    }
}

#[async_trait]
impl UserProcessor for UserRecorder {
    async fn users(&self, users: &[User]) -> Result<()> {
        self.store
            .write(&FileKey::users(), &Chunk::users(users.to_vec()))
    }

    async fn close(&self) -> Result<()> {
        self.store.finalise(&FileKey::users())
    }
}

/// 频道列表记录器
pub struct ChannelRecorder {
    store: Arc<dyn ChunkStore>,
}

impl ChannelRecorder {
    pub fn new(store: Arc<dyn ChunkStore>) -> Result<Self> {
        store.open(&FileKey::channels())?;
        Ok(Self { store })
    }
}

#[async_trait]
impl ChannelProcessor for ChannelRecorder {
    async fn channels(&self, channels: &[Channel]) -> Result<()> {
        self.store
            .write(&FileKey::channels(), &Chunk::channels(channels.to_vec()))
    }

    async fn close(&self) -> Result<()> {
        self.store.finalise(&FileKey::channels())
    }
}

/// 工作区信息记录器
pub struct WorkspaceRecorder {
    store: Arc<dyn ChunkStore>,
}

impl WorkspaceRecorder {
    pub fn new(store: Arc<dyn ChunkStore>) -> Result<Self> {
        store.open(&FileKey::workspace())?;
        Ok(Self { store })
    }
}

#[async_trait]
impl WorkspaceProcessor for WorkspaceRecorder {
    async fn workspace_info(&self, info: &WorkspaceInfo) -> Result<()> {
        self.store
            .write(&FileKey::workspace(), &Chunk::workspace_info(info.clone()))
    }

    async fn close(&self) -> Result<()> {
        self.store.finalise(&FileKey::workspace())
    }
}

/// 搜索结果记录器，命中的文件交给 Filer
pub struct SearchRecorder {
    store: Arc<dyn ChunkStore>,
    filer: Arc<dyn Filer>,
}

impl SearchRecorder {
    pub fn new(store: Arc<dyn ChunkStore>, filer: Arc<dyn Filer>) -> Result<Self> {
        store.open(&FileKey::search())?;
        Ok(Self { store, filer })
    }
}

#[async_trait]
impl SearchProcessor for SearchRecorder {
    async fn search_messages(&self, query: &str, messages: &[SearchMessage]) -> Result<()> {
        self.store.write(
            &FileKey::search(),
            &Chunk::search_messages(query, messages.to_vec()),
        )
    }

    async fn search_files(&self, query: &str, files: &[File]) -> Result<()> {
        self.store
            .write(&FileKey::search(), &Chunk::search_files(query, files.to_vec()))?;
        // 搜索结果没有所属消息
        let channel = Channel::default();
        let parent = Message::default();
        self.filer.files(&channel, &parent, files).await
    }

    async fn close(&self) -> Result<()> {
        self.store.finalise(&FileKey::search())
    }
}

// ==================== 用户收集 ====================

/// 收集全部用户，关闭时打开转换闸门
pub struct UserCollector {
    users: Mutex<Vec<User>>,
    transformer: Arc<dyn Transformer>,
    allow_empty: bool,
}

impl UserCollector {
    pub fn new(transformer: Arc<dyn Transformer>, allow_empty: bool) -> Self {
        Self {
            users: Mutex::new(Vec::new()),
            transformer,
            allow_empty,
        }
    }
}

#[async_trait]
impl UserProcessor for UserCollector {
    async fn users(&self, users: &[User]) -> Result<()> {
        self.users.lock().extend_from_slice(users);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let users = std::mem::take(&mut *self.users.lock());
        if users.is_empty() {
            if self.allow_empty {
                warn!("no users collected, transform not started");
                return Ok(());
            }
            return Err(Error::NoUsers);
        }
        debug!(users = users.len(), "users collected");
        self.transformer.start_with_users(users).await
    }
}

/// 依次调用多个用户处理器，关闭时逆序关闭并合并错误
pub struct JointUsers {
    procs: Vec<Arc<dyn UserProcessor>>,
}

impl JointUsers {
    pub fn new(procs: Vec<Arc<dyn UserProcessor>>) -> Self {
        Self { procs }
    }
}

#[async_trait]
impl UserProcessor for JointUsers {
    async fn users(&self, users: &[User]) -> Result<()> {
        for p in &self.procs {
            p.users(users).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut errs = Vec::new();
        for p in self.procs.iter().rev() {
            if let Err(e) = p.close().await {
                errs.push(e);
            }
        }
        Error::join(errs).map_or(Ok(()), Err)
    }
}

/// 头像处理器作为用户处理器
pub struct AvatarUsers(pub Arc<dyn Avatars>);

#[async_trait]
impl UserProcessor for AvatarUsers {
    async fn users(&self, users: &[User]) -> Result<()> {
        self.0.users(users).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::NopFiler;

    /// 只记录调用的存储
    #[derive(Default)]
    struct MemStore {
        log: Mutex<Vec<String>>,
    }

    impl ChunkStore for MemStore {
        fn open(&self, key: &FileKey) -> Result<()> {
            self.log.lock().push(format!("open {}", key));
            Ok(())
        }
        fn write(&self, key: &FileKey, chunk: &Chunk) -> Result<()> {
            self.log
                .lock()
                .push(format!("write {} {}", key, chunk.chunk_type()));
            Ok(())
        }
        fn finalise(&self, key: &FileKey) -> Result<()> {
            self.log.lock().push(format!("finalise {}", key));
            Ok(())
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingTransformer {
        keys: Mutex<Vec<FileKey>>,
        users: Mutex<Option<usize>>,
    }

    #[async_trait]
    impl Transformer for CountingTransformer {
        async fn transform(&self, key: &FileKey) -> Result<()> {
            self.keys.lock().push(key.clone());
            Ok(())
        }
        async fn start_with_users(&self, users: Vec<User>) -> Result<()> {
            *self.users.lock() = Some(users.len());
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn recorder() -> (ConversationRecorder, Arc<MemStore>, Arc<CountingTransformer>) {
        let store = Arc::new(MemStore::default());
        let tf = Arc::new(CountingTransformer::default());
        let rec = ConversationRecorder::new(
            store.clone(),
            Arc::new(NopFiler),
            tf.clone(),
            Flags {
                record_files: true,
                ..Default::default()
            },
        );
        (rec, store, tf)
    }

    fn parent(ts: &str) -> Message {
        let mut m = Message::new(ts, "U1", "p");
        m.thread_ts = Some(ts.into());
        m.reply_count = 1;
        m
    }

    #[tokio::test]
    async fn test_channel_thread_channel_sequence() {
        let (rec, store, tf) = recorder();
        let key = FileKey::channel("C1");
        let p = parent("1.0");

        rec.messages("C1", 1, false, &[p.clone()]).await.unwrap();
        assert_eq!(rec.ref_count(&key), Some(2));

        rec.thread_messages("C1", &p, false, true, &[]).await.unwrap();
        assert_eq!(rec.ref_count(&key), Some(1));
        assert!(tf.keys.lock().is_empty());

        rec.messages("C1", 0, true, &[]).await.unwrap();
        assert_eq!(rec.ref_count(&key), None);
        assert_eq!(*tf.keys.lock(), vec![key.clone()]);

        let log = store.log.lock().clone();
        assert_eq!(log.first().unwrap(), "open C1");
        assert_eq!(log.last().unwrap(), "finalise C1");
        assert_eq!(log.iter().filter(|l| l.starts_with("open")).count(), 1);
        rec.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_thread_only_unit() {
        let (rec, _store, tf) = recorder();
        let p = parent("5.0");
        rec.channel_info(&Channel::new("C1", "general"), Some("5.0"))
            .await
            .unwrap();
        rec.thread_messages("C1", &p, true, false, &[]).await.unwrap();
        rec.thread_messages("C1", &p, true, true, &[]).await.unwrap();

        assert_eq!(*tf.keys.lock(), vec![FileKey::thread("C1", "5.0", true)]);
    }

    #[tokio::test]
    async fn test_close_reports_incomplete() {
        let (rec, _store, tf) = recorder();
        rec.messages("C1", 2, true, &[]).await.unwrap();

        let err = rec.close().await.unwrap_err();
        match err {
            Error::Incomplete(keys) => assert_eq!(keys, vec!["C1".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(tf.keys.lock().is_empty());
    }

    #[tokio::test]
    async fn test_user_collector() {
        let tf = Arc::new(CountingTransformer::default());
        let collector = UserCollector::new(tf.clone(), false);
        assert!(matches!(collector.close().await, Err(Error::NoUsers)));

        collector.users(&[User::new("U1", "a")]).await.unwrap();
        collector.users(&[User::new("U2", "b")]).await.unwrap();
        collector.close().await.unwrap();
        assert_eq!(*tf.users.lock(), Some(2));

        let lenient = UserCollector::new(tf, true);
        lenient.close().await.unwrap();
    }
}

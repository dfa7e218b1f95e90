//! 目录后端
//!
//! 每个 FileKey 一个 gzip 压缩的 JSON Lines 分段文件 (`<key>.json.gz`)，
//! 按到达顺序追加 chunk。分段关闭后写入目录索引 `index.jsonl`，
//! 之后可以随时回放。
//!
//! 并发：分段表由读写锁保护，创建分段取写锁；写入已打开的分段只取读锁，
//! 再由分段自身的互斥锁串行化。

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, FileKey, Payload};
use crate::error::{Error, Result};
use crate::storage::{ChunkStore, Source};
use crate::types::{current_time_ms, ts_to_micros, Channel, Message, User, WorkspaceInfo};

/// 分段文件扩展名
pub const CHUNK_EXT: &str = "json.gz";

/// 目录索引文件
pub const INDEX_FILE: &str = "index.jsonl";

/// 索引条目：一个已完成的分段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub chunks: usize,
    pub finalised_at: i64,
}

type SegmentWriter = GzEncoder<BufWriter<fs::File>>;

/// 打开中的分段
struct Segment {
    key: FileKey,
    writer: Mutex<Option<SegmentWriter>>,
    chunks: AtomicUsize,
}

impl Segment {
    fn create(path: &Path, key: FileKey) -> Result<Self> {
        let file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // 空文件可以复用，非空说明是上一次运行留下的
                if fs::metadata(path)?.len() > 0 {
                    return Err(Error::Config(format!(
                        "分段文件已存在且非空: {:?}",
                        path
                    )));
                }
                OpenOptions::new().write(true).truncate(true).open(path)?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            key,
            writer: Mutex::new(Some(GzEncoder::new(
                BufWriter::new(file),
                Compression::default(),
            ))),
            chunks: AtomicUsize::new(0),
        })
    }

    fn write(&self, chunk: &Chunk) -> Result<()> {
        let mut guard = self.writer.lock();
        let w = guard
            .as_mut()
            .ok_or_else(|| Error::WriteAfterClose(self.key.to_string()))?;
        serde_json::to_writer(&mut *w, chunk)?;
        w.write_all(b"\n")?;
        self.chunks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 结束 gzip 流，返回写入的 chunk 数
    fn close(&self) -> Result<usize> {
        if let Some(w) = self.writer.lock().take() {
            let mut inner = w.finish()?;
            inner.flush()?;
        }
        Ok(self.chunks.load(Ordering::Relaxed))
    }
}

/// 分段回放（惰性、单次）
pub struct ChunkReader {
    key: FileKey,
    lines: Lines<BufReader<GzDecoder<fs::File>>>,
    done: bool,
}

impl ChunkReader {
    pub fn key(&self) -> &FileKey {
        &self.key
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.lines.next()? {
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    let res = serde_json::from_str(&line).map_err(Error::from);
                    if res.is_err() {
                        self.done = true;
                    }
                    return Some(res);
                }
            }
        }
    }
}

/// chunk 目录
pub struct ChunkDirectory {
    root: PathBuf,
    segments: RwLock<HashMap<FileKey, Arc<Segment>>>,
    index: Mutex<BTreeMap<FileKey, IndexEntry>>,
}

impl ChunkDirectory {
    /// 创建（或打开已有的）目录
    pub fn create<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Self::open(root)
    }

    /// 打开已有目录
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::NotFound(format!("chunk 目录: {:?}", root)));
        }
        let index = load_index(&root.join(INDEX_FILE))?;
        info!(root = ?root, finalised = index.len(), "chunk directory opened");

        Ok(Self {
            root,
            segments: RwLock::new(HashMap::new()),
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 分段文件路径
    pub fn segment_path(&self, key: &FileKey) -> PathBuf {
        self.root.join(format!("{}.{}", key.file_name(), CHUNK_EXT))
    }

    /// 打开分段（幂等）
    pub fn open_segment(&self, key: &FileKey) -> Result<()> {
        if self.segments.read().contains_key(key) {
            return Ok(());
        }
        let mut segments = self.segments.write();
        if segments.contains_key(key) {
            return Ok(());
        }
        if self.is_finalised(key) {
            return Err(Error::AlreadyFinalised(key.to_string()));
        }
        let segment = Segment::create(&self.segment_path(key), key.clone())?;
        segments.insert(key.clone(), Arc::new(segment));
        debug!(key = %key, "segment opened");
        Ok(())
    }

    /// 是否有打开中的分段
    pub fn is_open(&self, key: &FileKey) -> bool {
        self.segments.read().contains_key(key)
    }

    /// 追加 chunk，分段不存在时先打开
    pub fn write(&self, key: &FileKey, chunk: &Chunk) -> Result<()> {
        let segment = self.segments.read().get(key).cloned();
        let segment = match segment {
            Some(s) => s,
            None => {
                self.open_segment(key)?;
                self.segments
                    .read()
                    .get(key)
                    .cloned()
                    .ok_or_else(|| Error::WriteAfterClose(key.to_string()))?
            }
        };
        segment.write(chunk)
    }

    /// 完成分段：结束写入并记入索引
    pub fn close_segment(&self, key: &FileKey) -> Result<()> {
        let segment = self
            .segments
            .write()
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("分段未打开: {}", key)))?;
        let chunks = segment.close()?;

        let entry = IndexEntry {
            key: key.file_name(),
            chunks,
            finalised_at: current_time_ms(),
        };
        let mut index = self.index.lock();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(INDEX_FILE))?;
        serde_json::to_writer(&mut f, &entry)?;
        f.write_all(b"\n")?;
        index.insert(key.clone(), entry);

        debug!(key = %key, chunks, "segment finalised");
        Ok(())
    }

    pub fn is_finalised(&self, key: &FileKey) -> bool {
        self.index.lock().contains_key(key)
    }

    /// 已完成分段的索引条目
    pub fn index_entry(&self, key: &FileKey) -> Option<IndexEntry> {
        self.index.lock().get(key).cloned()
    }

    /// 目录下所有分段
    pub fn keys(&self) -> Result<Vec<FileKey>> {
        let suffix = format!(".{}", CHUNK_EXT);
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(&suffix)) {
                keys.push(FileKey::from_file_name(stem));
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// 回放分段
    pub fn replay(&self, key: &FileKey) -> Result<ChunkReader> {
        if self.is_open(key) {
            return Err(Error::NotFound(format!("分段仍在写入: {}", key)));
        }
        let path = self.segment_path(key);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("分段: {}", key)));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ChunkReader {
            key: key.clone(),
            lines: BufReader::new(GzDecoder::new(file)).lines(),
            done: false,
        })
    }

    /// 分段不存在时返回 None
    fn replay_existing(&self, key: &FileKey) -> Result<Option<ChunkReader>> {
        match self.replay(key) {
            Ok(r) => Ok(Some(r)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 遍历分段中的负载
    fn for_each_payload<F>(&self, key: &FileKey, mut f: F) -> Result<()>
    where
        F: FnMut(Chunk),
    {
        if let Some(reader) = self.replay_existing(key)? {
            for chunk in reader {
                f(chunk?);
            }
        }
        Ok(())
    }

    // ==================== 读取 ====================

    /// 所有用户，同 id 后写入的覆盖先写入的
    pub fn users(&self) -> Result<Vec<User>> {
        let mut users = BTreeMap::new();
        self.for_each_payload(&FileKey::users(), |chunk| {
            if let Payload::Users(list) = chunk.payload {
                for u in list {
                    users.insert(u.id.clone(), u);
                }
            }
        })?;
        Ok(users.into_values().collect())
    }

    /// 所有频道：频道列表 + 各频道分段中的频道信息，后写入的覆盖
    pub fn channels(&self) -> Result<Vec<Channel>> {
        let mut channels = BTreeMap::new();
        self.for_each_payload(&FileKey::channels(), |chunk| {
            if let Payload::Channels(list) = chunk.payload {
                for c in list {
                    channels.insert(c.id.clone(), c);
                }
            }
        })?;
        for key in self.keys()? {
            if key.is_dictionary() {
                continue;
            }
            self.for_each_payload(&key, |chunk| {
                if let Payload::ChannelInfo(c) = chunk.payload {
                    channels.insert(c.id.clone(), c);
                }
            })?;
        }
        Ok(channels.into_values().collect())
    }

    /// 单个频道信息
    pub fn channel_info(&self, channel_id: &str) -> Result<Option<Channel>> {
        let mut found = None;
        self.for_each_payload(&FileKey::channel(channel_id), |chunk| {
            if let Payload::ChannelInfo(c) = chunk.payload {
                found = Some(c);
            }
        })?;
        if found.is_some() {
            return Ok(found);
        }
        // 线程专属分段
        for key in self.keys()? {
            if key.is_thread_only() && key.entity_id() == channel_id {
                self.for_each_payload(&key, |chunk| {
                    if let Payload::ChannelInfo(c) = chunk.payload {
                        found = Some(c);
                    }
                })?;
            }
        }
        if found.is_some() {
            return Ok(found);
        }
        Ok(self.channels()?.into_iter().find(|c| c.id == channel_id))
    }

    pub fn workspace_info(&self) -> Result<Option<WorkspaceInfo>> {
        let mut found = None;
        self.for_each_payload(&FileKey::workspace(), |chunk| {
            if let Payload::WorkspaceInfo(w) = chunk.payload {
                found = Some(w);
            }
        })?;
        Ok(found)
    }

    /// 频道消息，按时间排序
    pub fn all_messages(&self, channel_id: &str) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        self.for_each_payload(&FileKey::channel(channel_id), |chunk| {
            if let Payload::Messages(list) = chunk.payload {
                messages.extend(list);
            }
        })?;
        sort_by_ts(&mut messages);
        Ok(messages)
    }

    /// 线程消息：父消息 + 回复，按时间排序、去重
    pub fn all_thread_messages(&self, channel_id: &str, thread_ts: &str) -> Result<Vec<Message>> {
        let mut by_ts = BTreeMap::new();
        let mut collect = |chunk: Chunk| {
            if chunk.thread_ts.as_deref() != Some(thread_ts) {
                return;
            }
            if let Payload::ThreadMessages { parent, messages } = chunk.payload {
                by_ts.entry(parent.ts.clone()).or_insert(parent);
                for m in messages {
                    by_ts.insert(m.ts.clone(), m);
                }
            }
        };
        self.for_each_payload(&FileKey::channel(channel_id), &mut collect)?;
        self.for_each_payload(&FileKey::thread(channel_id, thread_ts, true), &mut collect)?;

        let mut messages: Vec<_> = by_ts.into_values().collect();
        sort_by_ts(&mut messages);
        Ok(messages)
    }

    /// 最新的频道成员列表
    pub fn channel_users(&self, channel_id: &str) -> Result<Vec<String>> {
        let mut found = Vec::new();
        self.for_each_payload(&FileKey::channel(channel_id), |chunk| {
            if let Payload::ChannelUsers(users) = chunk.payload {
                found = users;
            }
        })?;
        Ok(found)
    }

    /// 关闭所有仍打开的分段（不记入索引）
    pub fn close(&self) -> Result<()> {
        let open: Vec<_> = self.segments.write().drain().collect();
        let mut errs = Vec::new();
        for (key, segment) in open {
            match segment.close() {
                Ok(chunks) => warn!(key = %key, chunks, "closing unfinished segment"),
                Err(e) => errs.push(e),
            }
        }
        Error::join(errs).map_or(Ok(()), Err)
    }
}

fn load_index(path: &Path) -> Result<BTreeMap<FileKey, IndexEntry>> {
    let mut index = BTreeMap::new();
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(e) => return Err(e.into()),
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: IndexEntry = serde_json::from_str(&line)?;
        index.insert(FileKey::from_file_name(&entry.key), entry);
    }
    Ok(index)
}

fn sort_by_ts(messages: &mut [Message]) {
    messages.sort_by_key(|m| ts_to_micros(&m.ts).unwrap_or(0));
}

impl ChunkStore for ChunkDirectory {
    fn open(&self, key: &FileKey) -> Result<()> {
        self.open_segment(key)
    }

    fn write(&self, key: &FileKey, chunk: &Chunk) -> Result<()> {
        ChunkDirectory::write(self, key, chunk)
    }

    fn finalise(&self, key: &FileKey) -> Result<()> {
        self.close_segment(key)
    }

    fn close(&self) -> Result<()> {
        ChunkDirectory::close(self)
    }
}

impl Source for ChunkDirectory {
    fn channel_info(&self, channel_id: &str) -> Result<Option<Channel>> {
        ChunkDirectory::channel_info(self, channel_id)
    }

    fn all_messages(&self, channel_id: &str) -> Result<Vec<Message>> {
        ChunkDirectory::all_messages(self, channel_id)
    }

    fn all_thread_messages(&self, channel_id: &str, thread_ts: &str) -> Result<Vec<Message>> {
        ChunkDirectory::all_thread_messages(self, channel_id, thread_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_dir() -> (ChunkDirectory, TempDir) {
        let tmp = TempDir::new().unwrap();
        let dir = ChunkDirectory::create(tmp.path().join("chunks")).unwrap();
        (dir, tmp)
    }

    fn msg(ts: &str) -> Message {
        Message::new(ts, "U1", format!("msg {}", ts))
    }

    #[test]
    fn test_open_is_idempotent() {
        let (dir, _tmp) = setup_dir();
        let key = FileKey::channel("C1");
        dir.open_segment(&key).unwrap();
        dir.open_segment(&key).unwrap();
        assert!(dir.is_open(&key));
    }

    #[test]
    fn test_write_close_replay_in_order() {
        let (dir, _tmp) = setup_dir();
        let key = FileKey::channel("C1");

        let first = Chunk::messages("C1", 0, false, vec![msg("2.0")]);
        let second = Chunk::messages("C1", 0, true, vec![msg("1.0")]);
        dir.write(&key, &first).unwrap();
        dir.write(&key, &second).unwrap();

        // 写入中不能回放
        assert!(matches!(dir.replay(&key), Err(Error::NotFound(_))));

        dir.close_segment(&key).unwrap();
        assert!(dir.is_finalised(&key));
        assert_eq!(dir.index_entry(&key).unwrap().chunks, 2);

        let replayed: Vec<_> = dir.replay(&key).unwrap().map(|c| c.unwrap()).collect();
        assert_eq!(replayed, vec![first, second]);
    }

    #[test]
    fn test_write_after_finalise_fails() {
        let (dir, _tmp) = setup_dir();
        let key = FileKey::channel("C1");
        dir.write(&key, &Chunk::messages("C1", 0, true, vec![])).unwrap();
        dir.close_segment(&key).unwrap();

        let err = dir
            .write(&key, &Chunk::messages("C1", 0, true, vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyFinalised(_)));
    }

    #[test]
    fn test_replay_unknown_key() {
        let (dir, _tmp) = setup_dir();
        assert!(matches!(
            dir.replay(&FileKey::channel("NOPE")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let key = FileKey::thread("C1", "5.0", true);
        {
            let dir = ChunkDirectory::create(tmp.path()).unwrap();
            dir.write(&key, &Chunk::messages("C1", 0, true, vec![])).unwrap();
            dir.close_segment(&key).unwrap();
        }
        let dir = ChunkDirectory::open(tmp.path()).unwrap();
        assert!(dir.is_finalised(&key));
        assert_eq!(dir.keys().unwrap(), vec![key]);
    }

    #[test]
    fn test_close_leaves_segments_unfinalised() {
        let (dir, _tmp) = setup_dir();
        let key = FileKey::channel("C9");
        dir.write(&key, &Chunk::messages("C9", 1, false, vec![msg("1.0")]))
            .unwrap();
        dir.close().unwrap();

        assert!(!dir.is_finalised(&key));
        // 文件完整，可以回放
        assert_eq!(dir.replay(&key).unwrap().count(), 1);
    }

    #[test]
    fn test_read_helpers() {
        let (dir, _tmp) = setup_dir();

        dir.write(
            &FileKey::users(),
            &Chunk::users(vec![User::new("U1", "old"), User::new("U2", "bob")]),
        )
        .unwrap();
        dir.write(&FileKey::users(), &Chunk::users(vec![User::new("U1", "alice")]))
            .unwrap();
        dir.close_segment(&FileKey::users()).unwrap();

        dir.write(
            &FileKey::channels(),
            &Chunk::channels(vec![Channel::new("C1", "general")]),
        )
        .unwrap();
        dir.close_segment(&FileKey::channels()).unwrap();

        let key = FileKey::channel("C1");
        let mut parent = msg("1.0");
        parent.thread_ts = Some("1.0".into());
        parent.reply_count = 1;
        let mut reply = msg("1.5");
        reply.thread_ts = Some("1.0".into());

        dir.write(&key, &Chunk::channel_info(Channel::new("C1", "renamed"), None))
            .unwrap();
        dir.write(&key, &Chunk::messages("C1", 1, false, vec![parent.clone()]))
            .unwrap();
        dir.write(
            &key,
            &Chunk::thread_messages("C1", parent.clone(), false, true, vec![parent.clone(), reply.clone()]),
        )
        .unwrap();
        dir.write(&key, &Chunk::messages("C1", 0, true, vec![msg("3.0")]))
            .unwrap();
        dir.write(&key, &Chunk::channel_users("C1", None, vec!["U1".into()]))
            .unwrap();
        dir.close_segment(&key).unwrap();

        let users = dir.users().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].name, "alice");

        let channels = dir.channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "renamed");

        let messages = dir.all_messages("C1").unwrap();
        let ts: Vec<_> = messages.iter().map(|m| m.ts.as_str()).collect();
        assert_eq!(ts, vec!["1.0", "3.0"]);

        let thread = dir.all_thread_messages("C1", "1.0").unwrap();
        let ts: Vec<_> = thread.iter().map(|m| m.ts.as_str()).collect();
        assert_eq!(ts, vec!["1.0", "1.5"]);

        assert_eq!(dir.channel_users("C1").unwrap(), vec!["U1".to_string()]);
        assert_eq!(dir.workspace_info().unwrap(), None);
    }
}

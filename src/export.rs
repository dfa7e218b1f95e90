//! 导出转换
//!
//! 把一个已完成单元的消息（频道消息 + 线程回复）按天写成 JSON 文件：
//! `<频道名>/<YYYY-MM-DD>.json`。每条消息附带作者资料。
//! 输出位置由 `FsAdapter` 决定（普通目录 / 压缩包等）。

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::chunk::FileKey;
use crate::error::{Error, Result};
use crate::storage::Source;
use crate::transform::Converter;
use crate::types::{Message, UserIndex, UserProfile};

/// 输出文件系统
pub trait FsAdapter: Send + Sync {
    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>>;
}

/// 写入普通目录
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl FsAdapter for DirFs {
    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(BufWriter::new(fs::File::create(full)?)))
    }
}

/// 导出的一条消息
#[derive(Serialize)]
struct ExportMessage<'a> {
    #[serde(flatten)]
    message: &'a Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_profile: Option<&'a UserProfile>,
}

/// 导出转换器
pub struct ExportConverter {
    source: Arc<dyn Source>,
    fs: Arc<dyn FsAdapter>,
}

impl ExportConverter {
    pub fn new(source: Arc<dyn Source>, fs: Arc<dyn FsAdapter>) -> Self {
        Self { source, fs }
    }

    /// 单元内全部消息，按时间排序、去重
    fn collect_messages(&self, key: &FileKey) -> Result<Vec<Message>> {
        let channel_id = key.entity_id();
        let mut by_ts: BTreeMap<i64, Message> = BTreeMap::new();
        let mut push = |m: Message| {
            let ts = crate::types::ts_to_micros(&m.ts).unwrap_or(0);
            by_ts.entry(ts).or_insert(m);
        };

        match key.thread_ts() {
            Some(thread_ts) => {
                for m in self.source.all_thread_messages(channel_id, thread_ts)? {
                    push(m);
                }
            }
            None => {
                let messages = self.source.all_messages(channel_id)?;
                let parents: Vec<String> = messages
                    .iter()
                    .filter(|m| m.is_thread_parent())
                    .map(|m| m.ts.clone())
                    .collect();
                for m in messages {
                    push(m);
                }
                for ts in parents {
                    for m in self.source.all_thread_messages(channel_id, &ts)? {
                        push(m);
                    }
                }
            }
        }
        Ok(by_ts.into_values().collect())
    }

    fn write_day(
        &self,
        dir: &str,
        day: &str,
        messages: &[&Message],
        users: &UserIndex,
    ) -> Result<()> {
        let out: Vec<_> = messages
            .iter()
            .map(|m| ExportMessage {
                message: m,
                user_profile: m.user.as_deref().and_then(|u| users.profile(u)),
            })
            .collect();
        let path = Path::new(dir).join(format!("{}.json", day));
        let mut w = self.fs.create(&path)?;
        serde_json::to_writer_pretty(&mut w, &out)?;
        w.flush()?;
        Ok(())
    }
}

/// 频道名转为单级目录名：路径分隔符和控制字符替换为 `_`，
/// 空名、`.`、`..` 不可用
fn dir_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if matches!(c, '/' | '\\') || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim();
    match cleaned {
        "" | "." | ".." => None,
        _ => Some(cleaned.to_string()),
    }
}

#[async_trait]
impl Converter for ExportConverter {
    async fn convert(&self, key: &FileKey, users: &UserIndex) -> Result<()> {
        let channel = self.source.channel_info(key.entity_id())?;
        let dir = channel
            .as_ref()
            .and_then(|c| dir_name(&c.name))
            .or_else(|| dir_name(key.entity_id()))
            .ok_or_else(|| Error::InvalidPayload {
                chunk_type: "channel_info".into(),
                channel_id: key.entity_id().to_string(),
                reason: "无法生成导出目录名".into(),
            })?;

        let messages = self.collect_messages(key)?;
        let mut days: BTreeMap<String, Vec<&Message>> = BTreeMap::new();
        for m in &messages {
            let day = m
                .time()
                .map(|t| t.format("%Y-%m-%d").to_string())
                .ok_or_else(|| Error::InvalidPayload {
                    chunk_type: "messages".into(),
                    channel_id: key.entity_id().to_string(),
                    reason: format!("无效的时间戳 {:?}", m.ts),
                })?;
            days.entry(day).or_default().push(m);
        }

        for (day, msgs) in &days {
            self.write_day(&dir, day, msgs, users)?;
        }
        debug!(key = %key, dir = %dir, messages = messages.len(), days = days.len(), "exported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::directory::ChunkDirectory;
    use crate::types::{Channel, User};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_export_channel_with_thread() {
        let tmp = TempDir::new().unwrap();
        let dir = Arc::new(ChunkDirectory::create(tmp.path().join("chunks")).unwrap());
        let key = FileKey::channel("C1");

        let mut parent = Message::new("1700000000.000100", "U1", "parent");
        parent.thread_ts = Some(parent.ts.clone());
        parent.reply_count = 1;
        let mut reply = Message::new("1700000100.000200", "U2", "reply");
        reply.thread_ts = Some(parent.ts.clone());
        let next_day = Message::new("1700100000.000000", "U1", "later");

        dir.write(&key, &Chunk::channel_info(Channel::new("C1", "general"), None))
            .unwrap();
        dir.write(&key, &Chunk::messages("C1", 1, false, vec![parent.clone()]))
            .unwrap();
        dir.write(
            &key,
            &Chunk::thread_messages("C1", parent.clone(), false, true, vec![reply]),
        )
        .unwrap();
        dir.write(&key, &Chunk::messages("C1", 0, true, vec![next_day]))
            .unwrap();
        dir.close_segment(&key).unwrap();

        let out = tmp.path().join("out");
        let converter = ExportConverter::new(dir, Arc::new(DirFs::new(&out)));
        let mut alice = User::new("U1", "alice");
        alice.profile.real_name = "Alice".into();
        converter
            .convert(&key, &UserIndex::new(vec![alice]))
            .await
            .unwrap();

        let day1 = fs::read_to_string(out.join("general").join("2023-11-14.json")).unwrap();
        let day1: serde_json::Value = serde_json::from_str(&day1).unwrap();
        let day1 = day1.as_array().unwrap();
        assert_eq!(day1.len(), 2);
        assert_eq!(day1[0]["text"], "parent");
        assert_eq!(day1[0]["user_profile"]["real_name"], "Alice");
        assert_eq!(day1[1]["text"], "reply");
        assert!(day1[1].get("user_profile").is_none());

        assert!(out.join("general").join("2023-11-16.json").exists());
    }

    #[test]
    fn test_dir_name_stays_inside_root() {
        assert_eq!(dir_name("general").as_deref(), Some("general"));
        assert_eq!(dir_name("../../etc").as_deref(), Some(".._.._etc"));
        assert_eq!(dir_name("a/b\\c").as_deref(), Some("a_b_c"));
        assert_eq!(dir_name(".."), None);
        assert_eq!(dir_name(" . "), None);
        assert_eq!(dir_name(""), None);
    }

    #[tokio::test]
    async fn test_unsafe_channel_name_falls_back_to_id() {
        let tmp = TempDir::new().unwrap();
        let dir = Arc::new(ChunkDirectory::create(tmp.path().join("chunks")).unwrap());
        let key = FileKey::channel("C9");
        dir.write(&key, &Chunk::channel_info(Channel::new("C9", ".."), None))
            .unwrap();
        dir.write(
            &key,
            &Chunk::messages("C9", 0, true, vec![Message::new("1700000000.000100", "U1", "x")]),
        )
        .unwrap();
        dir.close_segment(&key).unwrap();

        let out = tmp.path().join("out");
        let converter = ExportConverter::new(dir, Arc::new(DirFs::new(&out)));
        converter
            .convert(&key, &UserIndex::new(vec![User::new("U1", "alice")]))
            .await
            .unwrap();

        assert!(out.join("C9").join("2023-11-14.json").exists());
        assert!(!tmp.path().join("2023-11-14.json").exists());
    }
}

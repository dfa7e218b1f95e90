//! 数据类型定义
//!
//! 工作区里的记录：消息、文件、用户、频道、工作区信息、搜索结果，
//! 以及关系型后端的会话记录。字段只保留归档和转换用得到的部分，
//! 其余字段通过 `extra` 原样保留。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 消息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 消息时间戳 "1700000000.000100"，频道内唯一
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub reply_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Message {
    pub fn new(ts: impl Into<String>, user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            ts: ts.into(),
            user: Some(user.into()),
            text: text.into(),
            ..Default::default()
        }
    }

    /// 是否为带回复的线程父消息
    pub fn is_thread_parent(&self) -> bool {
        self.reply_count > 0 && self.thread_ts.as_deref() == Some(self.ts.as_str())
    }

    /// 是否为线程内的回复（非父消息）
    pub fn is_reply(&self) -> bool {
        matches!(self.thread_ts.as_deref(), Some(t) if t != self.ts)
    }

    /// 消息时间
    pub fn time(&self) -> Option<DateTime<Utc>> {
        let micros = ts_to_micros(&self.ts)?;
        DateTime::from_timestamp(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1_000) as u32,
        )
    }
}

/// 文件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_private: Option<String>,
}

/// 用户资料
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub real_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_48: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_original: Option<String>,
}

/// 用户
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub profile: UserProfile,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// 频道
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_member: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_im: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

impl Channel {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// 工作区信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub team_id: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_id: Option<String>,
}

/// 搜索命中的消息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchMessage {
    pub channel_id: String,
    #[serde(default)]
    pub channel_name: String,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
}

/// 归档会话（关系型后端）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub parent_id: Option<i64>,
    /// 时间窗口 (毫秒时间戳)
    pub from_ts: Option<i64>,
    pub to_ts: Option<i64>,
    pub finished: bool,
    pub files_enabled: bool,
    pub avatars_enabled: bool,
    pub mode: String,
    pub args: String,
}

/// 用户索引，转换时按 id 查用户资料
#[derive(Debug, Clone, Default)]
pub struct UserIndex {
    users: HashMap<String, User>,
}

impl UserIndex {
    pub fn new(users: Vec<User>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&User> {
        self.users.get(id)
    }

    pub fn profile(&self, id: &str) -> Option<&UserProfile> {
        self.users.get(id).map(|u| &u.profile)
    }

    /// 显示名：display_name > real_name > name
    pub fn display_name(&self, id: &str) -> Option<&str> {
        let user = self.users.get(id)?;
        [
            user.profile.display_name.as_str(),
            user.profile.real_name.as_str(),
            user.name.as_str(),
        ]
        .into_iter()
        .find(|s| !s.is_empty())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// 消息时间戳转微秒整数："1700000000.000100" -> 1700000000000100
///
/// 只接受无符号的十进制时间戳，带符号（如 "-1.5"）返回 None。
pub fn ts_to_micros(ts: &str) -> Option<i64> {
    let (secs, frac) = match ts.split_once('.') {
        Some((s, f)) => (s, f),
        None => (ts, ""),
    };
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if secs.is_empty() || frac.len() > 6 || !digits(secs) || !digits(frac) {
        return None;
    }
    let secs: i64 = secs.parse().ok()?;
    let frac: i64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<6}", frac).parse().ok()?
    };
    secs.checked_mul(1_000_000)?.checked_add(frac)
}

/// 当前时间 (毫秒)
pub(crate) fn current_time_ms() -> i64 {
    Utc::now().timestamp_millis()
}

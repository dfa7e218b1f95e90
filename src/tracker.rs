//! 引用计数
//!
//! 每个 FileKey 一个计数器：创建时为 1（频道本身），每页消息发现的线程数
//! 累加上去，频道或线程的最后一页各减 1。减到 0 时单元完成，计数器删除，
//! 同一个键之后不能再创建。
//!
//! 所有状态在一把锁下，减一和判零不会被拆开。

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use crate::chunk::FileKey;
use crate::error::{Error, Result};

/// 释放结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// 仍有未完成的工作
    Pending(i64),
    /// 计数归零，调用方负责完成该单元（每个键只会返回一次）
    Finalised,
}

#[derive(Default)]
struct TrackerState {
    counts: HashMap<FileKey, i64>,
    finalised: HashSet<FileKey>,
}

/// 引用计数表
#[derive(Default)]
pub struct ReferenceTracker {
    state: Mutex<TrackerState>,
}

impl ReferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记单元，第一次登记时计数为 1 并返回 true
    pub fn register(&self, key: &FileKey) -> Result<bool> {
        let mut state = self.state.lock();
        if state.finalised.contains(key) {
            return Err(Error::AlreadyFinalised(key.to_string()));
        }
        if state.counts.contains_key(key) {
            return Ok(false);
        }
        state.counts.insert(key.clone(), 1);
        debug!(key = %key, count = 1, "refcount created");
        Ok(true)
    }

    /// 预留 n 个线程
    pub fn add(&self, key: &FileKey, n: usize) -> Result<i64> {
        let mut state = self.state.lock();
        let count = state
            .counts
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("引用计数: {}", key)))?;
        *count += n as i64;
        let count = *count;
        if n > 0 {
            debug!(key = %key, added = n, count, "refcount increased");
        }
        Ok(count)
    }

    /// 完成一个工作单元（频道或线程的最后一页）
    pub fn release(&self, key: &FileKey) -> Result<Release> {
        let mut state = self.state.lock();
        let count = state
            .counts
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("引用计数: {}", key)))?;
        *count -= 1;
        let count = *count;
        if count > 0 {
            debug!(key = %key, count, "refcount decreased");
            return Ok(Release::Pending(count));
        }
        state.counts.remove(key);
        if count < 0 {
            return Err(Error::RefCount(format!("{} 的计数为 {}", key, count)));
        }
        state.finalised.insert(key.clone());
        debug!(key = %key, "refcount reached zero");
        Ok(Release::Finalised)
    }

    pub fn count(&self, key: &FileKey) -> Option<i64> {
        self.state.lock().counts.get(key).copied()
    }

    pub fn is_finalised(&self, key: &FileKey) -> bool {
        self.state.lock().finalised.contains(key)
    }

    /// 取出所有未完成的单元
    pub fn drain_open(&self) -> Vec<(FileKey, i64)> {
        let mut open: Vec<_> = self.state.lock().counts.drain().collect();
        open.sort();
        open
    }
}

//! 实体列表
//!
//! 用户给出的频道列表，每项格式：
//!
//! - `C123` 包含
//! - `^C123` 排除
//! - `C123,2024-01-01T00:00:00,2024-02-01` 包含并限定时间窗口
//! - `@path/to/list.txt` 从文件读取（每行一项，`#` 开头为注释）
//!
//! 同一个 id 同时被包含和排除时，排除优先。

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{Error, Result};

const EXCLUDE_PREFIX: char = '^';
const FILE_PREFIX: char = '@';
const TIME_SEPARATOR: char = ',';
const TIME_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S";
const DATE_LAYOUT: &str = "%Y-%m-%d";

/// 一个待拉取的频道
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub include: bool,
    pub oldest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn include(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            include: true,
            oldest: None,
            latest: None,
        }
    }
}

/// 实体列表
#[derive(Debug, Clone, Default)]
pub struct EntityList {
    /// 保持插入顺序
    order: Vec<String>,
    index: BTreeMap<String, WorkItem>,
}

impl EntityList {
    /// 解析若干条目
    pub fn from_strings<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        let mut list = Self::default();
        for item in items {
            list.add(item.as_ref(), 0)?;
        }
        Ok(list)
    }

    /// 从文件读取
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut list = Self::default();
        list.load_file(path, 0)?;
        Ok(list)
    }

    fn load_file(&mut self, path: &Path, depth: usize) -> Result<()> {
        if depth > 4 {
            return Err(Error::Config(format!("列表文件嵌套过深: {:?}", path)));
        }
        let content = std::fs::read_to_string(path)?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.add(line, depth + 1)?;
        }
        Ok(())
    }

    fn add(&mut self, raw: &str, depth: usize) -> Result<()> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(());
        }
        if let Some(path) = raw.strip_prefix(FILE_PREFIX) {
            return self.load_file(Path::new(path), depth);
        }

        let (include, rest) = match raw.strip_prefix(EXCLUDE_PREFIX) {
            Some(rest) => (false, rest),
            None => (true, raw),
        };

        let mut parts = rest.split(TIME_SEPARATOR).map(str::trim);
        let id = parts.next().unwrap_or_default();
        if id.is_empty() {
            return Err(Error::Config(format!("无效的条目: {:?}", raw)));
        }
        let oldest = parts.next().map(parse_time).transpose()?;
        let latest = parts.next().map(parse_time).transpose()?;
        if parts.next().is_some() {
            return Err(Error::Config(format!("时间窗口格式错误: {:?}", raw)));
        }
        if let (Some(o), Some(l)) = (oldest, latest) {
            if o > l {
                return Err(Error::Config(format!("时间窗口起点晚于终点: {:?}", raw)));
            }
        }

        let item = WorkItem {
            id: id.to_string(),
            include,
            oldest,
            latest,
        };

        match self.index.get(id) {
            // 已排除的不会被再次包含
            Some(existing) if !existing.include => {}
            Some(_) => {
                self.index.insert(id.to_string(), item);
            }
            None => {
                self.order.push(id.to_string());
                self.index.insert(id.to_string(), item);
            }
        }
        Ok(())
    }

    /// 是否有显式包含项
    pub fn has_includes(&self) -> bool {
        self.index.values().any(|i| i.include)
    }

    /// 是否有显式排除项
    pub fn has_excludes(&self) -> bool {
        self.index.values().any(|i| !i.include)
    }

    /// 所有包含项，按输入顺序
    pub fn includes(&self) -> impl Iterator<Item = &WorkItem> {
        self.order
            .iter()
            .filter_map(|id| self.index.get(id))
            .filter(|i| i.include)
    }

    pub fn is_excluded(&self, id: &str) -> bool {
        matches!(self.index.get(id), Some(i) if !i.include)
    }

    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.index.get(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = NaiveDateTime::parse_from_str(s, TIME_LAYOUT) {
        return Ok(t.and_utc());
    }
    NaiveDate::parse_from_str(s, DATE_LAYOUT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
        .ok_or_else(|| Error::Config(format!("无法解析时间: {:?}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    #[test]
    fn test_parse_include_exclude() {
        let list = EntityList::from_strings(&["C1", "^C2", "C3"]).unwrap();
        assert!(list.has_includes());
        assert!(list.has_excludes());
        assert!(list.is_excluded("C2"));
        assert!(!list.is_excluded("C1"));

        let ids: Vec<_> = list.includes().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "C3"]);
    }

    #[test]
    fn test_exclude_wins() {
        let list = EntityList::from_strings(&["^C1", "C1"]).unwrap();
        assert!(list.is_excluded("C1"));
        assert!(!list.has_includes());

        let list = EntityList::from_strings(&["C1", "^C1"]).unwrap();
        assert!(list.is_excluded("C1"));
        assert_eq!(list.includes().count(), 0);
    }

    #[test]
    fn test_time_window() {
        let list = EntityList::from_strings(&["C1,2024-01-01T10:00:00,2024-02-01"]).unwrap();
        let item = list.get("C1").unwrap();
        assert_eq!(
            item.oldest,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(
            item.latest,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
        );

        assert!(EntityList::from_strings(&["C1,garbage"]).is_err());
        assert!(EntityList::from_strings(&["C1,2024-02-01,2024-01-01"]).is_err());
        assert!(EntityList::from_strings(&["^"]).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f, "C1").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "^C2").unwrap();

        let entry = format!("@{}", f.path().display());
        let list = EntityList::from_strings(&[entry.as_str(), "C3"]).unwrap();
        let ids: Vec<_> = list.includes().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "C3"]);
        assert!(list.is_excluded("C2"));
    }
}

//! 转换协调器
//!
//! 单个后台任务从有界队列里取出已完成的 FileKey，转换为导出格式。
//! 队列在收到 "开始" 信号（携带全部用户）前不消费：生产方可以提前入队，
//! 队列满了就阻塞等待；协调器失败后入队立即返回 `Error::Closed`。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::chunk::FileKey;
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::types::{User, UserIndex};

/// 转换触发方（由控制器和记录器调用）
#[async_trait]
pub trait Transformer: Send + Sync {
    /// 单元完成后调用，每个键一次
    async fn transform(&self, key: &FileKey) -> Result<()>;

    /// 用户拉取完成，打开闸门
    async fn start_with_users(&self, users: Vec<User>) -> Result<()>;

    /// 停止接收并等待队列处理完
    async fn close(&self) -> Result<()>;
}

/// 不做转换
#[derive(Debug, Clone, Copy, Default)]
pub struct NopTransformer;

#[async_trait]
impl Transformer for NopTransformer {
    async fn transform(&self, _: &FileKey) -> Result<()> {
        Ok(())
    }

    async fn start_with_users(&self, _: Vec<User>) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 单个单元的转换器
#[async_trait]
pub trait Converter: Send + Sync + 'static {
    async fn convert(&self, key: &FileKey, users: &UserIndex) -> Result<()>;
}

/// 转换协调器
pub struct ExportCoordinator {
    tx: Mutex<Option<mpsc::Sender<FileKey>>>,
    start: Mutex<Option<oneshot::Sender<Vec<User>>>>,
    handle: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
    /// 转换失败后触发
    failed: CancellationToken,
    cancel: CancellationToken,
    closed: AtomicBool,
    span: tracing::Span,
}

impl ExportCoordinator {
    /// 启动后台任务；`cancel` 取消时任务正常退出
    pub fn new(
        cancel: &CancellationToken,
        converter: Arc<dyn Converter>,
        config: CoordinatorConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity());
        let (start_tx, start_rx) = oneshot::channel();
        let failed = CancellationToken::new();
        let span = config.span.clone();

        let handle = tokio::spawn(
            worker(converter, start_rx, rx, failed.clone(), cancel.clone()).instrument(span.clone()),
        );

        Self {
            tx: Mutex::new(Some(tx)),
            start: Mutex::new(Some(start_tx)),
            handle: tokio::sync::Mutex::new(Some(handle)),
            failed,
            cancel: cancel.clone(),
            closed: AtomicBool::new(false),
            span,
        }
    }
}

#[async_trait]
impl Transformer for ExportCoordinator {
    async fn transform(&self, key: &FileKey) -> Result<()> {
        if self.failed.is_cancelled() {
            return Err(Error::Closed("转换协调器已失败".into()));
        }
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| Error::Closed("转换协调器已关闭".into()))?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = self.failed.cancelled() => Err(Error::Closed("转换协调器已失败".into())),
            res = tx.send(key.clone()) => {
                res.map_err(|_| Error::Closed("转换协调器已关闭".into()))?;
                debug!(parent: &self.span, key = %key, "transform queued");
                Ok(())
            }
        }
    }

    async fn start_with_users(&self, users: Vec<User>) -> Result<()> {
        if users.is_empty() {
            return Err(Error::NoUsers);
        }
        if self.failed.is_cancelled() {
            return Err(Error::Closed("转换协调器已失败".into()));
        }
        let start = self
            .start
            .lock()
            .take()
            .ok_or_else(|| Error::Config("转换已经开始".into()))?;
        let count = users.len();
        start
            .send(users)
            .map_err(|_| Error::Closed("转换协调器已关闭".into()))?;
        info!(parent: &self.span, users = count, "transform started");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // 关闭队列和闸门，后台任务处理完剩余项后退出
        self.tx.lock().take();
        self.start.lock().take();

        let handle = self.handle.lock().await.take();
        match handle {
            Some(h) => h.await.map_err(|e| Error::Task(e.to_string()))?,
            None => Ok(()),
        }
    }
}

async fn worker(
    converter: Arc<dyn Converter>,
    start: oneshot::Receiver<Vec<User>>,
    mut rx: mpsc::Receiver<FileKey>,
    failed: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let users = tokio::select! {
        res = start => match res {
            Ok(users) => users,
            Err(_) => {
                // 没有开始就关闭了
                rx.close();
                let mut pending = 0usize;
                while rx.try_recv().is_ok() {
                    pending += 1;
                }
                if pending > 0 {
                    warn!(pending, "transform closed before start, queued items dropped");
                }
                return Ok(());
            }
        },
        _ = cancel.cancelled() => {
            debug!("transform cancelled before start");
            return Ok(());
        }
    };
    let users = UserIndex::new(users);

    let mut converted = 0usize;
    loop {
        let key = tokio::select! {
            key = rx.recv() => match key {
                Some(k) => k,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        match converter.convert(&key, &users).await {
            Ok(()) => {
                converted += 1;
                debug!(key = %key, "converted");
            }
            Err(e) if e.is_cancelled() => {
                debug!(key = %key, "conversion cancelled");
                break;
            }
            Err(e) => {
                error!(key = %key, error = %e, "conversion failed");
                failed.cancel();
                return Err(e);
            }
        }
    }

    info!(converted, "transform worker finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingConverter {
        seen: Mutex<Vec<(String, usize)>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl Converter for RecordingConverter {
        async fn convert(&self, key: &FileKey, users: &UserIndex) -> Result<()> {
            if self.fail_on.as_deref() == Some(key.entity_id()) {
                return Err(Error::Other(anyhow::anyhow!("boom")));
            }
            self.seen.lock().push((key.to_string(), users.len()));
            Ok(())
        }
    }

    fn coordinator(
        converter: Arc<RecordingConverter>,
        buffer_size: usize,
    ) -> (ExportCoordinator, CancellationToken) {
        let cancel = CancellationToken::new();
        let config = CoordinatorConfig {
            buffer_size,
            ..Default::default()
        };
        (ExportCoordinator::new(&cancel, converter, config), cancel)
    }

    #[tokio::test]
    async fn test_enqueue_before_start_then_drain() {
        let conv = Arc::new(RecordingConverter::default());
        let (c, _cancel) = coordinator(conv.clone(), 4);

        c.transform(&FileKey::channel("C1")).await.unwrap();
        c.transform(&FileKey::channel("C2")).await.unwrap();
        assert!(conv.seen.lock().is_empty());

        c.start_with_users(vec![User::new("U1", "a")]).await.unwrap();
        c.close().await.unwrap();

        let seen = conv.seen.lock().clone();
        assert_eq!(seen, vec![("C1".to_string(), 1), ("C2".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_backpressure_when_full() {
        let conv = Arc::new(RecordingConverter::default());
        let (c, _cancel) = coordinator(conv, 1);

        c.transform(&FileKey::channel("C1")).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), c.transform(&FileKey::channel("C2")))
                .await;
        assert!(blocked.is_err(), "second enqueue should block while gated");

        c.start_with_users(vec![User::new("U1", "a")]).await.unwrap();
        c.transform(&FileKey::channel("C2")).await.unwrap();
        c.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_fails_fast_and_close_reports_it() {
        let conv = Arc::new(RecordingConverter {
            fail_on: Some("BAD".into()),
            ..Default::default()
        });
        let (c, _cancel) = coordinator(conv, 1);

        c.start_with_users(vec![User::new("U1", "a")]).await.unwrap();
        c.transform(&FileKey::channel("BAD")).await.unwrap();

        // 等待后台任务处理失败
        tokio::time::timeout(Duration::from_secs(5), c.failed.cancelled())
            .await
            .unwrap();

        let err = c.transform(&FileKey::channel("C1")).await.unwrap_err();
        assert!(matches!(err, Error::Closed(_)));

        let err = c.close().await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        // 第二次关闭不再报错
        c.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_users() {
        let conv = Arc::new(RecordingConverter::default());
        let (c, _cancel) = coordinator(conv, 1);

        assert!(matches!(
            c.start_with_users(vec![]).await,
            Err(Error::NoUsers)
        ));
        c.start_with_users(vec![User::new("U1", "a")]).await.unwrap();
        assert!(matches!(
            c.start_with_users(vec![User::new("U1", "a")]).await,
            Err(Error::Config(_))
        ));
        c.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_before_start_is_ok() {
        let conv = Arc::new(RecordingConverter::default());
        let (c, _cancel) = coordinator(conv.clone(), 2);

        c.transform(&FileKey::channel("C1")).await.unwrap();
        c.close().await.unwrap();
        assert!(conv.seen.lock().is_empty());

        let err = c.transform(&FileKey::channel("C2")).await.unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_enqueue() {
        let conv = Arc::new(RecordingConverter::default());
        let (c, cancel) = coordinator(conv, 1);

        c.transform(&FileKey::channel("C1")).await.unwrap();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = c.transform(&FileKey::channel("C2")).await.unwrap_err();
        assert!(err.is_cancelled());
        c.close().await.unwrap();
    }
}

//! 进度订阅
//!
//! 订阅者按注册顺序依次收到快照拷贝。每次回调在独立任务中执行并带超时，
//! 返回错误、panic 或超时都只记日志，不影响其他订阅者和工作流本身。

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::workflow::WorkflowProgress;

/// 单个订阅者回调的最长等待时间
const SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ProgressSubscriber: Send + Sync {
    async fn on_progress(&self, progress: WorkflowProgress) -> anyhow::Result<()>;
}

/// 同步闭包订阅者
pub struct FnSubscriber<F>(pub F);

#[async_trait]
impl<F> ProgressSubscriber for FnSubscriber<F>
where
    F: Fn(WorkflowProgress) -> anyhow::Result<()> + Send + Sync,
{
    async fn on_progress(&self, progress: WorkflowProgress) -> anyhow::Result<()> {
        (self.0)(progress)
    }
}

/// 闭包 → 订阅者
pub fn subscriber_fn<F>(f: F) -> Arc<dyn ProgressSubscriber>
where
    F: Fn(WorkflowProgress) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnSubscriber(f))
}

#[derive(Default)]
pub struct ProgressHub {
    subscribers: RwLock<Vec<Arc<dyn ProgressSubscriber>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, subscriber: Arc<dyn ProgressSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscriber);
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn publish(&self, snapshot: WorkflowProgress) {
        let subscribers: Vec<Arc<dyn ProgressSubscriber>> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (index, subscriber) in subscribers.into_iter().enumerate() {
            let progress = snapshot.clone();
            let handle = tokio::spawn(async move { subscriber.on_progress(progress).await });
            match tokio::time::timeout(SUBSCRIBER_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    tracing::warn!(
                        workflow_id = %snapshot.workflow_id,
                        subscriber = index,
                        error = %e,
                        "Progress subscriber failed"
                    );
                }
                Ok(Err(join_err)) => {
                    tracing::warn!(
                        workflow_id = %snapshot.workflow_id,
                        subscriber = index,
                        error = %join_err,
                        "Progress subscriber panicked"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        workflow_id = %snapshot.workflow_id,
                        subscriber = index,
                        "Progress subscriber timed out"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_failing_subscribers_do_not_block_others() {
        let hub = ProgressHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        hub.register(subscriber_fn(|_| anyhow::bail!("subscriber down")));
        hub.register(subscriber_fn(|_| panic!("subscriber bug")));
        let sink = Arc::clone(&seen);
        hub.register(subscriber_fn(move |p| {
            sink.lock().unwrap().push(p.progress_percentage);
            Ok(())
        }));

        let mut p = WorkflowProgress::new("wf");
        p.advance_to(10.0, "init");
        hub.publish(p.clone()).await;
        p.advance_to(30.0, "discovery");
        hub.publish(p).await;

        assert_eq!(*seen.lock().unwrap(), vec![10.0, 30.0]);
    }

    #[tokio::test]
    async fn test_registration_order_is_call_order() {
        let hub = ProgressHub::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            hub.register(subscriber_fn(move |_| {
                order.lock().unwrap().push(i);
                Ok(())
            }));
        }
        hub.publish(WorkflowProgress::new("wf")).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}

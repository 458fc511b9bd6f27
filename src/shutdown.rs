use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 优雅关闭协调器
///
/// 后台循环通过 `subscribe` 拿到接收端，在 `select!` 中等待关闭信号。
#[derive(Clone)]
pub struct ShutdownManager {
    sender: broadcast::Sender<()>,
    triggered: Arc<Mutex<bool>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            triggered: Arc::new(Mutex::new(false)),
        }
    }

    /// 订阅关闭信号，关闭之后订阅的接收端会立即收到信号
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        let triggered = self.triggered.lock().await;
        if *triggered {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            return rx;
        }
        self.sender.subscribe()
    }

    /// 广播关闭信号，重复调用无效果
    pub async fn shutdown(&self) {
        let mut triggered = self.triggered.lock().await;
        if *triggered {
            debug!("关闭信号已发送过");
            return;
        }
        *triggered = true;

        let receivers = self.sender.receiver_count();
        // 没有订阅者时发送失败，可以忽略
        let _ = self.sender.send(());
        info!("关闭信号已发送给 {} 个订阅者", receivers);
    }

    pub async fn is_shutdown(&self) -> bool {
        *self.triggered.lock().await
    }

    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe().await;
        let _ = rx.recv().await;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待后台组件退出，超过宽限期的组件被中止
///
/// 返回被强制中止的组件数。
pub async fn drain(components: Vec<(&'static str, JoinHandle<()>)>, grace: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + grace;
    let mut aborted = 0;

    for (name, mut handle) in components {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => debug!("组件 {} 已退出", name),
            Ok(Err(e)) => warn!("组件 {} 异常退出: {}", name, e),
            Err(_) => {
                warn!("组件 {} 未在宽限期内退出，强制中止", name);
                handle.abort();
                aborted += 1;
            }
        }
    }

    aborted
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_all_subscribers_receive_signal() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown().await);

        let mut first = manager.subscribe().await;
        let mut second = manager.subscribe().await;
        manager.shutdown().await;

        assert!(timeout(Duration::from_millis(100), first.recv()).await.is_ok());
        assert!(timeout(Duration::from_millis(100), second.recv()).await.is_ok());
        assert!(manager.is_shutdown().await);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_signal() {
        let manager = ShutdownManager::new();
        manager.shutdown().await;
        // 重复关闭
        manager.shutdown().await;

        let mut rx = manager.subscribe().await;
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_from_clone() {
        let manager = ShutdownManager::new();
        let waiter = manager.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_shutdown().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.shutdown().await;
        assert!(timeout(Duration::from_millis(100), handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_drain_aborts_stuck_component() {
        let quick = tokio::spawn(async {});
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let aborted = drain(
            vec![("quick", quick), ("stuck", stuck)],
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(aborted, 1);
    }
}

//! 延迟结果
//!
//! 工作的结果只能被观察一次，与工作何时被调度无关。

use pacs_core::{PacsError, Result};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// 创建一对延迟结果与其解决器
pub fn deferred<T>() -> (Resolver<T>, Deferred<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, Deferred { rx })
}

/// 解决器，由执行工作的一方持有
#[derive(Debug)]
pub struct Resolver<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Resolver<T> {
    /// 提交结果；等待方已放弃时静默丢弃
    pub fn settle(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }

    /// 等待方是否已放弃等待
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 延迟结果，等待方持有
///
/// 解决器在提交结果前被丢弃（例如工作单元panic）时返回内部错误。
#[derive(Debug)]
pub struct Deferred<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PacsError::Internal(
                "任务在完成前被丢弃".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

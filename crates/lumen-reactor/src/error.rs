use std::io;
use thiserror::Error;

/// 反应器自身的错误域，仅覆盖与原生轮询设施交互的失败。
///
/// 回调内部的错误不在此列：派发边界会捕获并记录它们（见 `guard`），
/// 循环继续运行。
#[derive(Debug, Error)]
pub enum ReactorError {
    /// `mio::Poll::poll` 返回了不可恢复的错误（EINTR 已在内部重试）。
    #[error("polling for readiness failed: {0}")]
    Poll(#[source] io::Error),

    /// 向轮询器注册/变更/注销事件源失败。
    #[error("registering event source failed: {0}")]
    Register(#[source] io::Error),

    /// 构造跨线程唤醒器失败。
    #[error("creating loop waker failed: {0}")]
    Waker(#[source] io::Error),
}

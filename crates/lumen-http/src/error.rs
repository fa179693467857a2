use thiserror::Error;

/// HTTP 输出流的调用方错误。
///
/// 运行期传输错误不经由本类型：按传输层契约，它们以关闭所在连接收场，
/// 不再向上抛出。这里只剩下同步可检出的使用错误。
#[derive(Debug, Error)]
pub enum HttpError {
    /// 在当前状态下不允许的操作，例如首字节发出后再切换编码模式。
    #[error("操作与流状态冲突: {0}")]
    InvalidState(&'static str),
}

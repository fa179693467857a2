#![doc = r#"
HTTP 输出流：在共享的套接字流之上做响应编码。

# 教案式说明

## 意图（Why）
- 应用层写响应时不应关心传输编码的细节：分块帧、`Content-Length`
  定稿、头必须晚于长度可知的时序，全部收敛在 [`HttpStream`] 内。

## 分层（How）
- [`HttpEntity`] / [`Headers`]：应用层协作对象，负责状态行与头块的
  序列化；输出流只在定稿时回填编码头并请它序列化一次；
- [`HttpStream`]：只写字节汇。分块模式下每次写包装成块帧，终止块由
  `end` 发出且至多一次；定长模式下写操作先暂存，文件长度在循环外
  线程查询、完成编组回循环线程，全部落定后才发头并按原序冲出暂存。

## 契约（What）
- 编码模式只在首字节之前可变；
- `end` 在长度查询未落定时被延迟，落定后自动重放；
- 文件 stat 失败按零长度记账并记日志，响应不中断。
"#]

mod entity;
mod error;
mod stream;

pub use entity::{Headers, HttpEntity};
pub use error::HttpError;
pub use stream::HttpStream;

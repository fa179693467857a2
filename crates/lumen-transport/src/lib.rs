#![doc = r#"
# lumen-transport

## 设计动机（Why）
- **定位**：在 `lumen-reactor` 的就绪派发之上提供统一的套接字流抽象，
  让明文与 TLS 两种传输对上层呈现同一套
  `{listen, connect, read, queue_write, close}` 契约。
- **架构角色**：`lumen-http` 的输出流只面对 [`SocketStream`] 与
  [`WriteOperation`]，对承载它的是原生套接字还是加密通道一无所知。

## 核心契约（What）
- **写顺序**：同一条流上的写操作严格按入队顺序完成，完成回调在全部
  字节交付传输层后恰好触发一次；
- **错误语义**：构造期错误（绑定、TLS 初始化、发起连接）同步返回
  [`TransportError`]；运行期读写错误关闭所在连接并记日志，进程与
  事件循环不受影响；
- **关闭语义**：`close` 幂等，未交付写操作的回调永不触发。

## 实现策略（How）
- 状态机与写队列在 [`SocketStream`] 中组合传输对象，变体差异收敛到
  内部 trait 的两份实现；
- 明文文件发送在 Linux 上使用 `sendfile(2)` 零拷贝，加密变体按块读入
  并经记录层加密后发送，绝不绕过传输；
- 分块编码的块头/终止符构造集中在 [`chunk_header`]/[`chunk_terminator`]，
  上一块的收尾 CRLF 折叠进下一块的引导缓冲。
"#]

mod error;
mod plain;
mod secure;
mod stream;
mod transport;
mod write_op;

pub use error::TransportError;
pub use stream::{AcceptCallback, ConnectedCallback, ReadCallback, SocketState, SocketStream};
pub use write_op::{FileSend, WriteCallback, WriteOperation, chunk_header, chunk_terminator};

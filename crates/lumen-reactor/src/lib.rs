#![doc = r#"
# lumen-reactor

## 设计动机（Why）
- **定位**：本 crate 是 Lumen 事件驱动 I/O 内核的最底层——单线程协作式
  反应器，将原生就绪通知（描述符可读/可写、定时器到期）转换为类型化的
  回调调用。
- **架构角色**：`lumen-transport` 的套接字流与 `lumen-http` 的输出流均
  依赖本层提供的注册/派发能力；本 crate 自身不理解任何协议语义。
- **设计理念**：回调即契约。所有回调都在事件循环线程上执行，彼此之间
  无需加锁；唯一的跨线程边界是注入队列（见 [`LoopRemote`]）。

## 核心契约（What）
- **输入条件**：调用方在事件循环线程上创建监视器（watcher），并保证
  事件源在注册期间保持有效；
- **输出保障**：已停止的监视器绝不触发回调；回调内部的 panic 被派发
  边界捕获并记录，不会终止循环或影响其他监视器；
- **退出语义**：[`EventLoop::run_blocking`] 阻塞当前线程，直到
  [`EventLoop::stop`] 被调用或不再存在任何活跃监视器。

## 实现策略（How）
- **就绪源**：基于 `mio::Poll` 复用描述符就绪事件，定时器以二叉堆编排
  并折算为 poll 超时，无独立定时线程；
- **回调寻址**：每个监视器持有一个槽位索引（token），派发时查表取出
  回调；槽位随监视器销毁精确释放一次；
- **跨线程汇入**：工作线程通过 `mio::Waker` 唤醒循环，并把 `Send` 的
  任务或完成值投递到互斥队列，由循环线程串行消费。

## 风险与考量（Trade-offs）
- **边沿语义**：mio 在 epoll 后端使用边沿风格通知，事件消费方必须
  读/写至 `WouldBlock`，上层 `lumen-transport` 的排水循环即按此实现；
- **单线程假设**：[`LoopHandle`] 与各监视器句柄均为 `!Send`，编译期
  阻止跨线程误用。
"#]

mod error;
mod event_loop;
mod guard;
mod inject;
mod timer;
mod watcher;

pub use error::ReactorError;
pub use event_loop::{EventLoop, LoopHandle};
pub use inject::LoopRemote;
pub use timer::TimerWatcher;
pub use watcher::{IoWatcher, Ready};

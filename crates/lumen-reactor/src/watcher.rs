use crate::error::ReactorError;
use crate::event_loop::LoopShared;
use mio::event::{Event, Source};
use mio::{Interest, Token};
use std::cell::RefCell;
use std::rc::Rc;

/// 一次就绪通知的快照：可读/可写两个方向。
///
/// 对端关闭（read/write closed）被折叠进对应方向，交由流的读写路径
/// 以 `Ok(0)`/错误码的形式自然发现。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
}

impl Ready {
    pub(crate) fn from_event(event: &Event) -> Self {
        Ready {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
        }
    }
}

pub(crate) type IoCallback = Rc<RefCell<dyn FnMut(Ready)>>;

pub(crate) struct IoEntry {
    callback: IoCallback,
    active: bool,
}

/// token → 回调 的查找表，槽位随监视器销毁精确释放一次。
#[derive(Default)]
pub(crate) struct IoTable {
    entries: Vec<Option<IoEntry>>,
    free: Vec<usize>,
    active: usize,
}

impl IoTable {
    pub(crate) fn insert(&mut self, callback: IoCallback) -> usize {
        let entry = IoEntry {
            callback,
            active: true,
        };
        self.active += 1;
        match self.free.pop() {
            Some(key) => {
                self.entries[key] = Some(entry);
                key
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        }
    }

    /// 活跃槽位的回调克隆；已停止或已释放的监视器返回 `None`。
    pub(crate) fn callback(&self, key: usize) -> Option<IoCallback> {
        match self.entries.get(key) {
            Some(Some(entry)) if entry.active => Some(entry.callback.clone()),
            _ => None,
        }
    }

    pub(crate) fn set_active(&mut self, key: usize, active: bool) {
        if let Some(Some(entry)) = self.entries.get_mut(key) {
            if entry.active != active {
                entry.active = active;
                if active {
                    self.active += 1;
                } else {
                    self.active -= 1;
                }
            }
        }
    }

    pub(crate) fn remove(&mut self, key: usize) {
        if let Some(slot) = self.entries.get_mut(key) {
            if let Some(entry) = slot.take() {
                if entry.active {
                    self.active -= 1;
                }
                self.free.push(key);
            }
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active
    }
}

/// I/O 监视器：一个事件源注册与一个回调的绑定。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 套接字流需要在可读/可写之间切换关注点，并在关闭时精确注销；
///   本句柄将 token 分配、注册与注销封装为一个生命周期对象。
///
/// ## 契约（What）
/// - 由 [`LoopHandle::register_io`](crate::LoopHandle::register_io) 创建；
/// - `modify` 变更关注方向；`disable` 后回调不再触发；
/// - `deregister` 从轮询器注销事件源；句柄析构释放槽位，析构后即使
///   轮询器残留注册，未知 token 的事件也会被循环忽略。
///
/// ## 注意事项（Trade-offs）
/// - mio 的注册操作需要 `&mut` 事件源，因此 `modify`/`deregister` 由
///   事件源的所有者（套接字流）携源调用，句柄自身不持有源。
pub struct IoWatcher {
    shared: Rc<LoopShared>,
    key: usize,
}

impl IoWatcher {
    pub(crate) fn new(shared: Rc<LoopShared>, key: usize) -> Self {
        IoWatcher { shared, key }
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.key)
    }

    /// 变更关注的就绪方向。
    pub fn modify(
        &self,
        source: &mut (impl Source + ?Sized),
        interest: Interest,
    ) -> Result<(), ReactorError> {
        self.shared
            .registry()
            .reregister(source, self.token(), interest)
            .map_err(ReactorError::Register)
    }

    /// 停止触发回调；注册保持原样，可用 [`IoWatcher::enable`] 恢复。
    pub fn disable(&self) {
        self.shared.io.borrow_mut().set_active(self.key, false);
    }

    pub fn enable(&self) {
        self.shared.io.borrow_mut().set_active(self.key, true);
    }

    /// 从轮询器注销事件源；注销失败只记录，不向上传播。
    pub fn deregister(&self, source: &mut (impl Source + ?Sized)) {
        if let Err(err) = self.shared.registry().deregister(source) {
            tracing::warn!(target: "lumen::reactor", "注销事件源失败: {err}");
        }
    }
}

impl Drop for IoWatcher {
    fn drop(&mut self) {
        self.shared.io.borrow_mut().remove(self.key);
    }
}

use crate::event_loop::LoopShared;
use crate::guard::run_guarded;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub(crate) type TimerCallback = Rc<RefCell<dyn FnMut()>>;

struct TimerEntry {
    callback: TimerCallback,
    after: Duration,
    repeat: Duration,
    active: bool,
    /// 当前有效代数；堆中代数不符的到期项一律作废，保证已停止的
    /// 定时器绝不触发回调。
    generation: u64,
}

/// 定时器表：槽位表 + 到期时间的小顶堆。
///
/// 堆项为 `(到期时刻, 槽位, 代数)`；取消采用惰性策略，过期代数在
/// 出堆时被丢弃，无需在堆内搜索删除。
#[derive(Default)]
pub(crate) struct TimerTable {
    entries: Vec<Option<TimerEntry>>,
    free: Vec<usize>,
    heap: BinaryHeap<Reverse<(Instant, usize, u64)>>,
    active: usize,
    /// 全表单调递增的代数源：槽位复用后旧堆项的代数不可能再次出现。
    generations: u64,
}

impl TimerTable {
    fn next_generation(&mut self) -> u64 {
        self.generations += 1;
        self.generations
    }

    pub(crate) fn insert(
        &mut self,
        after: Duration,
        repeat: Duration,
        callback: TimerCallback,
    ) -> usize {
        let generation = self.next_generation();
        let entry = TimerEntry {
            callback,
            after,
            repeat,
            active: true,
            generation,
        };
        self.active += 1;
        let key = match self.free.pop() {
            Some(key) => {
                self.entries[key] = Some(entry);
                key
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        self.heap
            .push(Reverse((Instant::now() + after, key, generation)));
        key
    }

    fn entry_mut(&mut self, key: usize) -> Option<&mut TimerEntry> {
        self.entries.get_mut(key).and_then(Option::as_mut)
    }

    pub(crate) fn stop(&mut self, key: usize) {
        let next = self.next_generation();
        if let Some(entry) = self.entry_mut(key) {
            if entry.active {
                entry.active = false;
                entry.generation = next;
                self.active -= 1;
            }
        }
    }

    pub(crate) fn start(&mut self, key: usize) {
        let generation = self.next_generation();
        let Some(entry) = self.entry_mut(key) else {
            return;
        };
        if entry.active {
            return;
        }
        entry.active = true;
        entry.generation = generation;
        let deadline = Instant::now() + entry.after;
        self.active += 1;
        self.heap.push(Reverse((deadline, key, generation)));
    }

    pub(crate) fn is_active(&self, key: usize) -> bool {
        matches!(self.entries.get(key), Some(Some(entry)) if entry.active)
    }

    pub(crate) fn remove(&mut self, key: usize) {
        self.stop(key);
        if let Some(slot) = self.entries.get_mut(key) {
            if slot.take().is_some() {
                self.free.push(key);
            }
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active
    }

    /// 距最近一次有效到期的剩余时长；无活跃定时器时返回 `None`。
    pub(crate) fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        loop {
            let Reverse((deadline, key, generation)) = *self.heap.peek()?;
            if !self.is_live(key, generation) {
                self.heap.pop();
                continue;
            }
            return Some(deadline.saturating_duration_since(now));
        }
    }

    fn is_live(&self, key: usize, generation: u64) -> bool {
        matches!(
            self.entries.get(key),
            Some(Some(entry)) if entry.active && entry.generation == generation
        )
    }
}

/// 从表中取出一个已到期且仍有效的定时器；由派发循环反复调用。
fn pop_due(table: &mut TimerTable, now: Instant) -> Option<(usize, u64, TimerCallback)> {
    loop {
        let Reverse((deadline, key, generation)) = *table.heap.peek()?;
        if deadline > now {
            return None;
        }
        table.heap.pop();
        if !table.is_live(key, generation) {
            continue;
        }
        let callback = table
            .entries[key]
            .as_ref()
            .map(|entry| entry.callback.clone())?;
        return Some((key, generation, callback));
    }
}

/// 派发所有已到期定时器。
///
/// 重复定时器在回调返回后重新编排，判据是监视器此刻是否仍处于活跃
/// 状态——拥有者在自己的触发处理器内调用 `stop()` 即可终止后续触发，
/// 不与下一次编排竞态。一次性定时器触发后自行失活。
pub(crate) fn fire_due(shared: &Rc<LoopShared>) {
    let now = Instant::now();
    loop {
        let due = pop_due(&mut shared.timers.borrow_mut(), now);
        let Some((key, generation, callback)) = due else {
            return;
        };

        run_guarded("timer", || (callback.borrow_mut())());

        let mut timers = shared.timers.borrow_mut();
        let next = timers.next_generation();
        let Some(entry) = timers.entry_mut(key) else {
            continue;
        };
        // 回调内部 stop/start 过则代数已变，由新代数自行编排。
        if !entry.active || entry.generation != generation {
            continue;
        }
        if entry.repeat > Duration::ZERO {
            let deadline = Instant::now() + entry.repeat;
            timers.heap.push(Reverse((deadline, key, generation)));
        } else {
            entry.active = false;
            entry.generation = next;
            timers.active -= 1;
        }
    }
}

/// 定时器监视器：初始延迟 + 重复间隔 + 回调。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 为上层提供与 I/O 监视器一致的 start/stop 生命周期，重复间隔为零
///   时只触发一次且不再编排。
///
/// ## 契约（What）
/// - 由 [`LoopHandle::new_timer`](crate::LoopHandle::new_timer) 创建后
///   即处于已启动状态；
/// - `stop()` 之后回调保证不再触发，即使循环越过原定到期时刻继续运行；
/// - `start()` 以初始延迟重新编排；两者可任意次交替调用；
/// - 句柄析构回收槽位，等价于先 `stop()`。
pub struct TimerWatcher {
    shared: Rc<LoopShared>,
    key: usize,
}

impl TimerWatcher {
    pub(crate) fn new(shared: Rc<LoopShared>, key: usize) -> Self {
        TimerWatcher { shared, key }
    }

    pub fn start(&self) {
        self.shared.timers.borrow_mut().start(self.key);
    }

    pub fn stop(&self) {
        self.shared.timers.borrow_mut().stop(self.key);
    }

    pub fn is_active(&self) -> bool {
        self.shared.timers.borrow().is_active(self.key)
    }
}

impl Drop for TimerWatcher {
    fn drop(&mut self) {
        self.shared.timers.borrow_mut().remove(self.key);
    }
}

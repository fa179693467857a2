use crate::event_loop::LoopShared;
use crate::guard::run_guarded;
use mio::Waker;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

/// 跨线程投递给事件循环的任务。
pub(crate) enum Job {
    /// 在循环线程上直接执行的闭包。
    Run(Box<dyn FnOnce() + Send>),
    /// 阻塞工作的产出，回到循环线程后与本地续体（非 `Send`）配对。
    Complete {
        key: usize,
        payload: Box<dyn Any + Send>,
    },
    /// 远端请求停止循环。
    Stop,
}

/// 注入队列：互斥队列 + 唤醒器，事件循环与工作线程之间唯一的共享点。
pub(crate) struct Injector {
    queue: Mutex<VecDeque<Job>>,
    waker: Waker,
}

impl Injector {
    pub(crate) fn new(waker: Waker) -> Self {
        Injector {
            queue: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    pub(crate) fn push(&self, job: Job) {
        self.queue.lock().push_back(job);
        if let Err(err) = self.waker.wake() {
            tracing::error!(target: "lumen::reactor", "唤醒事件循环失败: {err}");
        }
    }

    pub(crate) fn pop(&self) -> Option<Job> {
        self.queue.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// 循环本地的续体表：`spawn_blocking` 的完成回调不要求 `Send`，
/// 存放于此，由回到循环线程的 [`Job::Complete`] 按键取走，一次性消费。
#[derive(Default)]
pub(crate) struct Completions {
    entries: Vec<Option<Box<dyn FnOnce(Box<dyn Any + Send>)>>>,
    free: Vec<usize>,
    pending: usize,
}

impl Completions {
    pub(crate) fn insert(&mut self, continuation: Box<dyn FnOnce(Box<dyn Any + Send>)>) -> usize {
        self.pending += 1;
        match self.free.pop() {
            Some(key) => {
                self.entries[key] = Some(continuation);
                key
            }
            None => {
                self.entries.push(Some(continuation));
                self.entries.len() - 1
            }
        }
    }

    pub(crate) fn take(&mut self, key: usize) -> Option<Box<dyn FnOnce(Box<dyn Any + Send>)>> {
        let continuation = self.entries.get_mut(key).and_then(Option::take);
        if continuation.is_some() {
            self.pending -= 1;
            self.free.push(key);
        }
        continuation
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending
    }
}

/// 消费注入队列；在每轮派发的末尾由循环线程调用。
pub(crate) fn drain(shared: &Rc<LoopShared>) {
    while let Some(job) = shared.injector.pop() {
        match job {
            Job::Run(task) => run_guarded("injected task", task),
            Job::Complete { key, payload } => {
                let continuation = shared.completions.borrow_mut().take(key);
                if let Some(continuation) = continuation {
                    run_guarded("blocking completion", || continuation(payload));
                }
            }
            Job::Stop => shared.request_stop(),
        }
    }
}

/// 事件循环的远端句柄（`Send + Clone`）。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 异步元数据查询（如文件 stat）在工作线程上完成，其结果必须先回到
///   循环线程再触碰共享状态；本句柄就是这条唯一的跨线程通道。
///
/// ## 契约（What）
/// - `post`：把 `Send` 闭包排入循环线程执行，执行受派发守卫保护；
/// - `stop`：远程请求停止循环，幂等；
/// - 循环已销毁时投递内容被安静丢弃（队列随 `Arc` 存活，但无人消费）。
#[derive(Clone)]
pub struct LoopRemote {
    pub(crate) injector: Arc<Injector>,
}

impl LoopRemote {
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.injector.push(Job::Run(Box::new(task)));
    }

    pub fn stop(&self) {
        self.injector.push(Job::Stop);
    }

    pub(crate) fn complete(&self, key: usize, payload: Box<dyn Any + Send>) {
        self.injector.push(Job::Complete { key, payload });
    }
}

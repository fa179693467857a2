use crate::error::ReactorError;
use crate::guard::run_guarded;
use crate::inject::{self, Completions, Injector, LoopRemote};
use crate::timer::{self, TimerTable, TimerWatcher};
use crate::watcher::{IoTable, IoWatcher, Ready};
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 唤醒器专用 token，避开 I/O 槽位的编号空间。
const WAKER_TOKEN: Token = Token(usize::MAX);

/// 循环线程内共享的核心状态；对外只经由各句柄类型暴露。
pub(crate) struct LoopShared {
    registry: mio::Registry,
    pub(crate) io: RefCell<IoTable>,
    pub(crate) timers: RefCell<TimerTable>,
    pub(crate) completions: RefCell<Completions>,
    pub(crate) injector: Arc<Injector>,
    stopped: Cell<bool>,
}

impl LoopShared {
    pub(crate) fn registry(&self) -> &mio::Registry {
        &self.registry
    }

    pub(crate) fn request_stop(&self) {
        self.stopped.set(true);
    }

    /// 只要存在任何活跃监视器或待回流的完成值，循环就保持运转。
    fn has_live_work(&self) -> bool {
        self.io.borrow().active_count() > 0
            || self.timers.borrow().active_count() > 0
            || self.completions.borrow().pending() > 0
            || !self.injector.is_empty()
    }
}

/// 单线程协作式事件循环。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把原生就绪通知与定时器到期统一折算为监视器回调，是整个 I/O 内核
///   的调度中枢；所有套接字回调与 HTTP 输出流的状态迁移都发生在本
///   循环线程上，因此彼此之间不需要加锁。
///
/// ## 逻辑（How）
/// - `run_blocking` 以最近定时器到期为超时调用 `mio::Poll::poll`，依次
///   派发 I/O 事件、到期定时器与跨线程注入的任务；EINTR 自动重试；
/// - 每个回调都在派发守卫内执行：panic 被捕获记录，循环与其余监视器
///   不受影响；
/// - 当 `stop()` 被调用，或不再存在活跃监视器与待完成的阻塞工作时，
///   `run_blocking` 返回。
///
/// ## 契约（What）
/// - **前置条件**：监视器注册与循环运转必须在同一线程；
/// - **后置条件**：`stop()` 幂等，且可在回调内部调用——当轮派发照常
///   完成，之后不再发起新的派发。
pub struct EventLoop {
    poll: Poll,
    events: Events,
    shared: Rc<LoopShared>,
}

impl EventLoop {
    pub fn new() -> Result<Self, ReactorError> {
        let poll = Poll::new().map_err(ReactorError::Poll)?;
        let registry = poll.registry().try_clone().map_err(ReactorError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ReactorError::Waker)?;
        Ok(EventLoop {
            poll,
            events: Events::with_capacity(1024),
            shared: Rc::new(LoopShared {
                registry,
                io: RefCell::new(IoTable::default()),
                timers: RefCell::new(TimerTable::default()),
                completions: RefCell::new(Completions::default()),
                injector: Arc::new(Injector::new(waker)),
                stopped: Cell::new(false),
            }),
        })
    }

    /// 循环线程内使用的注册句柄。
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// 可跨线程克隆/传递的远端句柄。
    pub fn remote(&self) -> LoopRemote {
        LoopRemote {
            injector: self.shared.injector.clone(),
        }
    }

    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// 阻塞运行，直到 `stop()` 或所有监视器失活。
    pub fn run_blocking(&mut self) -> Result<(), ReactorError> {
        self.shared.stopped.set(false);
        while !self.shared.stopped.get() && self.shared.has_live_work() {
            let timeout = self.shared.timers.borrow_mut().next_timeout(Instant::now());
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ReactorError::Poll(err)),
            }

            for event in self.events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                let callback = self.shared.io.borrow().callback(token.0);
                // 未知 token：监视器已销毁但注册残留，安静忽略。
                let Some(callback) = callback else { continue };
                let ready = Ready::from_event(event);
                run_guarded("io watcher", || (callback.borrow_mut())(ready));
            }

            timer::fire_due(&self.shared);
            inject::drain(&self.shared);
        }
        Ok(())
    }
}

/// 循环线程内的注册句柄（`!Send`，可廉价克隆）。
#[derive(Clone)]
pub struct LoopHandle {
    shared: Rc<LoopShared>,
}

impl LoopHandle {
    /// 注册一个 I/O 事件源，绑定就绪回调。
    pub fn register_io(
        &self,
        source: &mut (impl Source + ?Sized),
        interest: Interest,
        callback: impl FnMut(Ready) + 'static,
    ) -> Result<IoWatcher, ReactorError> {
        let key = self
            .shared
            .io
            .borrow_mut()
            .insert(Rc::new(RefCell::new(callback)));
        match self
            .shared
            .registry
            .register(source, Token(key), interest)
        {
            Ok(()) => Ok(IoWatcher::new(self.shared.clone(), key)),
            Err(err) => {
                self.shared.io.borrow_mut().remove(key);
                Err(ReactorError::Register(err))
            }
        }
    }

    /// 创建并启动一个定时器监视器。
    ///
    /// `repeat` 为零表示一次性触发；重复定时器在每次回调返回后按
    /// “监视器此刻仍活跃”这一判据重新编排。
    pub fn new_timer(
        &self,
        after: Duration,
        repeat: Duration,
        callback: impl FnMut() + 'static,
    ) -> TimerWatcher {
        let key = self
            .shared
            .timers
            .borrow_mut()
            .insert(after, repeat, Rc::new(RefCell::new(callback)));
        TimerWatcher::new(self.shared.clone(), key)
    }

    /// 在工作线程上执行阻塞任务，结果回到循环线程后交给续体。
    ///
    /// 这是文件长度查询等异步元数据路径的载体：`work` 在循环之外运行，
    /// `complete` 一定在循环线程上执行，因此可以安全触碰共享状态。
    pub fn spawn_blocking<T: Send + 'static>(
        &self,
        work: impl FnOnce() -> T + Send + 'static,
        complete: impl FnOnce(T) + 'static,
    ) {
        let key = self.shared.completions.borrow_mut().insert(Box::new(
            move |payload: Box<dyn Any + Send>| {
                if let Ok(value) = payload.downcast::<T>() {
                    complete(*value);
                }
            },
        ));
        let remote = LoopRemote {
            injector: self.shared.injector.clone(),
        };
        thread::spawn(move || {
            let value = work();
            remote.complete(key, Box::new(value));
        });
    }

    pub fn remote(&self) -> LoopRemote {
        LoopRemote {
            injector: self.shared.injector.clone(),
        }
    }

    /// 请求停止循环；可在回调内部调用，幂等。
    pub fn stop(&self) {
        self.shared.request_stop();
    }
}

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// 派发守卫：在回调边界捕获 panic，记录后继续运行循环。
///
/// 一个行为不端的回调不得拖垮反应器或影响其他监视器，这是事件循环的
/// 基本容错契约。
pub(crate) fn run_guarded<F: FnOnce()>(what: &'static str, f: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(
            target: "lumen::reactor",
            callback = what,
            "回调 panic，事件循环继续运行: {}",
            panic_message(&payload)
        );
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<非字符串 panic 载荷>"
    }
}

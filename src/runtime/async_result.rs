//! 异步结果
//!
//! `AsyncResult` 是任务结果的共享句柄，`Completer` 是写端。
//! 等待方在条件变量上阻塞直到任务完成；写端未完成就被丢弃时任务视为失败。

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{ValueError, ValueResult};
use crate::vm::value::ValueItem;

enum Slot {
    Pending,
    Ready(ValueItem),
    Failed(ValueError),
}

struct AsyncState {
    slot: Mutex<Slot>,
    done: Condvar,
}

/// 异步结果句柄
#[derive(Clone)]
pub struct AsyncResult(Arc<AsyncState>);

impl AsyncResult {
    /// 新建未完成的结果及其写端
    pub fn pending() -> (AsyncResult, Completer) {
        let state = Arc::new(AsyncState {
            slot: Mutex::new(Slot::Pending),
            done: Condvar::new(),
        });
        (AsyncResult(Arc::clone(&state)), Completer { state: Some(state) })
    }

    /// 已完成的结果
    pub fn ready(value: ValueItem) -> AsyncResult {
        AsyncResult(Arc::new(AsyncState {
            slot: Mutex::new(Slot::Ready(value)),
            done: Condvar::new(),
        }))
    }

    pub fn is_ready(&self) -> bool {
        !matches!(*self.0.slot.lock(), Slot::Pending)
    }

    /// 阻塞直到完成
    pub fn wait(&self) {
        let mut slot = self.0.slot.lock();
        while matches!(*slot, Slot::Pending) {
            self.0.done.wait(&mut slot);
        }
    }

    /// 等待完成后访问结果；任务失败时返回其错误
    pub fn with_result<R>(&self, f: impl FnOnce(&ValueItem) -> ValueResult<R>) -> ValueResult<R> {
        let mut slot = self.0.slot.lock();
        while matches!(*slot, Slot::Pending) {
            self.0.done.wait(&mut slot);
        }
        match &*slot {
            Slot::Ready(value) => f(value),
            Slot::Failed(err) => Err(err.clone()),
            Slot::Pending => Err(ValueError::InvalidOperation("async result is still pending".to_string())),
        }
    }

    pub fn ptr_eq(&self, other: &AsyncResult) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.0.slot.lock() {
            Slot::Pending => "pending",
            Slot::Ready(_) => "ready",
            Slot::Failed(_) => "failed",
        };
        f.debug_tuple("AsyncResult").field(&state).finish()
    }
}

// ============================================================================
// 写端
// ============================================================================

/// 结果写端，只能完成一次
pub struct Completer {
    state: Option<Arc<AsyncState>>,
}

impl Completer {
    /// 写入任务结果（无返回值视为 noting）并唤醒所有等待方
    pub fn complete(mut self, result: ValueResult<Option<ValueItem>>) {
        if let Some(state) = self.state.take() {
            let slot = match result {
                Ok(value) => Slot::Ready(value.unwrap_or_default()),
                Err(err) => Slot::Failed(err),
            };
            publish(&state, slot);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            tracing::warn!("async task dropped without producing a result");
            publish(
                &state,
                Slot::Failed(ValueError::InvalidOperation("async task was abandoned".to_string())),
            );
        }
    }
}

fn publish(state: &AsyncState, value: Slot) {
    *state.slot.lock() = value;
    state.done.notify_all();
}

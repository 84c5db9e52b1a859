//! 异步调用使用的工作线程池
//!
//! 有界任务队列 + 固定数量的命名工作线程，工作线程共享同一个接收端。
//! 提交任务返回 `AsyncResult`，任务的返回值或错误写入其中。
//!
//! 工作线程上提交的任务、队列已满时提交的任务都在当前线程执行：
//! 工作线程等待自己提交的嵌套任务时不会占住整个池子。

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use super::async_result::AsyncResult;
use crate::config::runtime_config;
use crate::error::{ValueError, ValueResult};
use crate::vm::value::ValueItem;

type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

pub struct TaskPool {
    workers: Vec<Worker>,
    sender: Sender<Task>,
}

static GLOBAL_POOL: OnceLock<TaskPool> = OnceLock::new();

impl TaskPool {
    pub fn new(size: usize, capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size.max(1) {
            match Worker::new(id, Arc::clone(&receiver)) {
                Ok(worker) => workers.push(worker),
                Err(err) => tracing::error!(worker = id, error = %err, "failed to start task worker"),
            }
        }
        tracing::debug!(workers = workers.len(), capacity, "task pool started");

        Self { workers, sender }
    }

    /// 全局任务池，大小取自运行时配置
    pub fn global() -> &'static TaskPool {
        GLOBAL_POOL.get_or_init(|| {
            let config = runtime_config();
            TaskPool::new(config.worker_count(), config.task_queue_capacity)
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// 提交任务
    ///
    /// 没有可用的工作线程、当前就在工作线程上或队列已满时，任务在当前线程执行。
    /// 任务 panic 时结果为 `InvalidOperation`（仅限 unwind 的构建）
    pub fn spawn<F>(&self, f: F) -> AsyncResult
    where
        F: FnOnce() -> ValueResult<Option<ValueItem>> + Send + 'static,
    {
        let (result, completer) = AsyncResult::pending();
        let task: Task = Box::new(move || completer.complete(run_guarded(f)));
        if self.workers.is_empty() || IN_WORKER.with(Cell::get) {
            task();
            return result;
        }
        match self.sender.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                tracing::debug!("task queue full, running task inline");
                task();
            }
            Err(TrySendError::Disconnected(task)) => {
                tracing::warn!("task queue disconnected, running task inline");
                task();
            }
        }
        result
    }
}

fn run_guarded<F>(f: F) -> ValueResult<Option<ValueItem>>
where
    F: FnOnce() -> ValueResult<Option<ValueItem>>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        tracing::error!("async task panicked");
        Err(ValueError::InvalidOperation("async task panicked".to_string()))
    })
}

struct Worker {
    _thread: JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<Receiver<Task>>>) -> std::io::Result<Self> {
        let thread = std::thread::Builder::new()
            .name(format!("attacha-worker-{}", id))
            .spawn(move || {
                IN_WORKER.with(|flag| flag.set(true));
                loop {
                    let task = {
                        let receiver = receiver.lock();
                        receiver.recv()
                    };
                    match task {
                        Ok(task) => task(),
                        Err(_) => break,
                    }
                }
            })?;
        Ok(Self { _thread: thread })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValueError;

    #[test]
    fn test_spawn_many() {
        let pool = TaskPool::new(3, 4);
        assert_eq!(pool.worker_count(), 3);
        let results: Vec<_> = (0..32i64)
            .map(|i| pool.spawn(move || Ok(Some(ValueItem::from(i * i)))))
            .collect();
        for (i, res) in results.iter().enumerate() {
            let value = res.with_result(|v| v.cast::<i64>()).unwrap();
            assert_eq!(value, (i * i) as i64);
        }
    }

    #[test]
    fn test_error_is_kept() {
        let pool = TaskPool::new(1, 1);
        let res = pool.spawn(|| Err(ValueError::NotImplemented("later".to_string())));
        assert!(matches!(res.with_result(|_| Ok(())), Err(ValueError::NotImplemented(_))));
    }

    #[test]
    fn test_task_panic_fails_result() {
        let pool = TaskPool::new(1, 1);
        let res = pool.spawn(|| panic!("boom"));
        assert!(matches!(res.with_result(|_| Ok(())), Err(ValueError::InvalidOperation(_))));

        // 工作线程仍然存活
        let next = pool.spawn(|| Ok(Some(ValueItem::from(5i32))));
        assert_eq!(next.with_result(|v| v.cast::<i32>()).unwrap(), 5);
    }

    #[test]
    fn test_nested_spawn_on_single_worker() {
        let pool = Arc::new(TaskPool::new(1, 1));
        let inner_pool = Arc::clone(&pool);
        let outer = pool.spawn(move || {
            let inner = inner_pool.spawn(|| Ok(Some(ValueItem::from(20i64))));
            let value = inner.with_result(|v| v.cast::<i64>())?;
            Ok(Some(ValueItem::from(value + 1)))
        });
        assert_eq!(outer.with_result(|v| v.cast::<i64>()).unwrap(), 21);
    }

    #[test]
    fn test_full_queue_runs_inline() {
        let pool = TaskPool::new(1, 1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let blocker = pool.spawn(move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
            Ok(None)
        });
        started_rx.recv().unwrap();

        let queued = pool.spawn(|| Ok(Some(ValueItem::from(1i32))));
        let inline = pool.spawn(|| Ok(Some(ValueItem::from(2i32))));
        assert!(inline.is_ready());
        assert!(!queued.is_ready());

        gate_tx.send(()).unwrap();
        blocker.wait();
        assert_eq!(queued.with_result(|v| v.cast::<i32>()).unwrap(), 1);
        assert_eq!(inline.with_result(|v| v.cast::<i32>()).unwrap(), 2);
    }
}

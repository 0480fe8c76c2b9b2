use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Sender};
use log::warn;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex,
    },
    thread::{Builder as ThreadBuilder, JoinHandle},
};

type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// 固定并行度的任务池
///
/// 任务入队后由固定数量的工作线程执行，第一个失败的任务
/// 取消还未开始的任务，`wait` 排空队列并返回第一个错误。
pub(crate) struct TaskPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<PoolShared>,
}

#[derive(Default)]
struct PoolShared {
    canceled: AtomicBool,
    first_error: Mutex<Option<Error>>,
}

impl TaskPool {
    /// 创建任务池
    pub(crate) fn new(concurrency: usize) -> Result<Self> {
        let concurrency = concurrency.max(1);
        let (sender, receiver) = unbounded::<Task>();
        let shared: Arc<PoolShared> = Default::default();
        let mut workers = Vec::with_capacity(concurrency);
        for i in 0..concurrency {
            let receiver = receiver.to_owned();
            let shared = shared.to_owned();
            let worker = ThreadBuilder::new()
                .name(format!("kodo-operation.pool.{}", i))
                .spawn(move || {
                    for task in receiver.iter() {
                        if shared.canceled.load(Relaxed) {
                            continue;
                        }
                        if let Err(err) = task() {
                            warn!("pool task failed: {}", err);
                            let mut first_error = shared.first_error.lock().unwrap();
                            if first_error.is_none() {
                                *first_error = Some(err);
                            }
                            shared.canceled.store(true, Relaxed);
                        }
                    }
                })?;
            workers.push(worker);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
            shared,
        })
    }

    /// 提交任务
    pub(crate) fn spawn(&self, task: impl FnOnce() -> Result<()> + Send + 'static) {
        if let Some(sender) = &self.sender {
            // 接收端随工作线程存活，入队不会失败
            let _ = sender.send(Box::new(task));
        }
    }

    /// 等待所有任务结束
    ///
    /// 返回第一个任务错误。出错后还未开始的任务被跳过。
    pub(crate) fn wait(mut self) -> Result<()> {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        match self.shared.first_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

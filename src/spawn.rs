use log::warn;
use once_cell::sync::Lazy;
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    thread::Builder as ThreadBuilder,
};

type Task = Box<dyn FnOnce() + Send + 'static>;
type TaskQueues = HashMap<String, VecDeque<Task>>;

static PENDING_TASKS: Lazy<Mutex<TaskQueues>> = Lazy::new(Default::default);

/// 以给定名字派发后台任务
///
/// 同名任务串行执行：已有同名工作线程在运行时只入队，
/// 由该线程排空队列。保证同一类后台工作进程内至多一个在执行。
pub(crate) fn spawn_named(task_name: &str, f: impl FnOnce() + Send + 'static) {
    {
        let mut queues = PENDING_TASKS.lock().unwrap();
        if let Some(queue) = queues.get_mut(task_name) {
            queue.push_back(Box::new(f));
            return;
        }
        let mut queue: VecDeque<Task> = VecDeque::with_capacity(1);
        queue.push_back(Box::new(f));
        queues.insert(task_name.to_owned(), queue);
    }

    let task_name = task_name.to_owned();
    let spawn_result = ThreadBuilder::new().name(task_name.to_owned()).spawn({
        let task_name = task_name.to_owned();
        move || {
            while let Some(task) = next_task(&task_name) {
                task();
            }
        }
    });
    if let Err(err) = spawn_result {
        warn!("failed to spawn background worker: {}", err);
        PENDING_TASKS.lock().unwrap().remove(&task_name);
    }
}

fn next_task(task_name: &str) -> Option<Task> {
    let mut queues = PENDING_TASKS.lock().unwrap();
    if let Some(queue) = queues.get_mut(task_name) {
        if let Some(task) = queue.pop_front() {
            return Some(task);
        }
        queues.remove(task_name);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering::Relaxed},
            Arc,
        },
        thread::sleep,
        time::Duration,
    };

    #[test]
    fn test_same_name_tasks_run_serially() {
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let running = running.to_owned();
            let max_running = max_running.to_owned();
            let finished = finished.to_owned();
            spawn_named("kodo-operation.test.serial", move || {
                let now = running.fetch_add(1, Relaxed) + 1;
                max_running.fetch_max(now, Relaxed);
                sleep(Duration::from_millis(10));
                running.fetch_sub(1, Relaxed);
                finished.fetch_add(1, Relaxed);
            });
        }
        for _ in 0..100 {
            if finished.load(Relaxed) == 8 {
                break;
            }
            sleep(Duration::from_millis(20));
        }
        assert_eq!(finished.load(Relaxed), 8);
        assert_eq!(max_running.load(Relaxed), 1);
    }
}

use std::{any::Any, backtrace::Backtrace, future::Future, panic::AssertUnwindSafe};

use futures_util::FutureExt;
use log::error;
use tokio::task::JoinHandle;

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A spawned task whose panics are caught and logged instead of tearing
/// down the process.
pub struct Task {
    name: String,
    handle: JoinHandle<()>,
}

pub fn go<F>(name: impl Into<String>, fut: F) -> Task
where
    F: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let task_name = name.clone();
    let handle = tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            error!(
                "task {task_name} panicked: {}\n{}",
                panic_message(panic.as_ref()),
                Backtrace::force_capture()
            );
        }
    });
    Task { name, handle }
}

impl Task {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            if !err.is_cancelled() {
                error!("task {} failed: {err}", self.name);
            }
        }
    }
}

/// A group of tasks awaited together.
#[derive(Default)]
pub struct Supervisor {
    tasks: Vec<Task>,
}

impl Supervisor {
    pub fn go<F>(&mut self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(go(name, fut));
    }

    pub async fn wait(self) {
        for task in self.tasks {
            task.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn panics_are_contained() {
        let task = go("boom", async {
            panic!("boom");
        });
        task.join().await;

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        go("after", async move {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .join()
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn supervisor_waits_for_all() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::default();
        for i in 0..4 {
            let c = counter.clone();
            supervisor.go(format!("worker-{i}"), async move {
                tokio::task::yield_now().await;
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        supervisor.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn extracts_panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
    }
}

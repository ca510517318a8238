//! AmigaOS task/signal primitives, abstracted as a collaborator (C5/C6
//! depend on it; SPEC_FULL.md §6.4, §4.5.1). A cooperative-multitasking
//! task and a host OS thread play the same role here — both are
//! independently schedulable units of control sharing the process's
//! address space — so the production implementation is built directly
//! on `std::thread` and `std::sync::{Mutex, Condvar}`.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A one-bit signal: `wait` blocks until `signal` has been called at
/// least once since the last `wait` returned. Exactly-once-per-pair
/// semantics, matching the target/supervisor stop-signal handshake
/// (SPEC_FULL.md §4.5, §5).
#[derive(Clone)]
pub struct Signal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Signal {
    pub fn new() -> Signal {
        Signal {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn send(&self) {
        let (lock, cvar) = &*self.inner;
        let mut raised = lock.lock().unwrap();
        *raised = true;
        cvar.notify_one();
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut raised = lock.lock().unwrap();
        while !*raised {
            raised = cvar.wait(raised).unwrap();
        }
        *raised = false;
    }
}

impl Default for Signal {
    fn default() -> Signal {
        Signal::new()
    }
}

/// A handle to a spawned peer task. Dropping it does not stop the task;
/// use `OsTasking::remove_task`.
pub struct TaskHandle {
    join: Option<JoinHandle<()>>,
}

pub trait OsTasking: Send + Sync {
    /// Spawns a peer task running `body`. Stdio is inherited by
    /// construction (a thread shares the process's file descriptors).
    fn spawn_task(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> TaskHandle;

    /// Waits for a task that is expected to finish on its own (normal
    /// exit). Blocks until it does.
    fn join_task(&self, handle: TaskHandle);

    /// Forcibly removes a task that may never finish on its own.
    /// Best-effort: a real host thread cannot be force-killed from
    /// outside without cooperation, so this detaches rather than
    /// blocking — it does not guarantee the task has actually stopped
    /// running, only that the caller is no longer waiting on it.
    fn remove_task(&self, handle: TaskHandle);

    fn allocate_signal(&self) -> Signal {
        Signal::new()
    }
}

pub struct ThreadOsTasking;

impl OsTasking for ThreadOsTasking {
    fn spawn_task(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> TaskHandle {
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .expect("failed to spawn target task");
        TaskHandle { join: Some(join) }
    }

    fn join_task(&self, mut handle: TaskHandle) {
        if let Some(join) = handle.join.take() {
            let _ = join.join();
        }
    }

    fn remove_task(&self, mut handle: TaskHandle) {
        // Detach: dropping the JoinHandle lets the thread run to
        // completion (or forever) on its own; we do not wait for it.
        handle.join.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn signal_wait_blocks_until_send() {
        let sig = Signal::new();
        let sig2 = sig.clone();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        let handle = std::thread::spawn(move || {
            sig2.wait();
            flag2.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!flag.load(Ordering::SeqCst));
        sig.send();
        handle.join().unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn thread_os_tasking_join_waits_for_completion() {
        let tasking = ThreadOsTasking;
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        let handle = tasking.spawn_task("test-task", Box::new(move || {
            flag2.store(true, Ordering::SeqCst);
        }));
        tasking.join_task(handle);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn remove_task_does_not_block_caller() {
        let tasking = ThreadOsTasking;
        let handle = tasking.spawn_task("stuck-task", Box::new(|| {
            std::thread::sleep(std::time::Duration::from_secs(3600));
        }));
        // Must return promptly even though the task body never finishes.
        tasking.remove_task(handle);
    }
}

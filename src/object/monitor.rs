use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    count: u32,
}

/// A reentrant lock with wait/notify, attached to every class object.
#[derive(Default)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    released: Condvar,
    notified: Condvar,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        while state.owner.is_some() && state.owner != Some(me) {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.count += 1;
    }

    pub fn exit(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(std::thread::current().id()));
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.released.notify_one();
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        return self.state.lock().owner == Some(std::thread::current().id());
    }

    /// Releases the monitor entirely, sleeps until notified, then reacquires
    /// it with the same recursion count.
    pub fn wait(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(me));
        let count = state.count;
        state.owner = None;
        state.count = 0;
        self.released.notify_one();
        self.notified.wait(&mut state);
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.count = count;
    }

    pub fn notify_all(&self) {
        let _state = self.state.lock();
        self.notified.notify_all();
    }
}

/// Holds a monitor for the guard's lifetime.
pub struct ObjectLock<'a> {
    monitor: &'a Monitor,
}

impl<'a> ObjectLock<'a> {
    pub fn new(monitor: &'a Monitor) -> ObjectLock<'a> {
        monitor.enter();
        return ObjectLock { monitor };
    }

    pub fn wait(&self) {
        self.monitor.wait();
    }

    pub fn notify_all(&self) {
        self.monitor.notify_all();
    }
}

impl<'a> Drop for ObjectLock<'a> {
    fn drop(&mut self) {
        self.monitor.exit();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    };

    use super::{Monitor, ObjectLock};

    #[test]
    fn reentrant_enter() {
        let monitor = Monitor::new();
        let outer = ObjectLock::new(&monitor);
        {
            let _inner = ObjectLock::new(&monitor);
            assert!(monitor.is_held_by_current_thread());
        }
        assert!(monitor.is_held_by_current_thread());
        drop(outer);
        assert!(!monitor.is_held_by_current_thread());
    }

    #[test]
    fn excludes_other_threads() {
        let monitor = Arc::new(Monitor::new());
        let counter = Arc::new(AtomicU32::new(0));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let monitor = monitor.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _lock = ObjectLock::new(&monitor);
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn wait_releases_nested_holds() {
        let monitor = Arc::new(Monitor::new());
        let ready = Arc::new(AtomicBool::new(false));
        let waiter = {
            let monitor = monitor.clone();
            let ready = ready.clone();
            std::thread::spawn(move || {
                let _outer = ObjectLock::new(&monitor);
                let inner = ObjectLock::new(&monitor);
                while !ready.load(Ordering::Acquire) {
                    inner.wait();
                }
                assert!(monitor.is_held_by_current_thread());
            })
        };
        loop {
            let lock = ObjectLock::new(&monitor);
            ready.store(true, Ordering::Release);
            lock.notify_all();
            drop(lock);
            if waiter.is_finished() {
                break;
            }
            std::thread::yield_now();
        }
        waiter.join().unwrap();
    }
}

// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The scheduling substrate: FIFO and priority dispatchers, re-entrant
//! dispatcher frames, and the worker thread pool.
//!
//! All graph mutation happens on one "main thread" draining a FIFO
//! dispatcher of actions. Self work runs on the pool and posts its result
//! back onto the main dispatcher.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Work executed on the worker pool.
pub type WorkerAction = Box<dyn FnOnce() + Send>;

/// A thread-safe FIFO queue with suspend/resume and stop semantics.
///
/// `pop` blocks until an element is available and the dispatcher is not
/// suspended, or returns `None` once the dispatcher is stopped so consumer
/// loops can exit.
pub struct Dispatcher<T> {
    state: Mutex<DispatcherState<T>>,
    cvar: Condvar,
}

struct DispatcherState<T> {
    queue: VecDeque<T>,
    suspended: bool,
    stopped: bool,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Dispatcher<T> {
        Dispatcher {
            state: Mutex::new(DispatcherState {
                queue: VecDeque::new(),
                suspended: false,
                stopped: false,
            }),
            cvar: Condvar::new(),
        }
    }
}

impl<T> Dispatcher<T> {
    pub fn new() -> Dispatcher<T> {
        Dispatcher::default()
    }

    pub fn push(&self, item: T) {
        {
            let mut state = self.state.lock().unwrap();
            state.queue.push_back(item);
        }
        self.cvar.notify_one();
    }

    /// Blocks until an item is available or the dispatcher is stopped.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopped {
                return None;
            }
            if !state.suspended {
                if let Some(item) = state.queue.pop_front() {
                    return Some(item);
                }
            }
            state = self.cvar.wait(state).unwrap();
        }
    }

    /// Removes an item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        if state.stopped || state.suspended {
            return None;
        }
        state.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn suspend(&self) {
        self.state.lock().unwrap().suspended = true;
        self.cvar.notify_all();
    }

    pub fn resume(&self) {
        self.state.lock().unwrap().suspended = false;
        self.cvar.notify_all();
    }

    pub fn suspended(&self) -> bool {
        self.state.lock().unwrap().suspended
    }

    pub fn start(&self) {
        self.state.lock().unwrap().stopped = false;
        self.cvar.notify_all();
    }

    pub fn stop(&self) {
        self.state.lock().unwrap().stopped = true;
        self.cvar.notify_all();
    }

    pub fn stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }
}

/// Priority classes for the priority dispatcher. The mapping onto queue
/// levels is proportional to the number of levels.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

/// A thread-safe FIFO queue per priority level. `pop` returns the front of
/// the highest non-empty level.
pub struct PriorityDispatcher<T> {
    state: Mutex<PriorityState<T>>,
    cvar: Condvar,
}

struct PriorityState<T> {
    queues: Vec<VecDeque<T>>,

    /// Level of the highest-priority queued item, or `None` when empty.
    highest: Option<usize>,

    suspended: bool,
    stopped: bool,
}

impl<T> PriorityDispatcher<T> {
    /// Constructs a dispatcher with `n_levels` priority levels.
    pub fn new(n_levels: usize) -> PriorityDispatcher<T> {
        assert!(n_levels > 0, "dispatcher needs at least one level");
        let mut queues = Vec::with_capacity(n_levels);
        for _ in 0..n_levels {
            queues.push(VecDeque::new());
        }
        PriorityDispatcher {
            state: Mutex::new(PriorityState {
                queues,
                highest: None,
                suspended: false,
                stopped: false,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn n_levels(&self) -> usize {
        self.state.lock().unwrap().queues.len()
    }

    pub fn max_level(&self) -> usize {
        self.n_levels() - 1
    }

    /// The queue level a priority class maps onto.
    pub fn level_of(&self, priority: Priority) -> usize {
        let n = self.n_levels();
        match priority {
            Priority::VeryHigh => n - 1,
            Priority::High => (n * 3) / 4,
            Priority::Medium => n / 2,
            Priority::Low => n / 4,
            Priority::VeryLow => 0,
        }
    }

    pub fn push(&self, item: T, priority: Priority) {
        let level = self.level_of(priority);
        self.push_level(item, level);
    }

    pub fn push_level(&self, item: T, level: usize) {
        {
            let mut state = self.state.lock().unwrap();
            let level = level.min(state.queues.len() - 1);
            state.queues[level].push_back(item);
            if state.highest.map_or(true, |h| level > h) {
                state.highest = Some(level);
            }
        }
        self.cvar.notify_one();
    }

    /// Blocks until an item is available or the dispatcher is stopped.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopped {
                return None;
            }
            if !state.suspended {
                if let Some(level) = state.highest {
                    let item = state.queues[level]
                        .pop_front()
                        .expect("highest level must be non-empty");
                    if state.queues[level].is_empty() {
                        state.highest = (0..level)
                            .rev()
                            .find(|&i| !state.queues[i].is_empty());
                    }
                    return Some(item);
                }
            }
            state = self.cvar.wait(state).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn suspend(&self) {
        self.state.lock().unwrap().suspended = true;
        self.cvar.notify_all();
    }

    pub fn resume(&self) {
        self.state.lock().unwrap().suspended = false;
        self.cvar.notify_all();
    }

    pub fn suspended(&self) -> bool {
        self.state.lock().unwrap().suspended
    }

    pub fn stop(&self) {
        self.state.lock().unwrap().stopped = true;
        self.cvar.notify_all();
    }

    pub fn stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }
}

/// Stops a nested run loop without stopping the whole dispatcher.
///
/// `Builder` runs the main dispatcher "until this frame is stopped",
/// allowing re-entrant event processing while waiting for one specific
/// completion.
#[derive(Clone, Default)]
pub struct DispatcherFrame {
    stopped: Arc<AtomicBool>,
}

impl DispatcherFrame {
    pub fn new() -> DispatcherFrame {
        DispatcherFrame::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// A fixed pool of worker threads draining a priority dispatcher of
/// `WorkerAction`s. Joined on drop.
pub struct ThreadPool {
    queue: Arc<PriorityDispatcher<WorkerAction>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Number of priority levels in the worker queue.
    pub const LEVELS: usize = 8;

    pub fn new(size: usize) -> ThreadPool {
        let queue = Arc::new(PriorityDispatcher::<WorkerAction>::new(Self::LEVELS));
        let mut workers = Vec::with_capacity(size);

        for i in 0..size {
            let queue = queue.clone();
            let handle = thread::Builder::new()
                .name(format!("yam-worker-{}", i))
                .spawn(move || {
                    while let Some(action) = queue.pop() {
                        action();
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        ThreadPool { queue, workers }
    }

    /// Pool sized to the machine.
    pub fn with_default_size() -> ThreadPool {
        ThreadPool::new(num_cpus::get())
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn queue(&self) -> &Arc<PriorityDispatcher<WorkerAction>> {
        &self.queue
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.queue.stop();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let d = Dispatcher::new();
        d.push(1);
        d.push(2);
        d.push(3);
        assert_eq!(d.pop(), Some(1));
        assert_eq!(d.pop(), Some(2));
        assert_eq!(d.pop(), Some(3));
    }

    #[test]
    fn stop_unblocks_pop() {
        let d: Arc<Dispatcher<u32>> = Arc::new(Dispatcher::new());
        let d2 = d.clone();

        let handle = thread::spawn(move || d2.pop());

        thread::sleep(Duration::from_millis(20));
        d.stop();

        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn suspend_blocks_pop_until_resume() {
        let d: Arc<Dispatcher<u32>> = Arc::new(Dispatcher::new());
        d.push(42);
        d.suspend();

        let d2 = d.clone();
        let handle = thread::spawn(move || d2.pop());

        thread::sleep(Duration::from_millis(20));
        assert_eq!(d.len(), 1);

        d.resume();
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    #[test]
    fn priority_pop_highest_first() {
        let d = PriorityDispatcher::new(8);
        d.push("low", Priority::Low);
        d.push("very-high", Priority::VeryHigh);
        d.push("medium", Priority::Medium);
        d.push("medium2", Priority::Medium);

        assert_eq!(d.pop(), Some("very-high"));
        assert_eq!(d.pop(), Some("medium"));
        assert_eq!(d.pop(), Some("medium2"));
        assert_eq!(d.pop(), Some("low"));
    }

    #[test]
    fn priority_levels_are_ordered() {
        let d: PriorityDispatcher<()> = PriorityDispatcher::new(8);
        assert!(d.level_of(Priority::VeryHigh) > d.level_of(Priority::High));
        assert!(d.level_of(Priority::High) > d.level_of(Priority::Medium));
        assert!(d.level_of(Priority::Medium) > d.level_of(Priority::Low));
        assert!(d.level_of(Priority::Low) > d.level_of(Priority::VeryLow));
    }

    #[test]
    fn pool_runs_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(4);
            for _ in 0..100 {
                let counter = counter.clone();
                pool.queue().push(
                    Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                    Priority::Medium,
                );
            }

            // Dropping the pool stops the queue and joins the workers, but
            // queued work may be discarded by the stop. Wait for quiescence
            // first.
            while counter.load(Ordering::SeqCst) < 100 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn frame_stops_nested_loop() {
        let frame = DispatcherFrame::new();
        assert!(!frame.stopped());
        frame.stop();
        assert!(frame.stopped());
    }
}

//! # Task Pool
//!
//! Bounded execution of task jobs. A global semaphore caps the number of
//! concurrently running jobs at `max_threads`; an optional per-tag semaphore
//! additionally caps jobs of one task type. Jobs that cannot run yet wait in
//! submission order per semaphore.
//!
//! Jobs are synchronous user code and run on the runtime's blocking pool while
//! holding their permits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub struct TaskPool {
    max_threads: usize,
    threads: Arc<Semaphore>,
    tag_threads: HashMap<String, Arc<Semaphore>>,
    tag_limits: HashMap<String, usize>,
    runtime: Handle,
}

impl TaskPool {
    /// Create a pool bound to the current runtime
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(max_threads: usize, maximum_thread_per_tag: &HashMap<String, usize>) -> Self {
        Self::with_runtime(Handle::current(), max_threads, maximum_thread_per_tag)
    }

    pub fn with_runtime(
        runtime: Handle,
        max_threads: usize,
        maximum_thread_per_tag: &HashMap<String, usize>,
    ) -> Self {
        let tag_threads = maximum_thread_per_tag
            .iter()
            .map(|(tag, cap)| (tag.clone(), Arc::new(Semaphore::new(*cap))))
            .collect();

        Self {
            max_threads,
            threads: Arc::new(Semaphore::new(max_threads)),
            tag_threads,
            tag_limits: maximum_thread_per_tag.clone(),
            runtime,
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Free execution slots right now
    pub fn available_threads(&self) -> usize {
        self.threads.available_permits()
    }

    /// Cap configured for `tag`, if any
    pub fn tag_limit(&self, tag: &str) -> Option<usize> {
        self.tag_limits.get(tag).copied()
    }

    /// Queue `job`; it starts once a global slot and a slot for `tag` (when
    /// capped) are free
    ///
    /// May be called from any thread, including blocking-pool threads.
    pub fn submit<F>(&self, tag: Option<&str>, job: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let tag_slots = tag.and_then(|tag| self.tag_threads.get(tag)).cloned();
        let threads = self.threads.clone();
        let tag = tag.map(str::to_string);

        self.runtime.spawn(async move {
            // Tag permit first so a capped type does not hold global slots
            // while it waits for its own.
            let tag_permit = match tag_slots {
                Some(slots) => match slots.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        error!(tag = ?tag, "Tag semaphore closed, dropping task");
                        return;
                    }
                },
                None => None,
            };

            let permit = match threads.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(tag = ?tag, "Pool semaphore closed, dropping task");
                    return;
                }
            };

            debug!(tag = ?tag, "Acquired pool slot");

            let outcome = tokio::task::spawn_blocking(move || {
                let _permits = (permit, tag_permit);
                job();
            })
            .await;

            if let Err(join_error) = outcome {
                error!(tag = ?tag, error = %join_error, "Task job did not complete");
            }
        })
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("max_threads", &self.max_threads)
            .field("available_threads", &self.available_threads())
            .field("capped_tags", &self.tag_threads.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn job(self: &Arc<Self>) -> impl FnOnce() + Send + 'static {
            let gauge = self.clone();
            move || {
                let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
                gauge.peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                gauge.current.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_global_limit_is_enforced() {
        let pool = TaskPool::new(2, &HashMap::new());
        let gauge = Gauge::new();

        let handles: Vec<_> = (0..6).map(|_| pool.submit(None, gauge.job())).collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency was {peak}");
        assert_eq!(pool.available_threads(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tag_limit_is_enforced() {
        let caps = HashMap::from([("video".to_string(), 1)]);
        let pool = TaskPool::new(4, &caps);
        assert_eq!(pool.tag_limit("video"), Some(1));
        assert_eq!(pool.tag_limit("audio"), None);

        let video = Gauge::new();
        let other = Gauge::new();
        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(pool.submit(Some("video"), video.job()));
            handles.push(pool.submit(Some("audio"), other.job()));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(video.peak.load(Ordering::SeqCst), 1);
        assert!(other.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_panicking_job_releases_its_slot() {
        let pool = TaskPool::new(1, &HashMap::new());
        pool.submit(None, || panic!("boom")).await.unwrap();
        assert_eq!(pool.available_threads(), 1);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        pool.submit(None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}

use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A named background thread calling `tick` repeatedly. The value returned
/// by `tick` is the delay until the next call; `None` ends the task.
///
/// Calls are scheduled against a running deadline, so the time spent inside
/// `tick` does not stretch the cadence. A task that falls behind resumes from
/// the current instant instead of firing a catch-up burst.
///
/// Dropping the handle stops the task and joins the thread.
pub struct Periodic {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    pub fn spawn<F>(name: &str, mut tick: F) -> Result<Self, Error>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut next = Instant::now();
                while !thread_stop.load(Ordering::Acquire) {
                    let Some(delay) = tick() else { break };
                    next += delay;
                    let now = Instant::now();
                    if next < now {
                        next = now;
                    }
                    park_until(next, &thread_stop);
                }
                log::debug!("{} stopped", std::thread::current().name().unwrap_or("task"));
            })?;
        Ok(Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("Task {} panicked", self.name);
            }
        }
    }
}

/// Parks until `deadline`, ignoring spurious wake-ups. Returns early only
/// when `stop` is raised.
fn park_until(deadline: Instant, stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::park_timeout(deadline - now);
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn runs_until_tick_returns_none() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let mut task = Periodic::spawn("count", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            (n < 3).then_some(Duration::from_millis(1))
        })
        .unwrap();
        while !task.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        task.stop();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn ticks_never_fire_early() {
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorder = stamps.clone();
        let started = Instant::now();
        let mut task = Periodic::spawn("stamps", move || {
            let mut stamps = recorder.lock();
            stamps.push(Instant::now());
            (stamps.len() < 4).then_some(Duration::from_millis(20))
        })
        .unwrap();
        while !task.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        task.stop();
        let stamps = stamps.lock();
        assert_eq!(stamps.len(), 4);
        for (k, stamp) in stamps.iter().enumerate() {
            assert!(*stamp - started >= Duration::from_millis(20) * k as u32);
        }
    }

    #[test]
    fn stop_interrupts_long_delay() {
        let mut task = Periodic::spawn("idle", || Some(Duration::from_secs(3600))).unwrap();
        task.stop();
        assert!(task.is_finished());
    }
}

use std::fmt;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use chrono::{DateTime, Utc};
use tokio::{
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{debug, info};

use crate::flow::ProactivePolicy;

/// Called with the message text every time a nudge fires.
pub type NudgeHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Timer-driven proactive nudges for one widget instance.
///
/// While the widget sits closed the scheduler waits `delay` seconds, fires
/// the first scripted message, then fires every `interval` seconds until the
/// cap is reached. Messages cycle in order. The fired count is
/// instance-lifetime state: the only way to reset it is a fresh mount, even
/// if a later policy raises the cap.
///
/// Cancellation rules, in priority order:
/// - `engage()` (the visitor opened the widget) aborts any pending timer and
///   permanently ends the proactive phase for this instance.
/// - `shutdown()` (unmount) aborts any pending timer so nothing can fire
///   into a destroyed instance.
/// - a policy update with `enabled = false` aborts the pending timer; a
///   later re-enable may arm again if the instance was never engaged and the
///   cap is not yet reached.
pub struct ProactiveScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    policy: Mutex<ProactivePolicy>,
    fired: AtomicU32,
    stopped: AtomicBool,
    last_fire_at: Mutex<Option<DateTime<Utc>>>,
    // at most one pending timer task at any instant
    timer: Mutex<Option<JoinHandle<()>>>,
    on_fire: NudgeHandler,
}

impl ProactiveScheduler {
    pub fn new(policy: ProactivePolicy, on_fire: NudgeHandler) -> Self {
        ProactiveScheduler {
            inner: Arc::new(SchedulerInner {
                policy: Mutex::new(policy),
                fired: AtomicU32::new(0),
                stopped: AtomicBool::new(false),
                last_fire_at: Mutex::new(None),
                timer: Mutex::new(None),
                on_fire,
            }),
        }
    }

    /// Start the delay-then-interval cadence. No-op when the policy cannot
    /// fire, the cap is already reached, or the instance was engaged or shut
    /// down. Replaces any previously pending timer.
    pub fn arm(&self) {
        self.cancel_timer();
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        {
            let policy = self.inner.policy.lock().unwrap();
            if !policy.is_active() || self.inner.fired.load(Ordering::SeqCst) >= policy.max_messages
            {
                return;
            }
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let delay = inner.policy.lock().unwrap().delay;
            sleep(Duration::from_secs(delay)).await;
            inner.fire();
            loop {
                let (interval, more) = {
                    let policy = inner.policy.lock().unwrap();
                    (
                        policy.interval,
                        policy.is_active()
                            && inner.fired.load(Ordering::SeqCst) < policy.max_messages,
                    )
                };
                if !more {
                    debug!("proactive cap reached; stopping");
                    break;
                }
                sleep(Duration::from_secs(interval)).await;
                inner.fire();
            }
        });
        *self.inner.timer.lock().unwrap() = Some(handle);
    }

    /// The visitor engaged. Aborts the pending timer and blocks all future
    /// arming for this instance.
    pub fn engage(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            info!("visitor engaged; proactive messaging off for this instance");
        }
        self.cancel_timer();
    }

    /// Instance unmounted. The pending timer is aborted before this returns.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.cancel_timer();
    }

    /// A new policy arrived with a config swap. Disabling cancels the
    /// pending timer; enabling arms one if nothing is pending and the
    /// instance is still eligible. The fired count carries over.
    pub fn update_policy(&self, policy: ProactivePolicy) {
        let active = policy.is_active();
        *self.inner.policy.lock().unwrap() = policy;
        if !active {
            self.cancel_timer();
            return;
        }
        let pending = self
            .inner
            .timer
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        if !pending {
            self.arm();
        }
    }

    pub fn fired_count(&self) -> u32 {
        self.inner.fired.load(Ordering::SeqCst)
    }

    pub fn last_fire_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_fire_at.lock().unwrap()
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.inner.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl SchedulerInner {
    fn fire(&self) {
        let message = {
            let policy = self.policy.lock().unwrap();
            if !policy.is_active() {
                return;
            }
            let n = self.fired.load(Ordering::SeqCst);
            if n >= policy.max_messages {
                return;
            }
            policy.messages[n as usize % policy.messages.len()].clone()
        };
        self.fired.fetch_add(1, Ordering::SeqCst);
        *self.last_fire_at.lock().unwrap() = Some(Utc::now());
        debug!(fired = self.fired.load(Ordering::SeqCst), "proactive nudge");
        (self.on_fire)(message);
    }
}

impl Drop for ProactiveScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for ProactiveScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProactiveScheduler")
            .field("fired", &self.fired_count())
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

//! Activity tracking for auto-pause.
//!
//! Both auto-pause triggers are policies. With the defaults neither fires and
//! the monitor only records activity.

use qaconf::IdleConfig;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub struct IdleMonitor {
    policy: IdleConfig,
    last_activity: Mutex<Instant>,
}

impl IdleMonitor {
    pub fn new(policy: IdleConfig) -> Self {
        Self {
            policy,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn policy(&self) -> &IdleConfig {
        &self.policy
    }

    /// Record user activity.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    pub fn watches_idle(&self) -> bool {
        self.policy.auto_pause_on_idle
    }

    pub fn pauses_on_tab_switch(&self) -> bool {
        self.policy.auto_pause_on_tab_switch
    }

    /// True when the idle policy is on and the threshold has passed.
    pub fn should_auto_pause(&self) -> bool {
        self.policy.auto_pause_on_idle && self.idle_for() > self.policy.idle_timeout()
    }
}

//! Mock transport for driver tests
//!
//! Provides:
//! - Scripted replies, matched on exact command text
//! - Controllable failure injection
//! - Call logging for verifying the exact command sequence a driver sends

use super::Transport;
use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Script {
    // Queued replies are consumed first; sticky replies answer forever.
    queued: HashMap<String, VecDeque<String>>,
    sticky: HashMap<String, String>,
}

/// Mock transport for testing drivers
///
/// Clones share state, so a test can keep a handle for inspection after
/// moving a clone into the driver.
#[derive(Clone, Default)]
pub struct MockTransport {
    should_fail_next: Arc<AtomicBool>,
    call_log: Arc<Mutex<Vec<String>>>,
    script: Arc<Mutex<Script>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with `reply` every time it is queried.
    pub fn reply(&self, command: &str, reply: &str) -> &Self {
        lock(&self.script)
            .sticky
            .insert(command.to_string(), reply.to_string());
        self
    }

    /// Answer the next query of `command` with `reply`, ahead of any sticky reply.
    pub fn queue_reply(&self, command: &str, reply: &str) -> &Self {
        lock(&self.script)
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
        self
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> CalResult<()> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(CalError::transport("mock", "Injected failure"));
        }
        Ok(())
    }

    /// Every command written or queried, in order.
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    pub fn clear_log(&self) {
        lock(&self.call_log).clear();
    }

    fn log_call(&self, call: &str) {
        lock(&self.call_log).push(call.to_string());
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn resource(&self) -> &str {
        "mock"
    }

    async fn write(&self, command: &str) -> CalResult<()> {
        self.log_call(command);
        self.check_failure()
    }

    async fn query(&self, command: &str) -> CalResult<String> {
        self.log_call(command);
        self.check_failure()?;
        let mut script = lock(&self.script);
        if let Some(reply) = script.queued.get_mut(command).and_then(VecDeque::pop_front) {
            return Ok(reply);
        }
        script
            .sticky
            .get(command)
            .cloned()
            .ok_or_else(|| CalError::Timeout(format!("mock reply to '{}'", command)))
    }
}

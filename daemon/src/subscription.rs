/// Lifecycle of the subscription to an OS process-creation event source.
///
/// Acquisition runs through a fixed sequence of [`Step`]s. If a step fails,
/// every step acquired before it is released in reverse order and startup is
/// aborted. Teardown releases all acquired steps in reverse order, which
/// cancels the subscription before anything it depends on goes away. A
/// failing release is logged and the remaining steps are still released.
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

/// Acquisition stages, in the order they are acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Event subsystem runtime (COM on Windows).
    Runtime,
    /// Locator used to reach the event namespace.
    Locator,
    /// Connection to the event namespace.
    Connection,
    /// Authentication and impersonation settings on the connection.
    Security,
    /// Delivery stub wrapping the notification channel.
    Stub,
    /// The live creation-event subscription. Releasing it cancels delivery.
    Subscription,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::Runtime,
        Step::Locator,
        Step::Connection,
        Step::Security,
        Step::Stub,
        Step::Subscription,
    ];
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Runtime => "initialize the event runtime",
            Step::Locator => "create the event locator",
            Step::Connection => "connect to the event namespace",
            Step::Security => "set connection security",
            Step::Stub => "create the notification stub",
            Step::Subscription => "subscribe to process creation events",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("Failed to {step}: {cause:#}")]
pub struct StartupError {
    pub step: Step,
    pub cause: anyhow::Error,
}

/// A producer of creation notifications with staged acquisition.
///
/// Implementations deliver batches through the channel they were built with.
pub trait EventBackend {
    fn acquire(&mut self, step: Step) -> anyhow::Result<()>;
    /// Releases a previously acquired step. Only called for acquired steps,
    /// in reverse acquisition order.
    fn release(&mut self, step: Step) -> anyhow::Result<()>;
}

pub struct SubscriptionManager {
    backend: Box<dyn EventBackend>,
    acquired: Vec<Step>,
}

impl SubscriptionManager {
    /// Acquires every step in order. On failure nothing stays acquired.
    pub fn start(mut backend: Box<dyn EventBackend>) -> Result<Self, StartupError> {
        let mut acquired = Vec::with_capacity(Step::ALL.len());
        for step in Step::ALL {
            if let Err(cause) = backend.acquire(step) {
                release_all(backend.as_mut(), &mut acquired);
                return Err(StartupError { step, cause });
            }
            debug!("acquired: {step}");
            acquired.push(step);
        }
        Ok(Self { backend, acquired })
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.acquired.contains(&Step::Subscription)
    }

    /// Cancels the subscription and releases everything in reverse order.
    /// Returns the number of steps whose release failed. Idempotent.
    pub fn teardown(&mut self) -> usize {
        release_all(self.backend.as_mut(), &mut self.acquired)
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if !self.acquired.is_empty() {
            self.teardown();
        }
    }
}

fn release_all(backend: &mut dyn EventBackend, acquired: &mut Vec<Step>) -> usize {
    let mut failures = 0;
    while let Some(step) = acquired.pop() {
        match backend.release(step) {
            Ok(()) => debug!("released: {step}"),
            Err(e) => {
                warn!("teardown: release after \"{step}\" failed: {e:#}");
                failures += 1;
            }
        }
    }
    failures
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{Arc, Mutex};

    use anyhow::bail;

    use super::{EventBackend, Step};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Acquire(Step),
        Release(Step),
    }

    /// Records every call; can be told to fail one acquire and/or one release.
    #[derive(Debug, Default, Clone)]
    pub struct FakeBackend {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub fail_acquire: Option<Step>,
        pub fail_release: Option<Step>,
    }

    impl FakeBackend {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EventBackend for FakeBackend {
        fn acquire(&mut self, step: Step) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Acquire(step));
            if self.fail_acquire == Some(step) {
                bail!("simulated failure");
            }
            Ok(())
        }

        fn release(&mut self, step: Step) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Release(step));
            if self.fail_release == Some(step) {
                bail!("simulated release failure");
            }
            Ok(())
        }
    }
}

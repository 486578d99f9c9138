/// A single "a process with this identifier was just created" notification.
///
/// Only lives for the duration of one [`EventSink::indicate`] call.
///
/// [`EventSink::indicate`]: crate::sink::EventSink::indicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationNotification {
    pub pid: u32,
}

impl CreationNotification {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

/// One delivery of creation events from an event backend to the sink.
pub type NotificationBatch = Vec<CreationNotification>;

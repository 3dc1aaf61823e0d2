//! Flow control
//!
//! Two independent axes per channel: reading (paused stops frame intake and
//! freezes pending exchanges) and writing (paused blocks `write` until
//! resumed). Closing the channel releases blocked writers.

use tokio::sync::watch;

/// Flow-control state of one channel
#[derive(Debug)]
pub struct FlowControl {
    read_paused: watch::Sender<bool>,
    write_paused: watch::Sender<bool>,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControl {
    /// Both axes open
    pub fn new() -> Self {
        let (read_paused, _) = watch::channel(false);
        let (write_paused, _) = watch::channel(false);
        Self {
            read_paused,
            write_paused,
        }
    }

    /// Stop taking frames off the wire
    pub fn pause_reading(&self) {
        self.read_paused.send_if_modified(|paused| !std::mem::replace(paused, true));
    }

    /// Resume taking frames off the wire
    pub fn resume_reading(&self) {
        self.read_paused.send_if_modified(|paused| std::mem::replace(paused, false));
    }

    /// Block writers
    pub fn pause_writing(&self) {
        self.write_paused.send_if_modified(|paused| !std::mem::replace(paused, true));
    }

    /// Release writers
    pub fn resume_writing(&self) {
        self.write_paused.send_if_modified(|paused| std::mem::replace(paused, false));
    }

    /// Whether reading is paused
    pub fn is_read_paused(&self) -> bool {
        *self.read_paused.borrow()
    }

    /// Whether writing is paused
    pub fn is_write_paused(&self) -> bool {
        *self.write_paused.borrow()
    }

    /// Watch the read axis
    pub fn subscribe_read(&self) -> watch::Receiver<bool> {
        self.read_paused.subscribe()
    }

    /// Wait until reading is not paused
    pub async fn readable(&self) {
        let mut rx = self.read_paused.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    /// Wait until writing is not paused
    pub async fn writable(&self) {
        let mut rx = self.write_paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

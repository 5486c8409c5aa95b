//! User-facing log feed
//!
//! Lines pushed here are kept in a bounded ring buffer for late observers and
//! broadcast live to any number of subscribers. Every line is mirrored to the
//! `log` facade at info level.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use tokio::sync::broadcast;

/// Default number of lines retained by a [LogSink]
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Cloneable handle to a shared log feed
#[derive(Clone, Debug)]
pub struct LogSink {
    ring: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    sender: broadcast::Sender<String>,
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        LogSink {
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            sender,
        }
    }

    /// Append one line, dropping the oldest if the buffer is full
    pub fn push<S: Into<String>>(&self, line: S) {
        let line = line.into();
        log::info!("{}", line);
        if let Ok(mut ring) = self.ring.lock() {
            while ring.len() >= self.capacity {
                ring.pop_front();
            }
            ring.push_back(line.clone());
        }
        // no receivers is fine
        let _ = self.sender.send(line);
    }

    /// Receive lines pushed after this call
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Copy of the retained lines, oldest first
    pub fn lines(&self) -> Vec<String> {
        match self.ring.lock() {
            Ok(ring) => ring.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.clear();
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        LogSink::new(DEFAULT_LOG_CAPACITY)
    }
}

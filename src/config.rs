// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_UPDATE_BUFFER: usize = 64;

/// Per-session tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of updates a subscription may have queued. A subscriber that
    /// falls further behind has its subscription ended.
    pub update_buffer: usize,
    /// How long [`Session::call`](crate::client::Session::call) waits for a
    /// reply. `None` waits until the session closes.
    pub request_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            update_buffer: DEFAULT_UPDATE_BUFFER,
            request_timeout: None,
        }
    }
}

impl SessionConfig {
    pub fn with_update_buffer(mut self, update_buffer: usize) -> Self {
        // a zero capacity channel can't be created
        self.update_buffer = update_buffer.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

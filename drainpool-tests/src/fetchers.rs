// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use drainpool::download::Fetch;

/// Serves fixed bodies after a delay. Unknown URLs fail like a 404.
#[derive(Debug, Clone, Default)]
pub struct SlowFetcher {
    delay: Duration,
    bodies: HashMap<String, Vec<u8>>,
    calls: Arc<AtomicUsize>,
}

impl SlowFetcher {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn with_body(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.bodies.insert(url.to_string(), body.into());
        self
    }

    /// Shared across clones, so it can be read after the fetcher moved into
    /// a pool.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Fetch for SlowFetcher {
    fn open(&self, url: &str) -> anyhow::Result<Box<dyn Read + Send>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        let body = self
            .bodies
            .get(url)
            .ok_or_else(|| anyhow!("404 not found: {url}"))?;
        Ok(Box::new(Cursor::new(body.clone())))
    }
}

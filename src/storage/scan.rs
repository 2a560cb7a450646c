use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{StorageError, StorageResult};

/// Pagination and cancellation controls for long scans.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Rows fetched per page.
    pub page_size: u32,
    /// Cooperative cancellation, checked between pages.
    pub cancel: Option<CancellationToken>,
    /// Wall-clock budget for the whole scan.
    pub timeout: Option<Duration>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            page_size: 500,
            cancel: None,
            timeout: None,
        }
    }
}

impl ScanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Page size, never zero.
    pub fn page_size(&self) -> u32 {
        self.page_size.max(1)
    }

    /// Fail with [`StorageError::Cancelled`] if the caller cancelled or the
    /// time budget is spent.
    pub fn check(&self, started: Instant, processed: u64) -> StorageResult<()> {
        let cancelled = self
            .cancel
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false);
        let timed_out = self
            .timeout
            .map(|limit| started.elapsed() >= limit)
            .unwrap_or(false);

        if cancelled || timed_out {
            Err(StorageError::Cancelled { processed })
        } else {
            Ok(())
        }
    }
}

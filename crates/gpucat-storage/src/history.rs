use std::sync::Arc;

use chrono::Duration;
use gpucat_core::{Clock, PricePoint, SystemClock, HISTORY_RETENTION_DAYS};
use tracing::debug;

use crate::{PriceHistoryStore, StoreError};

/// Windowed price-history reads: the last `window` of samples for one stable key.
#[derive(Clone)]
pub struct HistoryReader {
    history: Arc<dyn PriceHistoryStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl HistoryReader {
    pub fn new(history: Arc<dyn PriceHistoryStore>) -> Self {
        Self {
            history,
            clock: Arc::new(SystemClock),
            window: Duration::days(HISTORY_RETENTION_DAYS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Points observed within the window, oldest first. A blank key has no series.
    pub async fn get_series(&self, stable_key: &str) -> Result<Vec<PricePoint>, StoreError> {
        let stable_key = stable_key.trim();
        if stable_key.is_empty() {
            return Ok(Vec::new());
        }
        let since = self.clock.now() - self.window;
        let points = self.history.series(stable_key, since).await?;
        debug!(stable_key, points = points.len(), "price history read");
        Ok(points)
    }
}

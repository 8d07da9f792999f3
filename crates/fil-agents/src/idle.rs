use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use fil_bus::{EventBus, EventFilter};

/// Per-project activity watermarks.
///
/// Every bus event carrying a project id advances that project's
/// watermark; idle motivation rules compare the elapsed time against
/// their `idle_for` parameter.
pub struct IdleDetector {
    watermarks: DashMap<Uuid, DateTime<Utc>>,
}

impl IdleDetector {
    pub fn new() -> Self {
        Self {
            watermarks: DashMap::new(),
        }
    }

    /// Record activity for a project.
    pub fn touch(&self, project_id: Uuid) {
        self.watermarks.insert(project_id, Utc::now());
    }

    /// How long the project has been quiet; `None` when it was never seen.
    pub fn idle_for(&self, project_id: Uuid) -> Option<Duration> {
        self.watermarks.get(&project_id).map(|seen| {
            (Utc::now() - *seen.value())
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// `true` when the project has been seen and quiet for at least
    /// `threshold`.
    pub fn is_idle(&self, project_id: Uuid, threshold: Duration) -> bool {
        self.idle_for(project_id)
            .map(|idle| idle >= threshold)
            .unwrap_or(false)
    }

    /// Follow the bus, advancing watermarks as project events arrive.
    /// Runs until the bus drops the subscription.
    pub fn start(self: &Arc<Self>, bus: &EventBus) {
        let detector = Arc::clone(self);
        let subscription = bus.subscribe(EventFilter::all());
        tokio::spawn(async move {
            while let Ok(event) = subscription.receiver.recv_async().await {
                if let Some(project_id) = event.project_id {
                    detector.touch(project_id);
                }
            }
        });
    }
}

impl Default for IdleDetector {
    fn default() -> Self {
        Self::new()
    }
}

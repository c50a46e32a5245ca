//! Turns debounced recognitions into clock-in / clock-out punches.

use chrono::Utc;
use std::time::Duration;
use timeclock_core::{DetectionStatus, Disposition, Identity, RecognitionSink};
use timeclock_store::{PunchKind, Store};

pub struct PunchRecorder {
    store: Store,
    min_interval: Duration,
}

impl PunchRecorder {
    pub fn new(store: Store, min_interval: Duration) -> Self {
        Self {
            store,
            min_interval,
        }
    }
}

impl RecognitionSink for PunchRecorder {
    async fn on_identity_recognized(&self, identity: &Identity, distance: f32) -> Disposition {
        let now = Utc::now();
        let last = match self.store.last_punch(&identity.id).await {
            Ok(last) => last,
            Err(e) => {
                tracing::error!(
                    employee = %identity.id,
                    error = %e,
                    "failed to read punch history"
                );
                return Disposition::Hold;
            }
        };

        if let Some(last) = &last {
            // a punch stamped in the future (clock moved back) also counts as too recent
            let too_soon = (now - last.at)
                .to_std()
                .map_or(true, |elapsed| elapsed < self.min_interval);
            if too_soon {
                tracing::debug!(
                    employee = %identity.id,
                    last = %last.at,
                    "recognized again within the punch interval, nothing recorded"
                );
                return Disposition::Hold;
            }
        }

        let kind = PunchKind::next_after(last.as_ref(), now);
        match self.store.record_punch(&identity.id, kind, now).await {
            Ok(punch) => {
                tracing::info!(
                    employee = %identity.id,
                    name = %identity.display_name,
                    kind = %punch.kind,
                    distance,
                    "punch recorded"
                );
                Disposition::Consume
            }
            Err(e) => {
                tracing::error!(
                    employee = %identity.id,
                    %kind,
                    error = %e,
                    "failed to record punch"
                );
                Disposition::Hold
            }
        }
    }

    fn on_status(&self, status: &DetectionStatus) {
        match status {
            DetectionStatus::Recognized { display_name, .. } => {
                tracing::info!(name = %display_name, "recognized")
            }
            DetectionStatus::NotRecognized => tracing::info!("not recognized"),
            DetectionStatus::CameraUnavailable => tracing::warn!("camera not available"),
            DetectionStatus::ModelNotReady => tracing::warn!("face models not ready"),
            DetectionStatus::ExtractionStalled => tracing::warn!("face extraction stalled"),
            other => tracing::debug!(status = ?other, "detection status"),
        }
    }
}

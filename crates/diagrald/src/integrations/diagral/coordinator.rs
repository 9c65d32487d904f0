//! Periodic and on-demand polling of the Diagral cloud.
//!
//! One [`Coordinator`] task owns the fetch loop. Everyone else holds a
//! [`CoordinatorHandle`] to read the latest snapshot, wait for new ones, or
//! ask for an early refresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use diagral_client::AlarmConfiguration;
use diagral_client::Anomalies;
use diagral_client::DeviceInfos;
use diagral_client::DiagralApi;
use diagral_client::DiagralError;
use diagral_client::SystemStatus;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Everything fetched in one refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorData {
    pub configuration: AlarmConfiguration,
    pub devices: DeviceInfos,
    pub status: SystemStatus,
    pub anomalies: Anomalies,
    pub updated_at: DateTime<Utc>,
}

impl CoordinatorData {
    pub fn serial(&self) -> &str {
        &self.configuration.alarm.central.serial
    }
}

#[derive(Debug, thiserror::Error)]
#[error("error communicating with the Diagral cloud: {0}")]
pub struct UpdateFailed(#[from] pub DiagralError);

type DataSender = watch::Sender<Option<Arc<CoordinatorData>>>;

pub struct Coordinator {
    name: String,
    api: Arc<dyn DiagralApi>,
    interval: Duration,
    data: Arc<DataSender>,
    refresh_rx: mpsc::Receiver<()>,
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    data: Arc<DataSender>,
    refresh_tx: mpsc::Sender<()>,
}

impl Coordinator {
    pub fn new(
        name: impl Into<String>,
        api: Arc<dyn DiagralApi>,
        interval: Duration,
    ) -> (Self, CoordinatorHandle) {
        let (data, _) = watch::channel(None);
        let data = Arc::new(data);
        // One slot: requests made while one is pending collapse into it
        let (refresh_tx, refresh_rx) = mpsc::channel(1);

        let coordinator = Self {
            name: name.into(),
            api,
            interval,
            data: data.clone(),
            refresh_rx,
        };
        (coordinator, CoordinatorHandle { data, refresh_tx })
    }

    /// Fetch everything once and publish the result.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<CoordinatorData>, UpdateFailed> {
        debug!("[{}] Refreshing", self.name);

        let configuration = self.api.get_configuration().await?;
        let devices = self.api.get_devices_info().await?;
        let status = self.api.get_system_status().await?;
        let anomalies = self.api.get_anomalies().await?;

        let data = Arc::new(CoordinatorData {
            configuration,
            devices,
            status,
            anomalies,
            updated_at: Utc::now(),
        });
        self.data.send_replace(Some(data.clone()));
        Ok(data)
    }

    /// Refresh every interval and whenever a handle asks, until every handle is gone.
    pub async fn run(mut self) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                request = self.refresh_rx.recv() => {
                    if request.is_none() {
                        break;
                    }
                    ticker.reset();
                }
            }

            if let Err(e) = self.refresh().await {
                warn!("[{}] Update failed, keeping previous data: {}", self.name, e);
            }
        }

        info!("[{}] Coordinator stopped", self.name);
    }

    /// Consume a pending refresh request, if any.
    #[cfg(test)]
    pub fn take_refresh_request(&mut self) -> bool {
        self.refresh_rx.try_recv().is_ok()
    }
}

impl CoordinatorHandle {
    /// Latest snapshot, if a refresh ever succeeded.
    pub fn data(&self) -> Option<Arc<CoordinatorData>> {
        self.data.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<CoordinatorData>>> {
        self.data.subscribe()
    }

    /// Ask for a refresh soon; coalesces with one already pending.
    pub fn request_refresh(&self) {
        match self.refresh_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => {
                debug!("Refresh requested after coordinator stopped");
            }
        }
    }

    /// Publish a status returned by a command without waiting for the next poll.
    pub fn apply_status(&self, status: SystemStatus) {
        self.data.send_if_modified(|data| match data {
            Some(current) if current.status != status => {
                let mut updated = CoordinatorData::clone(current);
                updated.status = status;
                updated.updated_at = Utc::now();
                *data = Some(Arc::new(updated));
                true
            }
            _ => false,
        });
    }
}

//! Gateway uploader: opportunistic sync of the message log to the
//! HTTP collector.
//!
//! Reachability edges drive the uploader. On offline→online the event
//! loop starts the 30 s sync timer and triggers one immediate sync; on
//! online→offline it cancels the timer. Either edge, and every
//! broadcast tick while online, puts a `gatewayStatus` message into
//! the mesh with `isGateway` equal to the active state.
//!
//! A sync uploads every stored message whose id is not in the
//! persisted synced set as a single POST. The set grows only on a 2xx
//! response, so a failed upload retries the identical batch next tick
//! — the collector dedups by id, making re-delivery safe.

use std::sync::Arc;
use std::time::Duration;

use pigeon_protocol::{codec, GatewayStatus, MeshEnvelope, Payload};
use pigeon_storage::{MessageLog, UploaderStore};
use pigeon_types::{
    DeviceId, MeshEvent, MessageId, PigeonError, Result, Timestamp, UploadStatus,
};

/// HTTP timeout for collector uploads.
const UPLOAD_TIMEOUT_SECS: u64 = 15;

// ---------------------------------------------------------------------------
// ReachabilityEdge
// ---------------------------------------------------------------------------

/// A change in Internet reachability.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReachabilityEdge {
    /// Offline → online: activate, sync immediately, start timers.
    Rising,
    /// Online → offline: deactivate, cancel timers.
    Falling,
}

// ---------------------------------------------------------------------------
// GatewayUploader
// ---------------------------------------------------------------------------

/// Uploads accumulated messages to the collector while online.
pub struct GatewayUploader {
    device_id: DeviceId,
    device_name: String,
    endpoint: Option<String>,
    client: reqwest::Client,
    log: Arc<MessageLog>,
    store: Arc<UploaderStore>,
    online: bool,
    status: UploadStatus,
    last_sync: Option<Timestamp>,
}

impl GatewayUploader {
    /// Creates an inactive uploader.
    ///
    /// # Errors
    ///
    /// Returns [`PigeonError::UploadError`] if the HTTP client cannot
    /// be built.
    pub fn new(
        device_id: DeviceId,
        device_name: impl Into<String>,
        endpoint: Option<String>,
        log: Arc<MessageLog>,
        store: Arc<UploaderStore>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .build()
            .map_err(|e| PigeonError::UploadError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            device_id,
            device_name: device_name.into(),
            endpoint,
            client,
            log,
            store,
            online: false,
            status: UploadStatus::Idle,
            last_sync: None,
        })
    }

    /// Whether the uploader is currently acting as a gateway.
    pub fn is_active(&self) -> bool {
        self.online
    }

    /// Current upload status.
    pub fn status(&self) -> &UploadStatus {
        &self.status
    }

    /// When the last successful sync completed.
    pub fn last_sync(&self) -> Option<&Timestamp> {
        self.last_sync.as_ref()
    }

    /// Number of ids the collector has acknowledged.
    pub fn synced_count(&self) -> u64 {
        self.store.synced_count().unwrap_or(0) as u64
    }

    /// Overrides the collector endpoint and persists it.
    pub fn set_endpoint(&mut self, url: &str) -> Result<()> {
        self.store.set_endpoint(url)?;
        self.endpoint = Some(url.to_string());
        Ok(())
    }

    /// Applies a display-name change; future uploads and
    /// advertisements carry it.
    pub fn set_device_name(&mut self, name: impl Into<String>) {
        self.device_name = name.into();
    }

    /// Applies a reachability reading; returns the edge if the state
    /// changed.
    pub fn set_online(&mut self, online: bool) -> Option<ReachabilityEdge> {
        if online == self.online {
            return None;
        }
        self.online = online;
        if online {
            tracing::info!("reachability gained — activating gateway uploader");
            Some(ReachabilityEdge::Rising)
        } else {
            tracing::info!("reachability lost — deactivating gateway uploader");
            Some(ReachabilityEdge::Falling)
        }
    }

    /// Builds the `gatewayStatus` payload advertising the current
    /// state into the mesh.
    pub fn advertisement(&self) -> Payload {
        Payload::GatewayStatus(GatewayStatus {
            is_gateway: self.online,
            gateway_device_id: self.device_id,
            gateway_device_name: self.device_name.clone(),
            synced_count: Some(self.synced_count()),
        })
    }

    /// Forgets every acknowledged id, making the whole log eligible
    /// for upload again. Used after collector-side data loss.
    pub fn force_sync_all(&mut self) -> Result<()> {
        self.store.clear_synced()
    }

    /// Runs one sync tick. Returns status-change events for the
    /// hosting application, in order.
    pub async fn sync(&mut self, now: &Timestamp) -> Vec<MeshEvent> {
        let mut events = Vec::new();

        let Some(endpoint) = self.endpoint.clone() else {
            tracing::debug!("no collector endpoint configured — skipping sync");
            return events;
        };

        let unsynced = match self.unsynced() {
            Ok(unsynced) => unsynced,
            Err(e) => {
                tracing::error!(%e, "failed to read unsynced messages");
                return events;
            }
        };
        if unsynced.is_empty() {
            self.transition(UploadStatus::Idle, &mut events);
            return events;
        }

        self.transition(UploadStatus::Syncing, &mut events);
        let ids: Vec<MessageId> = unsynced.iter().map(|m| m.id).collect();

        match self.upload(&endpoint, &unsynced, now).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_synced(&ids) {
                    tracing::error!(%e, "failed to record synced ids");
                }
                self.last_sync = Some(now.clone());
                tracing::info!(count = ids.len(), "collector sync succeeded");
                self.transition(UploadStatus::Success(ids.len()), &mut events);
            }
            Err(e) => {
                tracing::info!(%e, "collector sync failed — will retry next tick");
                self.transition(UploadStatus::Failed(e.to_string()), &mut events);
            }
        }

        events
    }

    // -----------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------

    fn unsynced(&self) -> Result<Vec<MeshEnvelope>> {
        Ok(self
            .log
            .all()?
            .into_iter()
            .filter(|m| !self.store.is_synced(&m.id).unwrap_or(false))
            .collect())
    }

    /// POSTs one batch to the collector. Success is any 2xx; the
    /// response body is not parsed.
    async fn upload(
        &self,
        endpoint: &str,
        messages: &[MeshEnvelope],
        now: &Timestamp,
    ) -> Result<()> {
        let mut encoded = Vec::with_capacity(messages.len());
        for message in messages {
            encoded.push(codec::envelope_to_value(message)?);
        }

        let body = serde_json::json!({
            "deviceId": self.device_id,
            "deviceName": self.device_name,
            "timestamp": now.as_str(),
            "messages": encoded,
        });

        let response = self
            .client
            .post(endpoint)
            .header("X-Device-ID", self.device_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| PigeonError::UploadError {
                reason: format!("upload request failed: {e}"),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(PigeonError::UploadError {
                reason: format!("collector returned HTTP {status}"),
            })
        }
    }

    fn transition(&mut self, status: UploadStatus, events: &mut Vec<MeshEvent>) {
        if self.status != status {
            self.status = status.clone();
            events.push(MeshEvent::UploadStatusChanged { status });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pigeon_protocol::{BroadcastNotice, MeshEnvelope};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn device(b: u8) -> DeviceId {
        DeviceId::new([b; 16])
    }

    fn stores() -> (Arc<MessageLog>, Arc<UploaderStore>) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let log = MessageLog::load(db.open_tree("messages").unwrap(), 500).unwrap();
        let store = UploaderStore::load(db.open_tree("uploader").unwrap()).unwrap();
        (Arc::new(log), Arc::new(store))
    }

    fn broadcast(n: u8) -> MeshEnvelope {
        MeshEnvelope::originate(
            device(n),
            format!("node-{n}"),
            Payload::Broadcast(BroadcastNotice {
                title: format!("notice {n}"),
                message: "body".into(),
                priority: None,
                latitude: None,
                longitude: None,
            }),
            None,
        )
    }

    fn uploader(
        endpoint: String,
        log: Arc<MessageLog>,
        store: Arc<UploaderStore>,
    ) -> GatewayUploader {
        GatewayUploader::new(device(9), "node-9", Some(endpoint), log, store).unwrap()
    }

    async fn mount_status(server: &MockServer, status: u16) {
        Mock::given(method("POST"))
            .and(path("/api/messages"))
            .respond_with(ResponseTemplate::new(status))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn reachability_edges() {
        let (log, store) = stores();
        let mut uploader = uploader("http://unused.invalid".into(), log, store);

        assert!(!uploader.is_active());
        assert_eq!(uploader.set_online(true), Some(ReachabilityEdge::Rising));
        assert!(uploader.is_active());
        assert_eq!(uploader.set_online(true), None);
        assert_eq!(uploader.set_online(false), Some(ReachabilityEdge::Falling));
        assert!(!uploader.is_active());
    }

    #[tokio::test]
    async fn advertisement_reflects_state() {
        let (log, store) = stores();
        let mut uploader = uploader("http://unused.invalid".into(), log, store);
        uploader.set_online(true);

        match uploader.advertisement() {
            Payload::GatewayStatus(status) => {
                assert!(status.is_gateway);
                assert_eq!(status.gateway_device_id, device(9));
                assert_eq!(status.synced_count, Some(0));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_sync_commits_ids() {
        let server = MockServer::start().await;
        mount_status(&server, 200).await;

        let (log, store) = stores();
        for n in 1..=5 {
            log.admit(&broadcast(n)).unwrap();
        }

        let mut uploader = uploader(
            format!("{}/api/messages", server.uri()),
            log.clone(),
            store.clone(),
        );
        let now = Timestamp::now();
        let events = uploader.sync(&now).await;

        assert_eq!(uploader.status(), &UploadStatus::Success(5));
        assert!(uploader.last_sync().is_some());
        assert_eq!(store.synced_count().unwrap(), 5);
        assert!(events
            .iter()
            .any(|e| matches!(e, MeshEvent::UploadStatusChanged { status: UploadStatus::Syncing })));

        // Request carried the device header and the full batch.
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["deviceId"], device(9).to_string());
        assert_eq!(body["messages"].as_array().unwrap().len(), 5);
        assert!(requests[0].headers.get("X-Device-ID").is_some());
    }

    #[tokio::test]
    async fn failed_sync_leaves_ids_and_retries() {
        let server = MockServer::start().await;
        mount_status(&server, 200).await;

        let (log, store) = stores();
        for n in 1..=5 {
            log.admit(&broadcast(n)).unwrap();
        }
        let mut uploader = uploader(
            format!("{}/api/messages", server.uri()),
            log.clone(),
            store.clone(),
        );
        let now = Timestamp::now();
        uploader.sync(&now).await;
        assert_eq!(store.synced_count().unwrap(), 5);

        // Collector starts failing; three new messages arrive.
        server.reset().await;
        mount_status(&server, 500).await;
        for n in 6..=8 {
            log.admit(&broadcast(n)).unwrap();
        }
        uploader.sync(&now).await;
        assert!(matches!(uploader.status(), UploadStatus::Failed(_)));
        assert_eq!(store.synced_count().unwrap(), 5);

        // Collector recovers; the same three are retried and land.
        server.reset().await;
        mount_status(&server, 200).await;
        uploader.sync(&now).await;
        assert_eq!(uploader.status(), &UploadStatus::Success(3));
        assert_eq!(store.synced_count().unwrap(), 8);
    }

    #[tokio::test]
    async fn empty_log_stays_idle() {
        let server = MockServer::start().await;
        mount_status(&server, 200).await;

        let (log, store) = stores();
        let mut uploader = uploader(format!("{}/api/messages", server.uri()), log, store);
        let events = uploader.sync(&Timestamp::now()).await;

        assert_eq!(uploader.status(), &UploadStatus::Idle);
        assert!(events.is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_sync_all_reuploads_everything() {
        let server = MockServer::start().await;
        mount_status(&server, 200).await;

        let (log, store) = stores();
        for n in 1..=4 {
            log.admit(&broadcast(n)).unwrap();
        }
        let mut uploader = uploader(
            format!("{}/api/messages", server.uri()),
            log.clone(),
            store.clone(),
        );
        let now = Timestamp::now();
        uploader.sync(&now).await;
        assert_eq!(store.synced_count().unwrap(), 4);

        uploader.force_sync_all().unwrap();
        assert_eq!(store.synced_count().unwrap(), 0);

        uploader.sync(&now).await;
        assert_eq!(uploader.status(), &UploadStatus::Success(4));
        assert_eq!(store.synced_count().unwrap(), 4);
    }

    #[tokio::test]
    async fn unreachable_collector_reports_failed() {
        let (log, store) = stores();
        log.admit(&broadcast(1)).unwrap();

        // Reserved TLD — connection fails fast.
        let mut uploader = uploader("http://collector.invalid/api/messages".into(), log, store);
        uploader.sync(&Timestamp::now()).await;

        assert!(matches!(uploader.status(), UploadStatus::Failed(_)));
        assert_eq!(store_count(&uploader), 0);
    }

    fn store_count(uploader: &GatewayUploader) -> usize {
        uploader.store.synced_count().unwrap()
    }
}

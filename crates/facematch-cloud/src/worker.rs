//! Request poll step: face crop in, label or `Unknown` out.

use crate::engine::{EngineError, EngineHandle};
use facematch_core::{EuclideanMatcher, GalleryStore};
use facematch_transport::{
    Delivery, FaceRequest, MatchResponse, SpoolQueue, TransportError, Verdict,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The recognition thread is gone; nothing more can be processed.
    #[error("recognition engine stopped")]
    EngineStopped,
}

/// What happened to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Answered(Verdict),
    /// Unusable message or failed match, acknowledged without a reply.
    Dropped,
}

pub struct CloudWorker {
    requests: SpoolQueue,
    responses: SpoolQueue,
    engine: EngineHandle,
    gallery: Arc<GalleryStore>,
    matcher: EuclideanMatcher,
    batch_size: usize,
}

impl CloudWorker {
    pub fn new(
        requests: SpoolQueue,
        responses: SpoolQueue,
        engine: EngineHandle,
        gallery: Arc<GalleryStore>,
        matcher: EuclideanMatcher,
        batch_size: usize,
    ) -> Self {
        Self {
            requests,
            responses,
            engine,
            gallery,
            matcher,
            batch_size: batch_size.max(1),
        }
    }

    /// Process one batch of requests, returning how many were acknowledged.
    ///
    /// A request whose answer could not be published, or that reached a
    /// stopped engine, stays queued.
    pub async fn poll_once(&self) -> Result<usize, WorkerError> {
        let deliveries = self.requests.receive(self.batch_size)?;
        let mut done = 0;
        for delivery in &deliveries {
            let outcome = self.handle(delivery).await?;
            tracing::debug!(id = %delivery.id, ?outcome, "request handled");
            self.requests.ack(delivery)?;
            done += 1;
        }
        Ok(done)
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, WorkerError> {
        let request = match FaceRequest::parse(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(id = %delivery.id, error = %e, "invalid face request");
                return Ok(Outcome::Dropped);
            }
        };
        let request_id = request.request_id.as_str();

        let face = match request.face_bytes() {
            Ok(face) => face,
            Err(e) => {
                tracing::warn!(request_id, error = %e, "face payload not decodable");
                return Ok(Outcome::Dropped);
            }
        };

        let snapshot = self.gallery.snapshot();
        match self.engine.recognize(face, snapshot, self.matcher).await {
            Ok(id) => {
                let verdict = Verdict::from(id.result);
                let filename = (!request.filename.is_empty()).then(|| request.filename.clone());
                self.responses
                    .send(&MatchResponse::new(request_id, filename, verdict.clone()))?;
                tracing::info!(
                    request_id,
                    result = %verdict,
                    distance = id.nearest.map(|n| n.distance),
                    "recognition result published"
                );
                Ok(Outcome::Answered(verdict))
            }
            Err(EngineError::ChannelClosed) => Err(WorkerError::EngineStopped),
            Err(e) => {
                tracing::error!(request_id, error = %e, "recognition failed");
                Ok(Outcome::Dropped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::testing::{png, MeanColorEmbedder, PanickingEmbedder};
    use facematch_core::{Embedding, FaceEmbedder, Gallery, GalleryEntry};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        worker: CloudWorker,
        store: Arc<GalleryStore>,
        requests: SpoolQueue,
        responses: SpoolQueue,
    }

    fn gallery(labels: [&str; 2]) -> Gallery {
        Gallery::from_entries(
            vec![
                GalleryEntry::new(Embedding::new(vec![1.0, 0.0]), labels[0]),
                GalleryEntry::new(Embedding::new(vec![0.0, 1.0]), labels[1]),
            ],
            None,
        )
        .unwrap()
    }

    fn setup(matcher: EuclideanMatcher) -> Fixture {
        setup_with(MeanColorEmbedder, matcher)
    }

    fn setup_with<E: FaceEmbedder + Send + 'static>(embedder: E, matcher: EuclideanMatcher) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let open = |name: &str| SpoolQueue::open(dir.path().join(name)).unwrap();
        let store = Arc::new(GalleryStore::new(gallery(["Alice", "Bob"])));
        let engine = spawn_engine(embedder).unwrap();
        Fixture {
            worker: CloudWorker::new(open("requests"), open("responses"), engine, Arc::clone(&store), matcher, 4),
            requests: open("requests"),
            responses: open("responses"),
            store,
            _dir: dir,
        }
    }

    fn answers(queue: &SpoolQueue) -> Vec<MatchResponse> {
        queue
            .receive(100)
            .unwrap()
            .iter()
            .map(|d| MatchResponse::parse(&d.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_label_is_published() {
        let f = setup(EuclideanMatcher::nearest());
        f.requests.send(&FaceRequest::new("r1", "test_00.jpg", &png([255, 0, 0]))).unwrap();

        assert_eq!(f.worker.poll_once().await.unwrap(), 1);
        assert!(f.requests.is_empty().unwrap());

        let out = answers(&f.responses);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].request_id, "r1");
        assert_eq!(out[0].filename.as_deref(), Some("test_00.jpg"));
        assert_eq!(out[0].result, Verdict::Label("Alice".into()));
    }

    #[tokio::test]
    async fn test_far_face_is_unknown_in_threshold_mode() {
        let f = setup(EuclideanMatcher::with_max_distance(0.5));
        f.requests.send(&FaceRequest::new("r2", "far.jpg", &png([0, 0, 255]))).unwrap();

        f.worker.poll_once().await.unwrap();
        assert_eq!(answers(&f.responses)[0].result, Verdict::Unknown);
    }

    #[tokio::test]
    async fn test_reloaded_gallery_used_for_next_request() {
        let f = setup(EuclideanMatcher::nearest());
        f.requests.send(&FaceRequest::new("r3", "a.jpg", &png([0, 255, 0]))).unwrap();
        f.worker.poll_once().await.unwrap();

        f.store.replace(gallery(["Carol", "Dave"]));
        f.requests.send(&FaceRequest::new("r4", "b.jpg", &png([0, 255, 0]))).unwrap();
        f.worker.poll_once().await.unwrap();

        let out = answers(&f.responses);
        assert_eq!(out[0].result, Verdict::Label("Bob".into()));
        assert_eq!(out[1].result, Verdict::Label("Dave".into()));
    }

    #[tokio::test]
    async fn test_invalid_requests_are_dropped() {
        let f = setup(EuclideanMatcher::nearest());
        f.requests.send(&json!({ "filename": "x.jpg" })).unwrap();
        f.requests.send(&json!({ "request_id": "r5", "face": "%%%" })).unwrap();
        f.requests.send(&FaceRequest::new("r6", "y.jpg", b"not an image")).unwrap();

        assert_eq!(f.worker.poll_once().await.unwrap(), 3);
        assert!(f.requests.is_empty().unwrap());
        assert!(f.responses.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_dropped() {
        let f = setup(EuclideanMatcher::nearest());
        f.store.replace(
            Gallery::from_entries(
                vec![GalleryEntry::new(Embedding::new(vec![0.0; 128]), "wide")],
                None,
            )
            .unwrap(),
        );
        f.requests.send(&FaceRequest::new("r7", "z.jpg", &png([9, 9, 9]))).unwrap();

        assert_eq!(f.worker.poll_once().await.unwrap(), 1);
        assert!(f.responses.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_stopped_engine_keeps_requests() {
        let f = setup_with(PanickingEmbedder, EuclideanMatcher::nearest());
        for i in 0..3 {
            f.requests
                .send(&FaceRequest::new(format!("r{i}"), "a.jpg", &png([1, 1, 1])))
                .unwrap();
        }

        for _ in 0..2 {
            let err = f.worker.poll_once().await.unwrap_err();
            assert!(matches!(err, WorkerError::EngineStopped));
        }
        assert_eq!(f.requests.len().unwrap(), 3);
        assert!(f.responses.is_empty().unwrap());
    }
}

//! Inbox poll step: image message in, face request or `No-Face` answer out.

use crate::engine::{EngineError, EngineHandle};
use facematch_transport::{
    Delivery, FaceRequest, ImageRequest, MatchResponse, SpoolQueue, TransportError, Verdict,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The detection thread is gone; nothing more can be processed.
    #[error("detection engine stopped")]
    EngineStopped,
}

/// What happened to one inbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Face crop sent to the request queue.
    Forwarded,
    /// `No-Face` sent to the response queue.
    NoFace,
    /// Unusable message, acknowledged without a reply.
    Dropped,
}

pub struct EdgeWorker {
    inbox: SpoolQueue,
    requests: SpoolQueue,
    responses: SpoolQueue,
    engine: EngineHandle,
    batch_size: usize,
}

impl EdgeWorker {
    pub fn new(
        inbox: SpoolQueue,
        requests: SpoolQueue,
        responses: SpoolQueue,
        engine: EngineHandle,
        batch_size: usize,
    ) -> Self {
        Self {
            inbox,
            requests,
            responses,
            engine,
            batch_size: batch_size.max(1),
        }
    }

    /// Process one batch from the inbox, returning how many were acknowledged.
    ///
    /// A message whose result could not be published, or that reached a
    /// stopped engine, stays in the inbox.
    pub async fn poll_once(&self) -> Result<usize, WorkerError> {
        let deliveries = self.inbox.receive(self.batch_size)?;
        let mut done = 0;
        for delivery in &deliveries {
            let outcome = self.handle(delivery).await?;
            tracing::debug!(id = %delivery.id, ?outcome, "inbox message handled");
            self.inbox.ack(delivery)?;
            done += 1;
        }
        Ok(done)
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, WorkerError> {
        let request = match ImageRequest::parse(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(id = %delivery.id, error = %e, "invalid image message");
                return Ok(Outcome::Dropped);
            }
        };
        let request_id = request.request_id.as_str();

        let image = match request.image_bytes() {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(request_id, error = %e, "image payload not decodable");
                return Ok(Outcome::Dropped);
            }
        };

        match self.engine.detect(image).await {
            Ok(Some(face)) => {
                self.requests
                    .send(&FaceRequest::new(request_id, &request.filename, &face.jpeg))?;
                tracing::info!(
                    request_id,
                    filename = %request.filename,
                    confidence = face.confidence,
                    "face detected, forwarded to request queue"
                );
                Ok(Outcome::Forwarded)
            }
            Ok(None) => {
                self.responses.send(&MatchResponse::new(
                    request_id,
                    Some(request.filename.clone()),
                    Verdict::NoFace,
                ))?;
                tracing::info!(request_id, filename = %request.filename, "no face detected");
                Ok(Outcome::NoFace)
            }
            Err(EngineError::ChannelClosed) => Err(WorkerError::EngineStopped),
            Err(e) => {
                tracing::error!(request_id, error = %e, "detection failed");
                Ok(Outcome::Dropped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::testing::{png, PanickingDetector, StubDetector};
    use facematch_core::FaceDetector;
    use serde_json::json;
    use tempfile::TempDir;

    struct Queues {
        _dir: TempDir,
        worker: EdgeWorker,
        inbox: SpoolQueue,
        requests: SpoolQueue,
        responses: SpoolQueue,
    }

    fn setup<D: FaceDetector + Send + 'static>(detector: D) -> Queues {
        let dir = tempfile::tempdir().unwrap();
        let open = |name: &str| SpoolQueue::open(dir.path().join(name)).unwrap();
        let engine = spawn_engine(detector).unwrap();
        Queues {
            worker: EdgeWorker::new(open("inbox"), open("requests"), open("responses"), engine, 4),
            inbox: open("inbox"),
            requests: open("requests"),
            responses: open("responses"),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_face_is_forwarded() {
        let q = setup(StubDetector { min_width: 16 });
        q.inbox.send(&ImageRequest::new(&png(32, 32), "r1", "test_00.jpg")).unwrap();

        assert_eq!(q.worker.poll_once().await.unwrap(), 1);
        assert!(q.inbox.is_empty().unwrap());
        assert!(q.responses.is_empty().unwrap());

        let forwarded = q.requests.receive(10).unwrap();
        assert_eq!(forwarded.len(), 1);
        let msg = FaceRequest::parse(&forwarded[0].body).unwrap();
        assert_eq!(msg.request_id, "r1");
        assert_eq!(msg.filename, "test_00.jpg");
        assert_eq!(&msg.face_bytes().unwrap()[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_no_face_answers_directly() {
        let q = setup(StubDetector { min_width: 64 });
        q.inbox.send(&ImageRequest::new(&png(32, 32), "r2", "empty.jpg")).unwrap();

        q.worker.poll_once().await.unwrap();
        assert!(q.requests.is_empty().unwrap());

        let answers = q.responses.receive(10).unwrap();
        let msg = MatchResponse::parse(&answers[0].body).unwrap();
        assert_eq!(msg.request_id, "r2");
        assert_eq!(msg.result, Verdict::NoFace);
    }

    #[tokio::test]
    async fn test_invalid_messages_are_dropped() {
        let q = setup(StubDetector { min_width: 1 });
        q.inbox.send(&json!({ "request_id": "r3" })).unwrap();
        q.inbox.send(&json!({ "encoded": "@@", "request_id": "r4", "filename": "x.jpg" })).unwrap();
        q.inbox
            .send(&ImageRequest::new(b"not an image", "r5", "y.jpg"))
            .unwrap();

        assert_eq!(q.worker.poll_once().await.unwrap(), 3);
        assert!(q.inbox.is_empty().unwrap());
        assert!(q.requests.is_empty().unwrap());
        assert!(q.responses.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_stopped_engine_keeps_inbox() {
        let q = setup(PanickingDetector);
        for i in 0..5 {
            q.inbox
                .send(&ImageRequest::new(&png(8, 8), format!("r{i}"), "a.jpg"))
                .unwrap();
        }

        for _ in 0..2 {
            let err = q.worker.poll_once().await.unwrap_err();
            assert!(matches!(err, WorkerError::EngineStopped));
        }
        assert_eq!(q.inbox.len().unwrap(), 5);
        assert!(q.requests.is_empty().unwrap());
        assert!(q.responses.is_empty().unwrap());
    }
}

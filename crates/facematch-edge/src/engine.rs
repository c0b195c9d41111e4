use facematch_core::detector::DetectorError;
use facematch_core::FaceDetector;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// A face found in a submitted image, ready to forward.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    /// JPEG-encoded crop.
    pub jpeg: Vec<u8>,
    pub confidence: f32,
}

/// Messages sent from the poll loop to the engine thread.
struct EngineRequest {
    image: Vec<u8>,
    reply: oneshot::Sender<Result<Option<DetectedFace>, EngineError>>,
}

/// Clone-safe handle to the detection thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode an encoded image file and detect at most one face in it.
    pub async fn detect(&self, image: Vec<u8>) -> Result<Option<DetectedFace>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the detector on a dedicated OS thread.
///
/// The thread owns the detector and exits when every handle is dropped.
pub fn spawn_engine<D>(mut detector: D) -> Result<EngineHandle, EngineError>
where
    D: FaceDetector + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facematch-detect".into())
        .spawn(move || {
            tracing::info!("detection thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = run_detect(&mut detector, &req.image);
                let _ = req.reply.send(result);
            }
            tracing::info!("detection thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_detect<D: FaceDetector>(
    detector: &mut D,
    image: &[u8],
) -> Result<Option<DetectedFace>, EngineError> {
    let decoded = image::load_from_memory(image)?;
    tracing::debug!(width = decoded.width(), height = decoded.height(), "detect: image decoded");

    let Some(crop) = detector.detect(&decoded)? else {
        return Ok(None);
    };

    Ok(Some(DetectedFace {
        jpeg: crop.to_jpeg()?,
        confidence: crop.bbox.confidence,
    }))
}


#[cfg(test)]
mod tests {
    use super::testing::{png, PanickingDetector, StubDetector};
    use super::*;

    #[tokio::test]
    async fn test_detect_face() {
        let handle = spawn_engine(StubDetector { min_width: 16 }).unwrap();
        let face = handle.detect(png(32, 32)).await.unwrap().unwrap();
        assert!((face.confidence - 0.93).abs() < 1e-6);
        assert_eq!(&face.jpeg[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_detect_no_face() {
        let handle = spawn_engine(StubDetector { min_width: 64 }).unwrap();
        assert!(handle.detect(png(32, 32)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_detect_undecodable_image() {
        let handle = spawn_engine(StubDetector { min_width: 1 }).unwrap();
        let err = handle.detect(b"not an image".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[tokio::test]
    async fn test_dead_thread_reports_channel_closed() {
        let handle = spawn_engine(PanickingDetector).unwrap();
        for _ in 0..2 {
            let err = handle.detect(png(8, 8)).await.unwrap_err();
            assert!(matches!(err, EngineError::ChannelClosed));
        }
    }
}

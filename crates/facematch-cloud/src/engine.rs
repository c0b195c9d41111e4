use facematch_core::embedder::EmbedderError;
use facematch_core::{EuclideanMatcher, FaceEmbedder, Gallery, Identification, MatchError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("match failed: {0}")]
    Match(#[from] MatchError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the poll loop to the engine thread.
struct EngineRequest {
    face: Vec<u8>,
    gallery: Arc<Gallery>,
    matcher: EuclideanMatcher,
    reply: oneshot::Sender<Result<Identification, EngineError>>,
}

/// Clone-safe handle to the recognition thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Embed an encoded face image and match it against `gallery`.
    ///
    /// The gallery snapshot passed in is the one used, whatever happens to
    /// the store meanwhile.
    pub async fn recognize(
        &self,
        face: Vec<u8>,
        gallery: Arc<Gallery>,
        matcher: EuclideanMatcher,
    ) -> Result<Identification, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest {
                face,
                gallery,
                matcher,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the embedder on a dedicated OS thread.
pub fn spawn_engine<E>(mut embedder: E) -> Result<EngineHandle, EngineError>
where
    E: FaceEmbedder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facematch-recognize".into())
        .spawn(move || {
            tracing::info!("recognition thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = run_recognize(&mut embedder, &req.face, &req.gallery, &req.matcher);
                let _ = req.reply.send(result);
            }
            tracing::info!("recognition thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_recognize<E: FaceEmbedder>(
    embedder: &mut E,
    face: &[u8],
    gallery: &Gallery,
    matcher: &EuclideanMatcher,
) -> Result<Identification, EngineError> {
    let image = image::load_from_memory(face)?;
    let embedding = embedder.extract(&image)?;
    tracing::debug!(dimension = embedding.dimension(), "recognize: embedding extracted");
    Ok(matcher.identify(&embedding, gallery)?)
}


#[cfg(test)]
mod tests {
    use super::testing::{png, MeanColorEmbedder, PanickingEmbedder};
    use super::*;
    use facematch_core::{Embedding, GalleryEntry, MatchResult};

    fn gallery() -> Arc<Gallery> {
        Arc::new(
            Gallery::from_entries(
                vec![
                    GalleryEntry::new(Embedding::new(vec![1.0, 0.0]), "red"),
                    GalleryEntry::new(Embedding::new(vec![0.0, 1.0]), "green"),
                ],
                None,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_recognize_identifies_nearest() {
        let handle = spawn_engine(MeanColorEmbedder).unwrap();
        let id = handle
            .recognize(png([250, 10, 0]), gallery(), EuclideanMatcher::nearest())
            .await
            .unwrap();
        assert_eq!(id.result, MatchResult::Identified("red".into()));
        assert_eq!(id.nearest.unwrap().index, 0);
    }

    #[tokio::test]
    async fn test_recognize_threshold_mode() {
        let handle = spawn_engine(MeanColorEmbedder).unwrap();
        let id = handle
            .recognize(png([0, 0, 255]), gallery(), EuclideanMatcher::with_max_distance(0.5))
            .await
            .unwrap();
        assert_eq!(id.result, MatchResult::Unidentified);
    }

    #[tokio::test]
    async fn test_recognize_dimension_mismatch() {
        let handle = spawn_engine(MeanColorEmbedder).unwrap();
        let wide = Arc::new(
            Gallery::from_entries(
                vec![GalleryEntry::new(Embedding::new(vec![0.0; 3]), "three")],
                None,
            )
            .unwrap(),
        );
        let err = handle
            .recognize(png([1, 2, 3]), wide, EuclideanMatcher::nearest())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Match(MatchError::DimensionMismatch { expected: 2, actual: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_recognize_undecodable_face() {
        let handle = spawn_engine(MeanColorEmbedder).unwrap();
        let err = handle
            .recognize(b"garbage".to_vec(), gallery(), EuclideanMatcher::nearest())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[tokio::test]
    async fn test_dead_thread_reports_channel_closed() {
        let handle = spawn_engine(PanickingEmbedder).unwrap();
        for _ in 0..2 {
            let err = handle
                .recognize(png([1, 2, 3]), gallery(), EuclideanMatcher::nearest())
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::ChannelClosed));
        }
    }
}

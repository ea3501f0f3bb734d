//! Image classification pipeline: environment check, admission, preprocessing,
//! inference, and the threshold decision.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::admission::{AdmissionController, AdmissionSlot};
use crate::decision::{self, ClassificationDecision, CLASS_LABELS, CLASSIFICATION_THRESHOLD};
use crate::environment::{EngineEnvironment, EnvironmentStatus};
use crate::error::GatewayError;
use crate::inference::{EngineError, InferenceEngine};
use crate::preprocess;

pub const PIPELINE: &str = "classification";

pub struct ClassificationService {
    environment: Arc<EngineEnvironment>,
    engine: Arc<dyn InferenceEngine>,
    admission: AdmissionController,
    wait_limit: Duration,
    threshold: f32,
}

impl ClassificationService {
    pub fn new(
        environment: Arc<EngineEnvironment>,
        engine: Arc<dyn InferenceEngine>,
        max_concurrency: usize,
        wait_limit: Duration,
    ) -> Self {
        Self {
            environment,
            engine,
            admission: AdmissionController::new(PIPELINE, max_concurrency),
            wait_limit,
            threshold: CLASSIFICATION_THRESHOLD,
        }
    }

    /// Fails fast with the cached error once the environment bootstrap has failed.
    ///
    /// A first-use bootstrap runs on the blocking pool; later calls only read the
    /// cached outcome.
    pub async fn check_environment(&self) -> Result<(), GatewayError> {
        if self.environment.status() != EnvironmentStatus::Uninitialized {
            self.environment.ensure_initialized()?;
            return Ok(());
        }

        let environment = self.environment.clone();
        tokio::task::spawn_blocking(move || environment.ensure_initialized())
            .await
            .map_err(|e| GatewayError::from(EngineError::Aborted(e.to_string())))??;
        Ok(())
    }

    pub fn environment_status(&self) -> EnvironmentStatus {
        self.environment.status()
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub async fn admit(&self) -> Result<AdmissionSlot, GatewayError> {
        Ok(self.admission.acquire(self.wait_limit).await?)
    }

    /// Preprocess and score `bytes` on the blocking pool.
    ///
    /// The slot moves into the blocking task, so it stays held for as long as
    /// the engine is busy even if the caller goes away.
    pub async fn classify(
        &self,
        slot: AdmissionSlot,
        bytes: Vec<u8>,
    ) -> Result<ClassificationDecision, GatewayError> {
        let engine = self.engine.clone();
        let threshold = self.threshold;

        let task = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            let input = preprocess::prepare(&bytes)?;
            drop(bytes);
            debug!(model = engine.model_name(), shape = ?input.shape(), "Image preprocessed");

            let output = engine.run(input)?;
            Ok::<_, GatewayError>(decision::classify(output.scores(), &CLASS_LABELS, threshold))
        });

        let decision = task
            .await
            .map_err(|e| GatewayError::from(EngineError::Aborted(e.to_string())))??;

        info!(
            label = %decision.label,
            recognized = decision.is_recognized(),
            max_score = ?decision.max_score,
            "Image classified"
        );
        Ok(decision)
    }

    /// Whole pipeline for bytes that are already in memory
    pub async fn run(&self, bytes: Vec<u8>) -> Result<ClassificationDecision, GatewayError> {
        self.check_environment().await?;
        let slot = self.admit().await?;
        self.classify(slot, bytes).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::environment::EnvironmentBootstrap;
    use crate::inference::OutputTensor;
    use crate::preprocess::tests::encoded;
    use crate::preprocess::InputTensor;
    use image::ImageFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct StaticBootstrap(pub Result<(), String>);

    impl EnvironmentBootstrap for StaticBootstrap {
        fn bootstrap(&self) -> Result<(), String> {
            self.0.clone()
        }
    }

    /// Counts live engine-side resources so tests can see they are gone afterwards
    struct Tracked(Arc<AtomicUsize>);

    impl Tracked {
        fn new(live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self(live.clone())
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    pub(crate) enum FailAt {
        Nowhere,
        TensorAlloc,
        SessionCreate,
        Run,
        Panic,
    }

    pub(crate) struct FakeEngine {
        pub live: Arc<AtomicUsize>,
        pub running: Arc<AtomicUsize>,
        pub peak: Arc<AtomicUsize>,
        pub fail_at: FailAt,
        pub scores: Vec<f32>,
        pub delay: Duration,
    }

    impl FakeEngine {
        pub(crate) fn returning(scores: Vec<f32>) -> Self {
            Self {
                live: Arc::new(AtomicUsize::new(0)),
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                fail_at: FailAt::Nowhere,
                scores,
                delay: Duration::ZERO,
            }
        }
    }

    impl InferenceEngine for FakeEngine {
        fn run(&self, input: InputTensor) -> crate::inference::Result<OutputTensor> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _running = RunningGuard(self.running.clone());

            assert_eq!(input.shape(), [1, 3, 256, 256]);
            let _input = Tracked::new(&self.live);
            if self.fail_at == FailAt::TensorAlloc {
                return Err(EngineError::TensorAlloc("injected".into()));
            }
            let _output = Tracked::new(&self.live);
            if self.fail_at == FailAt::SessionCreate {
                return Err(EngineError::SessionCreate("injected".into()));
            }
            let _session = Tracked::new(&self.live);
            std::thread::sleep(self.delay);
            match self.fail_at {
                FailAt::Run => return Err(EngineError::RunFailed("injected".into())),
                FailAt::Panic => panic!("injected engine panic"),
                _ => {}
            }

            let mut output = OutputTensor::empty(vec![1, self.scores.len()]);
            output.fill(&[1, self.scores.len() as i64], &self.scores)?;
            Ok(output)
        }

        fn model_name(&self) -> &str {
            "fake"
        }
    }

    struct RunningGuard(Arc<AtomicUsize>);

    impl Drop for RunningGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn service(engine: FakeEngine, capacity: usize, wait: Duration) -> ClassificationService {
        ClassificationService::new(
            Arc::new(EngineEnvironment::new(StaticBootstrap(Ok(())))),
            Arc::new(engine),
            capacity,
            wait,
        )
    }

    fn confident_on(index: usize) -> Vec<f32> {
        let mut scores = vec![0.0; 11];
        scores[index] = 7.5;
        scores
    }

    #[tokio::test]
    async fn test_classifies_uploaded_image() {
        let svc = service(FakeEngine::returning(confident_on(5)), 2, Duration::from_secs(1));
        let decision = svc.run(encoded(32, 32, ImageFormat::Png)).await.unwrap();
        assert_eq!(decision.label, CLASS_LABELS[5]);
        assert_eq!(svc.admission().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_low_scores_are_unrecognized() {
        let svc = service(FakeEngine::returning(vec![1.0; 11]), 2, Duration::from_secs(1));
        let decision = svc.run(encoded(16, 16, ImageFormat::Jpeg)).await.unwrap();
        assert_eq!(decision.label, "unrecognized");
    }

    #[tokio::test]
    async fn test_undecodable_upload_releases_slot() {
        let svc = service(FakeEngine::returning(confident_on(0)), 1, Duration::from_secs(1));
        let err = svc.run(b"not an image".to_vec()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
        assert_eq!(svc.admission().available(), 1);
    }

    #[tokio::test]
    async fn test_resources_released_after_failure_at_each_stage() {
        for fail_at in [
            FailAt::Nowhere,
            FailAt::TensorAlloc,
            FailAt::SessionCreate,
            FailAt::Run,
            FailAt::Panic,
        ] {
            let mut engine = FakeEngine::returning(confident_on(1));
            engine.fail_at = fail_at;
            let live = engine.live.clone();
            let svc = service(engine, 1, Duration::from_millis(200));

            let result = svc.run(encoded(8, 8, ImageFormat::Png)).await;
            assert_eq!(result.is_ok(), fail_at == FailAt::Nowhere);
            if fail_at == FailAt::Panic {
                assert!(matches!(
                    result,
                    Err(GatewayError::Engine(EngineError::Aborted(_)))
                ));
            }

            assert_eq!(live.load(Ordering::SeqCst), 0);
            assert_eq!(svc.admission().available(), 1);
        }
    }

    #[tokio::test]
    async fn test_failed_environment_short_circuits() {
        let engine = FakeEngine::returning(confident_on(0));
        let peak = engine.peak.clone();
        let svc = ClassificationService::new(
            Arc::new(EngineEnvironment::new(StaticBootstrap(Err("no runtime".into())))),
            Arc::new(engine),
            1,
            Duration::from_secs(1),
        );

        for _ in 0..3 {
            let err = svc.run(encoded(8, 8, ImageFormat::Png)).await.unwrap_err();
            assert!(matches!(err, GatewayError::Environment(_)));
        }
        assert_eq!(peak.load(Ordering::SeqCst), 0);
        assert_eq!(
            svc.environment_status(),
            EnvironmentStatus::Failed("no runtime".into())
        );
    }

    struct ThreadRecordingBootstrap(Arc<std::sync::Mutex<Option<std::thread::ThreadId>>>);

    impl EnvironmentBootstrap for ThreadRecordingBootstrap {
        fn bootstrap(&self) -> Result<(), String> {
            *self.0.lock().unwrap() = Some(std::thread::current().id());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lazy_bootstrap_runs_off_the_runtime_thread() {
        let recorded = Arc::new(std::sync::Mutex::new(None));
        let environment = Arc::new(EngineEnvironment::new(ThreadRecordingBootstrap(
            recorded.clone(),
        )));
        let svc = ClassificationService::new(
            environment,
            Arc::new(FakeEngine::returning(confident_on(0))),
            1,
            Duration::from_secs(1),
        );

        svc.check_environment().await.unwrap();
        assert_eq!(svc.environment_status(), EnvironmentStatus::Ready);

        // The current-thread runtime polls this test on the test thread itself
        let runtime_thread = std::thread::current().id();
        let bootstrap_thread = *recorded.lock().unwrap();
        assert_ne!(bootstrap_thread, Some(runtime_thread));
        assert!(bootstrap_thread.is_some());

        // Cached outcome on later calls
        svc.check_environment().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_capacity() {
        let mut engine = FakeEngine::returning(confident_on(2));
        engine.delay = Duration::from_millis(40);
        let peak = engine.peak.clone();
        let svc = Arc::new(service(engine, 3, Duration::from_secs(30)));
        let image = encoded(8, 8, ImageFormat::Png);

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let svc = svc.clone();
                let image = image.clone();
                tokio::spawn(async move { svc.run(image).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(svc.admission().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_busy_pipeline_rejects_with_capacity_error() {
        let svc = service(FakeEngine::returning(confident_on(0)), 1, Duration::from_millis(50));
        let _held = svc.admit().await.unwrap();

        let err = svc.run(encoded(8, 8, ImageFormat::Png)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Capacity(_)));
    }
}

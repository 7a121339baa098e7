use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use async_trait::async_trait;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::types::{GenerationOutput, GenerationRequest, TextGenerationParams};
use super::{Connector, InferenceBackend, Provider};
use crate::config::ProviderConfig;
use crate::error::{BackendError, OpenmuxError};
use crate::pool::{BlockingPool, PoolLimits};
use crate::task::TaskType;

type ClientSlot<C> = Mutex<Option<Arc<<C as Connector>::Client>>>;

/// Puts one blocking backend behind the async [`Provider`] contract.
///
/// Owns model selection, the cached backend client and the worker pool.
/// All logging goes through `span`, so events are attributed per instance.
pub struct Adapter<C: Connector> {
    config: Arc<ProviderConfig>,
    connector: Arc<C>,
    client: Arc<ClientSlot<C>>,
    closed: Arc<AtomicBool>,
    pool: BlockingPool,
    span: Span,
}

/// Which backend operation a task maps to.
enum Dispatch {
    FeatureExtraction,
    TextGeneration(TextGenerationParams),
}

impl<C: Connector> Adapter<C> {
    pub fn new(config: ProviderConfig, connector: C, limits: PoolLimits) -> Self {
        let span = info_span!("provider", name = connector.name());
        Self {
            config: Arc::new(config),
            connector: Arc::new(connector),
            client: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            pool: BlockingPool::new(limits),
            span,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn resolve_model(&self, task: TaskType) -> Result<&str, OpenmuxError> {
        self.config
            .resolve_model(task)
            .ok_or(OpenmuxError::UnsupportedTask(task))
    }
}

#[async_trait]
impl<C: Connector> Provider for Adapter<C> {
    fn name(&self) -> &str {
        self.connector.name()
    }

    fn is_available(&self) -> bool {
        self.config.credential().is_some()
    }

    fn supports_task(&self, task: TaskType) -> bool {
        self.config.resolve_model(task).is_some()
    }

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationOutput, OpenmuxError> {
        let GenerationRequest {
            query,
            task,
            params,
        } = request;

        let model = self.resolve_model(task)?.to_owned();
        let span = info_span!(
            parent: &self.span,
            "generate",
            request_id = %Uuid::now_v7(),
            %task,
            %model
        );

        async move {
            info!("dispatching request");
            let dispatch = match task {
                TaskType::Embeddings => Dispatch::FeatureExtraction,
                TaskType::Chat | TaskType::Code => {
                    Dispatch::TextGeneration(params.text_generation())
                }
            };

            // Everything below runs on a pool thread, client creation included.
            let config = Arc::clone(&self.config);
            let connector = Arc::clone(&self.connector);
            let slot = Arc::clone(&self.client);
            let closed = Arc::clone(&self.closed);
            let span = Span::current();
            let job = move || {
                let _entered = span.enter();
                let client = cached_client(&*slot, &*connector, &config, &closed)?;
                match dispatch {
                    Dispatch::FeatureExtraction => client
                        .feature_extraction(&query, &model)
                        .map(GenerationOutput::Embedding),
                    Dispatch::TextGeneration(params) => client
                        .text_generation(&query, &model, &params)
                        .map(GenerationOutput::Text),
                }
            };

            match self.pool.run(job).await? {
                Ok(output) => Ok(output),
                Err(e) => {
                    error!(error = %e, "backend call failed");
                    Err(OpenmuxError::Backend(e))
                }
            }
        }
        .instrument(span)
        .await
    }

    fn close(&self) {
        let _entered = self.span.enter();
        self.closed.store(true, Ordering::SeqCst);
        self.pool.close();

        // Never wait on a client build in progress. The builder sees `closed`
        // and does not cache what it built.
        let mut guard = match self.client.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("backend client is being created, leaving release to the worker");
                return;
            }
        };
        if let Some(client) = guard.take() {
            debug!("releasing backend client");
            release_client(client);
        }
    }
}

impl<C: Connector> Drop for Adapter<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_slot<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|poisoned| {
        warn!("client mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Return the cached client, creating it under the lock on first use so
/// concurrent first calls build exactly one.
///
/// A client built after `close()` serves the calling job only and is dropped
/// with it, on this blocking thread.
fn cached_client<C: Connector>(
    slot: &ClientSlot<C>,
    connector: &C,
    config: &ProviderConfig,
    closed: &AtomicBool,
) -> Result<Arc<C::Client>, BackendError> {
    let mut guard = lock_slot(slot);
    if let Some(client) = guard.as_ref() {
        return Ok(Arc::clone(client));
    }

    debug!("creating backend client");
    let client = Arc::new(connector.connect(config.credential())?);
    if !closed.load(Ordering::SeqCst) {
        *guard = Some(Arc::clone(&client));
    }
    Ok(client)
}

/// Blocking clients must not be dropped on an async worker thread.
fn release_client<B: InferenceBackend>(client: Arc<B>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || drop(client));
        }
        Err(_) => drop(client),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use secrecy::SecretString;
    use serde_json::json;

    use super::*;
    use crate::providers::types::{MAX_NEW_TOKENS, TEMPERATURE, TOP_P};
    use crate::task::TaskModelRegistry;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Text {
            prompt: String,
            model: String,
            params: TextGenerationParams,
        },
        Embed {
            text: String,
            model: String,
        },
    }

    #[derive(Default)]
    struct Recorder {
        connects: AtomicUsize,
        fail_next: AtomicBool,
        connect_delay: Option<Duration>,
        calls: Mutex<Vec<Call>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct MockConnector(Arc<Recorder>);

    struct MockClient(Arc<Recorder>);

    impl Connector for MockConnector {
        type Client = MockClient;

        fn name(&self) -> &str {
            "mock"
        }

        fn connect(&self, _credential: Option<&SecretString>) -> Result<MockClient, BackendError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.0.connect_delay {
                std::thread::sleep(delay);
            }
            Ok(MockClient(Arc::clone(&self.0)))
        }
    }

    impl MockClient {
        fn record(&self, call: Call) -> Result<(), BackendError> {
            self.0.calls.lock().unwrap().push(call);
            if self.0.fail_next.swap(false, Ordering::SeqCst) {
                return Err(BackendError::Network("connection reset".to_owned()));
            }
            Ok(())
        }
    }

    impl InferenceBackend for MockClient {
        fn text_generation(
            &self,
            prompt: &str,
            model: &str,
            params: &TextGenerationParams,
        ) -> Result<String, BackendError> {
            self.record(Call::Text {
                prompt: prompt.to_owned(),
                model: model.to_owned(),
                params: *params,
            })?;
            Ok(format!("{model} says hello"))
        }

        fn feature_extraction(&self, text: &str, model: &str) -> Result<Vec<f32>, BackendError> {
            self.record(Call::Embed {
                text: text.to_owned(),
                model: model.to_owned(),
            })?;
            Ok(vec![0.1, 0.2, 0.3])
        }
    }

    fn adapter_with(config: ProviderConfig, recorder: &Arc<Recorder>) -> Adapter<MockConnector> {
        Adapter::new(
            config,
            MockConnector(Arc::clone(recorder)),
            PoolLimits::default(),
        )
    }

    fn chat_only() -> ProviderConfig {
        ProviderConfig::new(TaskModelRegistry::new([(TaskType::Chat, "model-A")]).unwrap())
    }

    #[tokio::test]
    async fn unsupported_task_fails_without_backend_call() {
        let recorder = Arc::new(Recorder::default());
        let adapter = adapter_with(chat_only(), &recorder);

        let err = adapter
            .generate(GenerationRequest::new("hi", TaskType::Code))
            .await
            .unwrap_err();

        assert!(matches!(err, OpenmuxError::UnsupportedTask(TaskType::Code)));
        assert!(err.to_string().contains("code"));
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 0);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn chat_uses_mapped_model_and_default_params() {
        let recorder = Arc::new(Recorder::default());
        let adapter = adapter_with(chat_only(), &recorder);

        let output = adapter
            .generate(GenerationRequest::new("hi", TaskType::Chat))
            .await
            .unwrap();

        assert_eq!(output, GenerationOutput::Text("model-A says hello".to_owned()));
        assert_eq!(
            recorder.calls(),
            vec![Call::Text {
                prompt: "hi".to_owned(),
                model: "model-A".to_owned(),
                params: TextGenerationParams {
                    max_new_tokens: 100,
                    temperature: 0.7,
                    top_p: 0.9,
                    return_full_text: false,
                },
            }]
        );
    }

    #[tokio::test]
    async fn caller_params_passed_through() {
        let recorder = Arc::new(Recorder::default());
        let adapter = adapter_with(chat_only(), &recorder);

        adapter
            .generate(
                GenerationRequest::new("count to 3", TaskType::Chat)
                    .with_param(MAX_NEW_TOKENS, 50)
                    .with_param(TEMPERATURE, 0.1)
                    .with_param("unknown", json!({"ignored": true})),
            )
            .await
            .unwrap();

        let calls = recorder.calls();
        let Call::Text { params, .. } = &calls[0] else {
            panic!("expected text generation call");
        };
        assert_eq!(params.max_new_tokens, 50);
        assert_eq!(params.temperature, 0.1);
        assert_eq!(params.top_p, 0.9);
    }

    #[tokio::test]
    async fn embeddings_never_receive_sampling_params() {
        let recorder = Arc::new(Recorder::default());
        let adapter = adapter_with(
            ProviderConfig::new(TaskModelRegistry::huggingface_defaults()),
            &recorder,
        );

        let output = adapter
            .generate(
                GenerationRequest::new("embed me", TaskType::Embeddings)
                    .with_param(MAX_NEW_TOKENS, 10)
                    .with_param(TOP_P, 0.5),
            )
            .await
            .unwrap();

        assert_eq!(output.as_embedding(), Some(&[0.1, 0.2, 0.3][..]));
        assert_eq!(
            recorder.calls(),
            vec![Call::Embed {
                text: "embed me".to_owned(),
                model: "sentence-transformers/all-MiniLM-L6-v2".to_owned(),
            }]
        );
    }

    #[tokio::test]
    async fn override_model_used_for_every_task() {
        let recorder = Arc::new(Recorder::default());
        let adapter = adapter_with(chat_only().with_model_override("gpt2"), &recorder);

        for task in TaskType::ALL {
            adapter
                .generate(GenerationRequest::new("q", task))
                .await
                .unwrap();
        }

        let models: Vec<_> = recorder
            .calls()
            .into_iter()
            .map(|call| match call {
                Call::Text { model, .. } | Call::Embed { model, .. } => model,
            })
            .collect();
        assert_eq!(models, vec!["gpt2"; TaskType::ALL.len()]);
    }

    #[tokio::test]
    async fn supports_task_agrees_with_generate() {
        let configs = [
            chat_only(),
            chat_only().with_model_override("gpt2"),
            ProviderConfig::new(TaskModelRegistry::huggingface_defaults()),
            ProviderConfig::new(TaskModelRegistry::new(Vec::<(TaskType, String)>::new()).unwrap()),
        ];

        for config in configs {
            let recorder = Arc::new(Recorder::default());
            let adapter = adapter_with(config, &recorder);
            for task in TaskType::ALL {
                let result = adapter.generate(GenerationRequest::new("", task)).await;
                let proceeded = !matches!(result, Err(OpenmuxError::UnsupportedTask(_)));
                assert_eq!(adapter.supports_task(task), proceeded, "task {task}");
            }
        }
    }

    #[tokio::test]
    async fn backend_fault_propagates_without_retry() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail_next.store(true, Ordering::SeqCst);
        let adapter = adapter_with(chat_only(), &recorder);

        let err = adapter
            .generate(GenerationRequest::new("hi", TaskType::Chat))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OpenmuxError::Backend(BackendError::Network(ref msg)) if msg == "connection reset"
        ));
        assert_eq!(recorder.calls().len(), 1);

        // Failures are not sticky.
        let output = adapter
            .generate(GenerationRequest::new("hi", TaskType::Chat))
            .await
            .unwrap();
        assert_eq!(output.as_text(), Some("model-A says hello"));
        assert_eq!(recorder.calls().len(), 2);
    }

    #[tokio::test]
    async fn client_created_once_and_reused() {
        let recorder = Arc::new(Recorder::default());
        let adapter = adapter_with(chat_only(), &recorder);

        for _ in 0..3 {
            adapter
                .generate(GenerationRequest::new("hi", TaskType::Chat))
                .await
                .unwrap();
        }
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_first_calls_create_one_client() {
        let recorder = Arc::new(Recorder {
            connect_delay: Some(Duration::from_millis(50)),
            ..Recorder::default()
        });
        let adapter = Arc::new(adapter_with(chat_only(), &recorder));

        let calls: Vec<_> = (0..4)
            .map(|i| {
                let adapter = Arc::clone(&adapter);
                tokio::spawn(async move {
                    adapter
                        .generate(GenerationRequest::new(format!("q{i}"), TaskType::Chat))
                        .await
                })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.calls().len(), 4);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_new_work() {
        let recorder = Arc::new(Recorder::default());
        let adapter = adapter_with(chat_only(), &recorder);
        adapter
            .generate(GenerationRequest::new("hi", TaskType::Chat))
            .await
            .unwrap();

        adapter.close();
        adapter.close();

        let err = adapter
            .generate(GenerationRequest::new("hi", TaskType::Chat))
            .await
            .unwrap_err();
        assert!(matches!(err, OpenmuxError::PoolClosed));
        assert!(lock_slot(&*adapter.client).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_does_not_wait_for_client_creation() {
        let recorder = Arc::new(Recorder {
            connect_delay: Some(Duration::from_millis(300)),
            ..Recorder::default()
        });
        let adapter = Arc::new(adapter_with(chat_only(), &recorder));

        let in_flight = tokio::spawn({
            let adapter = Arc::clone(&adapter);
            async move {
                adapter
                    .generate(GenerationRequest::new("hi", TaskType::Chat))
                    .await
            }
        });
        while recorder.connects.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let started = Instant::now();
        adapter.close();
        assert!(started.elapsed() < Duration::from_millis(100));

        // The admitted call still completes, but its client is not kept.
        let output = in_flight.await.unwrap().unwrap();
        assert_eq!(output.as_text(), Some("model-A says hello"));
        assert!(lock_slot(&*adapter.client).is_none());
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsupported_task_reported_even_after_close() {
        let recorder = Arc::new(Recorder::default());
        let adapter = adapter_with(chat_only(), &recorder);
        adapter.close();

        let err = adapter
            .generate(GenerationRequest::new("hi", TaskType::Embeddings))
            .await
            .unwrap_err();
        assert!(matches!(err, OpenmuxError::UnsupportedTask(TaskType::Embeddings)));
    }

    #[test]
    fn availability_tracks_credential() {
        let recorder = Arc::new(Recorder::default());
        assert!(!adapter_with(chat_only(), &recorder).is_available());
        assert!(adapter_with(chat_only().with_credential("hf_token"), &recorder).is_available());
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 0);
    }
}

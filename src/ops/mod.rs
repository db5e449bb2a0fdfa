//! Pipeline orchestration: intake, stage workers and the retry sweep.

pub mod ingest;
pub mod retry;
pub mod worker;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::crm::{CrmSink, HttpCrm};
use crate::notify::Notifier;
use crate::ocr::mistral::MistralClient;
use crate::ocr::text_layer::TextLayerOcr;
use crate::ocr::{Analyzer, KeywordAnalyzer, OcrEngine};
use crate::queue::{FsQueue, JobQueue, CRM_QUEUE, OCR_QUEUE};
use crate::storage::{FsObjectStore, ObjectStore};
use crate::tracking::TrackingStore;

pub use ingest::{ingest_email, ingest_pdf, IngestOutcome};
pub use retry::{cleanup, sweep_retries, RetrySweep};
pub use worker::{process_crm_job, process_ocr_job, run_once, run_worker, WorkerKind};

/// Everything the stages share. Cheap to clone behind an `Arc`.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ObjectStore>,
    pub tracking: Arc<TrackingStore>,
    pub ocr_queue: Arc<dyn JobQueue>,
    pub crm_queue: Arc<dyn JobQueue>,
    pub ocr: Arc<dyn OcrEngine>,
    pub analyzer: Arc<dyn Analyzer>,
    pub crm: Option<Arc<dyn CrmSink>>,
    pub notifier: Arc<Notifier>,
}

impl AppState {
    /// Local backends under the data dir, with the remote services the config enables.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.objects_dir())?);
        let tracking = Arc::new(TrackingStore::open(config.tracking_path())?);
        let ocr_queue: Arc<dyn JobQueue> = Arc::new(FsQueue::open(OCR_QUEUE, config.queue_dir(OCR_QUEUE))?);
        let crm_queue: Arc<dyn JobQueue> = Arc::new(FsQueue::open(CRM_QUEUE, config.queue_dir(CRM_QUEUE))?);

        let (ocr, analyzer): (Arc<dyn OcrEngine>, Arc<dyn Analyzer>) = match MistralClient::from_config(&config) {
            Some(client) => {
                tracing::info!("Using hosted OCR model {} and chat model {}", client.ocr_model, client.chat_model);
                let client = Arc::new(client);
                (client.clone(), client)
            }
            None => (Arc::new(TextLayerOcr), Arc::new(KeywordAnalyzer)),
        };

        let crm = HttpCrm::from_config(&config).map(|c| Arc::new(c) as Arc<dyn CrmSink>);
        let notifier = Arc::new(Notifier::from_config(&config, store.clone()));

        Ok(Self {
            config,
            store,
            tracking,
            ocr_queue,
            crm_queue,
            ocr,
            analyzer,
            crm,
            notifier,
        })
    }
}

/// `batch_<YYYYmmdd_HHMMSS>_<8 hex>`
pub fn new_batch_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("batch_{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// Oficio ids double as OCR job ids.
pub fn oficio_id(batch_id: &str, sequence: u32) -> String {
    format!("{}_oficio_{:03}", batch_id, sequence)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::crm::CrmPayload;
    use crate::error::{PipelineError, PipelineResult};
    use crate::notify::test_support::RecordingTransport;
    use crate::ocr::{OcrOutput, OficioAnalysis};

    /// OCR stand-in that echoes the text layer, or fails with a fixed message.
    pub struct StubOcr {
        pub fail_with: Mutex<Option<String>>,
    }

    #[async_trait]
    impl OcrEngine for StubOcr {
        async fn extract(&self, pdf: &[u8]) -> PipelineResult<OcrOutput> {
            if let Some(msg) = self.fail_with.lock().unwrap().clone() {
                return Err(PipelineError::Ocr(msg));
            }
            let bundle = crate::pdf::PdfBundle::load(pdf)?;
            Ok(OcrOutput {
                text: bundle.page_texts().join("\n"),
                pages: bundle.page_count() as u32,
                engine: "stub".to_string(),
                model: "stub".to_string(),
                confidence: Some(0.9),
            })
        }
    }

    pub struct StubAnalyzer;

    #[async_trait]
    impl Analyzer for StubAnalyzer {
        async fn analyze(&self, text: &str, _job_id: &str) -> PipelineResult<OficioAnalysis> {
            let reply = serde_json::json!({
                "palabras_clave_encontradas": ["embargo"],
                "tipo_oficio_detectado": "Embargo",
                "nivel_confianza": "alto",
                "informacion_extraida": {
                    "numero_oficio": text.lines().next().unwrap_or_default(),
                    "monto": "B/. 1,000.00",
                    "personas": [{"nombre": "JUAN PEREZ", "identificacion": "8-123-456"}]
                }
            });
            Ok(crate::ocr::parse_analysis_reply(&reply.to_string()))
        }
    }

    #[derive(Default)]
    pub struct StubCrm {
        pub created: Mutex<Vec<CrmPayload>>,
        pub fail_with: Mutex<Option<String>>,
    }

    #[async_trait]
    impl CrmSink for StubCrm {
        async fn create_request(&self, payload: &CrmPayload) -> PipelineResult<String> {
            if let Some(msg) = self.fail_with.lock().unwrap().clone() {
                return Err(PipelineError::Crm(msg));
            }
            let mut created = self.created.lock().unwrap();
            created.push(payload.clone());
            Ok(format!("crm-{}", created.len()))
        }
    }

    pub struct Harness {
        pub _dir: tempfile::TempDir,
        pub state: Arc<AppState>,
        pub ocr: Arc<StubOcr>,
        pub crm: Arc<StubCrm>,
        pub mail: Arc<RecordingTransport>,
    }

    pub fn harness(with_crm: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.objects_dir()).unwrap());
        let ocr = Arc::new(StubOcr {
            fail_with: Mutex::new(None),
        });
        let crm = Arc::new(StubCrm::default());
        let mail = Arc::new(RecordingTransport::default());

        let state = AppState {
            store: store.clone(),
            tracking: Arc::new(TrackingStore::open(config.tracking_path()).unwrap()),
            ocr_queue: Arc::new(FsQueue::open(OCR_QUEUE, config.queue_dir(OCR_QUEUE)).unwrap()),
            crm_queue: Arc::new(FsQueue::open(CRM_QUEUE, config.queue_dir(CRM_QUEUE)).unwrap()),
            ocr: ocr.clone(),
            analyzer: Arc::new(StubAnalyzer),
            crm: with_crm.then(|| crm.clone() as Arc<dyn CrmSink>),
            notifier: Arc::new(Notifier::new(Some(mail.clone()), store, Some("ops@bank.com".to_string()))),
            config,
        };
        Harness {
            _dir: dir,
            state: Arc::new(state),
            ocr,
            crm,
            mail,
        }
    }

    /// One oficio per page, each long enough to pass the PDF size check.
    pub fn bundle(count: usize) -> Vec<u8> {
        let pages: Vec<String> = (1..=count)
            .map(|n| {
                format!(
                    "OFICIO No. {n}-2024\nJuzgado Tercero de Circuito Civil\n\
                     Se ordena el embargo de las cuentas del demandado numero {n}.\n{}",
                    "Texto del oficio con el detalle de la orden judicial. ".repeat(4)
                )
            })
            .collect();
        let refs: Vec<&str> = pages.iter().map(|s| s.as_str()).collect();
        crate::pdf::test_support::make_test_pdf(&refs)
    }
}

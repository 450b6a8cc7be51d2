//! Conversion of one wish: source image in, thin image out.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thinimage_core::config::{ConversionConfig, ThinConfig};
use thinimage_core::error::{Result, ThinError};
use thinimage_core::{strip_digest_scheme, Image, ImageManifest, ImageRef, ThinImage, Wish};
use tokio::sync::{mpsc, oneshot};

use super::changes::{image_changes, thin_image_config};
use super::ingest::{decompress_blob, ingest_layers, DownloadedLayer, IngestReport, StopFlags};
use crate::db::ConversionDb;
use crate::driver::archive;
use crate::engine::{ContainerEngine, DockerCli};
use crate::registry::{ImagePublisher, ImageSource, OciRegistry, RegistryAuth, ThinPayload};
use crate::store::{metadata, CvmfsServer, StorePublisher};

/// Flags of a conversion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Convert even if this source digest was converted before
    pub convert_again: bool,
    /// Download and ingest layers already present in the store
    pub force_download: bool,
}

/// A wish with its images resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionJob {
    pub wish: u64,
    pub input: Image,
    pub output: Image,
    pub repo: String,
}

impl ConversionJob {
    pub fn load(db: &dyn ConversionDb, wish: &Wish) -> Result<Self> {
        Ok(Self {
            wish: wish.id,
            input: db.get_image_by_id(wish.input_image)?,
            output: db.get_image_by_id(wish.output_image)?,
            repo: wish.repo.clone(),
        })
    }
}

/// Result of a successful job.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionOutcome {
    /// This source digest was converted before
    AlreadyConverted,
    Converted {
        /// Hex digests ingested by this run
        ingested: Vec<String>,
        /// Hex digests already in the store
        skipped: Vec<String>,
        thin: ThinImage,
    },
}

/// Totals of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertSummary {
    pub converted: usize,
    pub already_converted: usize,
    pub failed: usize,
}

pub struct Converter {
    db: Arc<dyn ConversionDb>,
    source: Arc<dyn ImageSource>,
    publisher: Arc<dyn ImagePublisher>,
    store: Arc<dyn StorePublisher>,
    engine: Option<Arc<dyn ContainerEngine>>,
    config: ConversionConfig,
    layers_subdir: String,
    interrupt: Arc<AtomicBool>,
}

impl Converter {
    pub fn new(
        db: Arc<dyn ConversionDb>,
        source: Arc<dyn ImageSource>,
        publisher: Arc<dyn ImagePublisher>,
        store: Arc<dyn StorePublisher>,
        config: &ThinConfig,
    ) -> Self {
        Self {
            db,
            source,
            publisher,
            store,
            engine: None,
            config: config.conversion.clone(),
            layers_subdir: config.store.layers_subdir.clone(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Converter using the registry, `cvmfs_server` and (if enabled) `docker`.
    pub fn from_config(config: &ThinConfig, db: Arc<dyn ConversionDb>) -> Self {
        let registry = Arc::new(OciRegistry::new());
        let converter = Self::new(
            db,
            registry.clone(),
            registry,
            Arc::new(CvmfsServer::from_config(&config.store)),
            config,
        );
        if config.conversion.import_locally {
            converter.with_engine(Arc::new(DockerCli::from_config(&config.conversion)))
        } else {
            converter
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Share an interrupt flag, typically set from a Ctrl-C handler.
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Every recorded wish as a job. Wishes that fail to load are logged and skipped.
    pub fn jobs(&self) -> Result<Vec<ConversionJob>> {
        let mut jobs = Vec::new();
        for info in self.db.list_wishes()? {
            let loaded = self
                .db
                .get_wish_by_id(info.id)
                .and_then(|w| ConversionJob::load(self.db.as_ref(), &w));
            match loaded {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::error!(wish = info.id, error = %e, "Cannot load wish"),
            }
        }
        Ok(jobs)
    }

    /// Credentials of `user` for the registry of `reference`.
    fn auth_for(&self, user: Option<&str>, reference: &ImageRef) -> Result<RegistryAuth> {
        let Some(user) = user else {
            return Ok(RegistryAuth::anonymous());
        };
        match self.db.get_credential(user, &reference.registry)? {
            Some(password) => Ok(RegistryAuth::basic(user, password)),
            None => Err(ThinError::NotFound(format!(
                "credentials of {} for {}",
                user, reference.registry
            ))),
        }
    }

    /// Run one job to completion.
    pub async fn convert(&self, job: &ConversionJob, options: ConvertOptions) -> Result<ConversionOutcome> {
        let input = &job.input.reference;
        let output = &job.output.reference;
        tracing::info!(
            wish = job.wish,
            input = %input,
            output = %output,
            repo = %job.repo,
            "Converting image"
        );

        let input_auth = match self.auth_for(job.input.user.as_deref(), input) {
            Ok(auth) => auth,
            Err(e) => {
                tracing::warn!(input = %input, error = %e, "Pulling anonymously");
                RegistryAuth::anonymous()
            }
        };
        let output_auth = self.auth_for(job.output.user.as_deref(), output)?;

        let fetched = self.source.fetch_manifest(input, &input_auth).await?;
        let manifest = fetched.manifest;

        if !options.convert_again && self.db.already_converted(job.wish, manifest.config_digest())? {
            tracing::info!(wish = job.wish, digest = %manifest.config_digest(), "Already converted, skipping");
            return Ok(ConversionOutcome::AlreadyConverted);
        }

        let (report, skipped) = self
            .transfer_layers(job, &manifest, &input_auth, options)
            .await?;
        if let Some(e) = report.error {
            return Err(e);
        }
        if report.interrupted || self.interrupted() {
            return Err(ThinError::Interrupted);
        }

        self.write_backlinks(job, &manifest).await;

        let location = format!("{}/{}", job.repo, self.layers_subdir);
        let thin = ThinImage::from_manifest(&manifest, &location, &input.whole_name());
        let mut layer = Vec::new();
        archive::export_thin(&thin, &mut layer)?;

        if let Some(engine) = &self.engine {
            self.import_locally(engine.clone(), &layer, output, image_changes(&fetched.config))
                .await?;
        }

        let payload = ThinPayload {
            config: thin_image_config(&fetched.config, &layer)?,
            layer,
        };
        self.publisher.push_thin(output, &output_auth, &payload).await?;

        self.db.add_conversion_record(job.wish, &manifest)?;
        tracing::info!(
            wish = job.wish,
            ingested = report.ingested.len(),
            skipped = skipped.len(),
            "Conversion recorded"
        );

        Ok(ConversionOutcome::Converted {
            ingested: report.ingested,
            skipped,
            thin,
        })
    }

    /// Download layers and hand them to the ingest consumer.
    ///
    /// Returns the consumer report and the layers skipped as already present.
    async fn transfer_layers(
        &self,
        job: &ConversionJob,
        manifest: &ImageManifest,
        auth: &RegistryAuth,
        options: ConvertOptions,
    ) -> Result<(IngestReport, Vec<String>)> {
        let flags = StopFlags::new(self.interrupt.clone());
        let (tx, rx) = mpsc::channel::<DownloadedLayer>(self.config.channel_capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel::<IngestReport>();

        let store = self.store.clone();
        let repo = job.repo.clone();
        let consumer_flags = flags.clone();
        tokio::task::spawn_blocking(move || {
            let report = ingest_layers(store.as_ref(), &repo, rx, &consumer_flags);
            let _ = done_tx.send(report);
        });

        let produced = self
            .produce_layers(job, manifest, auth, options, &flags, tx)
            .await;

        let report = done_rx
            .await
            .map_err(|_| ThinError::Other("ingest task ended without a report".to_string()))?;
        let skipped = produced?;
        Ok((report, skipped))
    }

    async fn produce_layers(
        &self,
        job: &ConversionJob,
        manifest: &ImageManifest,
        auth: &RegistryAuth,
        options: ConvertOptions,
        flags: &StopFlags,
        tx: mpsc::Sender<DownloadedLayer>,
    ) -> Result<Vec<String>> {
        let input = &job.input.reference;
        let scratch = self.scratch_dir()?;
        let mut skipped = Vec::new();

        for layer in &manifest.layers {
            if flags.stopped() {
                tracing::info!(wish = job.wish, "Stopping downloads");
                break;
            }
            let digest = strip_digest_scheme(&layer.digest).to_string();
            let subpath = format!("{}/{}", self.layers_subdir, digest);

            if !options.force_download && self.store.contains(&job.repo, &subpath) {
                tracing::info!(layer = %digest, "Layer already in the store, skipping download");
                skipped.push(digest);
                continue;
            }

            let blob = tempfile::NamedTempFile::new_in(&scratch)?.into_temp_path();
            let size = self.source.fetch_blob(input, layer, auth, &blob).await?;
            let tar = tempfile::NamedTempFile::new_in(&scratch)?.into_temp_path();
            let tar = decompress(blob, tar).await?;
            tracing::debug!(layer = %digest, compressed = size, "Layer ready for ingest");

            let downloaded = DownloadedLayer {
                digest,
                subpath,
                tar,
            };
            if tx.send(downloaded).await.is_err() {
                tracing::debug!("Ingest consumer is gone");
                break;
            }
        }
        Ok(skipped)
    }

    fn scratch_dir(&self) -> Result<PathBuf> {
        let dir = self
            .config
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Best-effort: failures are logged.
    async fn write_backlinks(&self, job: &ConversionJob, manifest: &ImageManifest) {
        let store = self.store.clone();
        let repo = job.repo.clone();
        let subdir = self.layers_subdir.clone();
        let image = manifest.config_digest().to_string();
        let layers = manifest.layer_digests_hex();
        let result = tokio::task::spawn_blocking(move || {
            metadata::save_backlinks(store.as_ref(), &repo, &subdir, &image, &layers)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(repo = %job.repo, error = %e, "Failed to save backlinks"),
            Err(e) => tracing::warn!(repo = %job.repo, error = %e, "Backlink task failed"),
        }
    }

    async fn import_locally(
        &self,
        engine: Arc<dyn ContainerEngine>,
        layer: &[u8],
        output: &ImageRef,
        changes: Vec<String>,
    ) -> Result<()> {
        let file = tempfile::NamedTempFile::new_in(self.scratch_dir()?)?;
        std::fs::write(file.path(), layer)?;
        let path = file.into_temp_path();
        let reference = output.simple_name();
        tokio::task::spawn_blocking(move || engine.import(&path, &reference, &changes))
            .await
            .map_err(|e| ThinError::Engine(e.to_string()))?
    }

    /// Run every job; failures are logged and the batch continues.
    pub async fn convert_all(&self, jobs: &[ConversionJob], options: ConvertOptions) -> ConvertSummary {
        let mut summary = ConvertSummary::default();
        for job in jobs {
            if self.interrupted() {
                tracing::info!("Interrupted, not starting further conversions");
                break;
            }
            match self.convert(job, options).await {
                Ok(ConversionOutcome::AlreadyConverted) => summary.already_converted += 1,
                Ok(ConversionOutcome::Converted { .. }) => summary.converted += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        wish = job.wish,
                        input = %job.input.reference,
                        error = %e,
                        "Conversion failed"
                    );
                }
            }
        }
        tracing::info!(
            converted = summary.converted,
            already_converted = summary.already_converted,
            failed = summary.failed,
            "Conversion batch finished"
        );
        summary
    }
}

async fn decompress(blob: tempfile::TempPath, tar: tempfile::TempPath) -> Result<tempfile::TempPath> {
    tokio::task::spawn_blocking(move || {
        decompress_blob(&blob, &tar)?;
        Ok::<_, ThinError>(tar)
    })
    .await
    .map_err(|e| ThinError::Other(e.to_string()))?
}

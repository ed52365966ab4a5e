//! Explicit per-process context.
//!
//! Built once at startup and passed by reference into every stage. Holds the
//! configuration and every swappable collaborator; tests build one with mocks
//! and a [`FixedClock`].

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::OpsConfig;
use crate::pipeline::extract::{OcrTool, PdfBackend, PdftotextBackend, YomitokuCli};
use crate::preflight::auth::{DefaultTokenSource, TokenSource};
use crate::preflight::network::{NetworkProbe, SystemNetworkProbe};
use crate::sync::transport::{HttpRemoteStore, RemoteStore};
use crate::sync::SyncError;

/// Time source for artifact timestamps and trace durations.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// Parse an RFC 3339 timestamp; falls back to the Unix epoch.
    pub fn at(rfc3339: &str) -> Self {
        let at = DateTime::parse_from_rfc3339(rfc3339)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self(at)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Clone)]
pub struct OpsContext {
    pub config: OpsConfig,
    pub clock: Arc<dyn Clock>,
    pub pdf: Arc<dyn PdfBackend>,
    pub ocr: Arc<dyn OcrTool>,
    pub network: Arc<dyn NetworkProbe>,
    pub tokens: Arc<dyn TokenSource>,
    /// `None` until sync is configured; the sync stage reports an error without it.
    pub remote: Option<Arc<dyn RemoteStore>>,
}

impl OpsContext {
    /// Production wiring: system clock, CLI backends, HTTP remote store.
    pub fn new(config: OpsConfig) -> Result<Self, SyncError> {
        let tokens: Arc<dyn TokenSource> = Arc::new(DefaultTokenSource::from_config(&config));
        let remote: Option<Arc<dyn RemoteStore>> = if config.sync.enabled {
            Some(Arc::new(HttpRemoteStore::new(&config.sync, Arc::clone(&tokens))?))
        } else {
            None
        };

        Ok(Self {
            pdf: Arc::new(PdftotextBackend::new(&config.extract.pdftotext_command)),
            ocr: Arc::new(YomitokuCli::from_config(&config.extract)),
            network: Arc::new(SystemNetworkProbe::new(
                &config.sync.api_base,
                std::time::Duration::from_millis(config.preflight.probe_timeout_ms),
            )),
            clock: Arc::new(SystemClock),
            tokens,
            remote,
            config,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_pdf_backend(mut self, pdf: Arc<dyn PdfBackend>) -> Self {
        self.pdf = pdf;
        self
    }

    pub fn with_ocr_tool(mut self, ocr: Arc<dyn OcrTool>) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn with_network_probe(mut self, network: Arc<dyn NetworkProbe>) -> Self {
        self.network = network;
        self
    }

    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Secret literals plus the live access token, if one is cached.
    pub fn secret_literals(&self) -> Vec<String> {
        let mut literals = self.config.secret_literals();
        if let Some(token) = self.tokens.cached_token() {
            literals.push(token);
        }
        literals
    }
}

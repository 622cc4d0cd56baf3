use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::error::ConfigError;
use crate::frame::Frame;

use super::stream::{DefaultConnector, StreamConnector};
use super::{
    FrameSource, RtspSource, SourceDescriptor, SourceInfo, SourceKind, SourceParams,
    SyntheticSource,
};

/// Owns every instantiated source and routes captures to the active one.
///
/// Once any source exists exactly one of them is active. Switching sends the
/// previous source a stop signal (not a release) and the new one a start.
/// All mutation goes through `&mut self`, so switches are serialized by
/// whoever owns the registry.
pub struct SourceRegistry {
    sources: HashMap<String, Box<dyn FrameSource>>,
    /// Creation order, for listing.
    order: Vec<String>,
    active: Option<String>,
    connector: Arc<dyn StreamConnector>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(DefaultConnector))
    }

    /// Registry whose network-video sources open connections through `connector`.
    pub fn with_connector(connector: Arc<dyn StreamConnector>) -> Self {
        Self {
            sources: HashMap::new(),
            order: Vec::new(),
            active: None,
            connector,
        }
    }

    /// Create and initialize a built-in source. Returns its id.
    ///
    /// An empty descriptor id is replaced by `"{kind}_{n}"`. The first source
    /// created becomes active.
    pub fn create_source(&mut self, descriptor: &SourceDescriptor) -> Result<String> {
        let id = if descriptor.id.is_empty() {
            self.generate_id(descriptor.kind)
        } else {
            descriptor.id.clone()
        };
        if self.sources.contains_key(&id) {
            return Err(ConfigError::DuplicateSourceId(id).into());
        }

        let mut source: Box<dyn FrameSource> = match descriptor.kind {
            SourceKind::Synthetic => Box::new(SyntheticSource::new(id.clone())),
            SourceKind::NetworkVideo => Box::new(RtspSource::with_connector(
                id.clone(),
                Arc::clone(&self.connector),
            )),
            other => return Err(ConfigError::UnsupportedSourceKind(other.as_str()).into()),
        };
        if let Err(err) = source.initialize(&descriptor.params) {
            source.release();
            log::warn!("source {} ({}) failed to initialize: {:#}", id, descriptor.kind, err);
            return Err(err.context(format!("initialize source '{}'", id)));
        }
        log::info!("created source {} ({})", id, descriptor.kind);
        self.admit(id.clone(), source);
        Ok(id)
    }

    /// Add a source implemented outside this crate. It must already be
    /// initialized; it is keyed by its own `id()`.
    pub fn insert_source(&mut self, source: Box<dyn FrameSource>) -> Result<String> {
        let id = source.id().to_string();
        if id.is_empty() {
            return Err(ConfigError::field("id", "must not be empty").into());
        }
        if self.sources.contains_key(&id) {
            return Err(ConfigError::DuplicateSourceId(id).into());
        }
        log::info!("registered source {} ({})", id, source.kind());
        self.admit(id.clone(), source);
        Ok(id)
    }

    fn admit(&mut self, id: String, mut source: Box<dyn FrameSource>) {
        if self.active.is_none() {
            source.start();
            self.active = Some(id.clone());
            log::info!("active source: {}", id);
        } else {
            source.stop();
        }
        self.order.push(id.clone());
        self.sources.insert(id, source);
    }

    fn generate_id(&self, kind: SourceKind) -> String {
        let mut n = self.sources.len();
        loop {
            let candidate = format!("{}_{}", kind, n);
            if !self.sources.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Make `id` the active source. Unknown ids fail without side effects.
    pub fn switch_source(&mut self, id: &str) -> Result<()> {
        if !self.sources.contains_key(id) {
            return Err(ConfigError::UnknownSourceId(id.to_string()).into());
        }
        if self.active.as_deref() == Some(id) {
            return Ok(());
        }
        if let Some(previous) = self.active.take() {
            if let Some(source) = self.sources.get_mut(&previous) {
                source.stop();
            }
            log::info!("switching source {} -> {}", previous, id);
        }
        if let Some(source) = self.sources.get_mut(id) {
            source.start();
        }
        self.active = Some(id.to_string());
        Ok(())
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Capture from `id`, or from the active source when `id` is `None`.
    ///
    /// Inactive sources have been sent a stop signal and yield `None`, so an
    /// explicit id only produces frames for a source that is running. To read
    /// from another source, `switch_source` to it first.
    pub fn capture_frame(&mut self, id: Option<&str>) -> Option<Frame> {
        let id = match id {
            Some(id) => id,
            None => self.active.as_deref()?,
        };
        self.sources.get_mut(id)?.capture()
    }

    pub fn source_info(&self, id: &str) -> Option<SourceInfo> {
        self.sources.get(id).map(|source| source.info())
    }

    pub fn active_info(&self) -> Option<SourceInfo> {
        self.active.as_deref().and_then(|id| self.source_info(id))
    }

    pub fn get(&self, id: &str) -> Option<&dyn FrameSource> {
        self.sources.get(id).map(|source| source.as_ref())
    }

    pub fn set_source_config(&mut self, id: &str, patch: &SourceParams) -> Result<()> {
        let source = self
            .sources
            .get_mut(id)
            .ok_or_else(|| ConfigError::UnknownSourceId(id.to_string()))?;
        source
            .set_config(patch)
            .with_context(|| format!("configure source '{}'", id))
    }

    /// Source info in creation order.
    pub fn list(&self) -> Vec<SourceInfo> {
        self.order
            .iter()
            .filter_map(|id| self.source_info(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Release every source. Sources stay registered and can be
    /// re-initialized through `set_source_config` / their own handles.
    pub fn release_all(&mut self) {
        for id in &self.order {
            if let Some(source) = self.sources.get_mut(id) {
                source.release();
            }
        }
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SourceRegistry {
    fn drop(&mut self) {
        self.release_all();
    }
}

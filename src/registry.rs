//! Plugin entry points: API lookup by name and the HAL lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CodecError, HalError};
use crate::hal::CodecService;
use crate::host::{FrameAllocator, MainContext};
use crate::session::{DecoderSession, EncoderSession};

pub const DECODE_VIDEO_API: &str = "decode-video";
pub const ENCODE_VIDEO_API: &str = "encode-video";

/// What the host needs to hand over for a session to be built.
#[derive(Clone)]
pub struct HostContext {
    pub main: MainContext,
    pub allocator: Arc<dyn FrameAllocator>,
}

pub enum PluginApi {
    Decoder(DecoderSession),
    Encoder(EncoderSession),
}

impl PluginApi {
    pub fn into_decoder(self) -> Option<DecoderSession> {
        match self {
            PluginApi::Decoder(session) => Some(session),
            PluginApi::Encoder(_) => None,
        }
    }

    pub fn into_encoder(self) -> Option<EncoderSession> {
        match self {
            PluginApi::Encoder(session) => Some(session),
            PluginApi::Decoder(_) => None,
        }
    }
}

type SessionConstructor =
    Arc<dyn Fn(Arc<dyn CodecService>, HostContext) -> PluginApi + Send + Sync>;

pub struct SessionRegistry {
    factories: HashMap<String, SessionConstructor>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DECODE_VIDEO_API, |service, host| {
            PluginApi::Decoder(DecoderSession::new(service, host.main, host.allocator))
        });
        registry.register(ENCODE_VIDEO_API, |service, host| {
            PluginApi::Encoder(EncoderSession::new(service, host.main))
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(Arc<dyn CodecService>, HostContext) -> PluginApi + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(
        &self,
        name: &str,
        service: Arc<dyn CodecService>,
        host: HostContext,
    ) -> Result<PluginApi, CodecError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            CodecError::Generic(format!(
                "unknown API '{}'; available: {}",
                name,
                self.known_apis().join(", ")
            ))
        })?;
        Ok(factory(service, host))
    }

    pub fn supports(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn known_apis(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A loaded plugin bound to one codec service.
pub struct Plugin {
    service: Arc<dyn CodecService>,
    registry: SessionRegistry,
    active: bool,
}

impl Plugin {
    pub fn init(service: Arc<dyn CodecService>) -> Result<Self, HalError> {
        Self::with_registry(service, SessionRegistry::with_defaults())
    }

    pub fn with_registry(
        service: Arc<dyn CodecService>,
        registry: SessionRegistry,
    ) -> Result<Self, HalError> {
        service.init()?;
        info!(apis = ?registry.known_apis(), "Plugin initialised");
        Ok(Self {
            service,
            registry,
            active: true,
        })
    }

    pub fn service(&self) -> &Arc<dyn CodecService> {
        &self.service
    }

    pub fn get_api(&self, name: &str, host: HostContext) -> Result<PluginApi, CodecError> {
        if !self.active {
            return Err(CodecError::Generic("plugin has been shut down".into()));
        }
        debug!(api = name, "Creating session");
        self.registry
            .create(name, Arc::clone(&self.service), host)
            .inspect_err(|err| warn!(api = name, %err, "API not available"))
    }

    pub fn shutdown(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.service.deinit();
        info!("Plugin shut down");
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.shutdown();
    }
}

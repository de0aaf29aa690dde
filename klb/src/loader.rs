use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use aya::{Ebpf, EbpfLoader};
use tracing::{info, warn};

use crate::maps::registry::TableError;
use crate::maps::spec::GLOBALS_DIR;

/// Hash of the datapath configuration a template was compiled against.
/// Objects compiled from the same configuration are interchangeable.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ConfigHash(pub u64);

impl std::fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error("reading datapath object {0}: {1}")]
    Read(String, String),
    #[error("loading datapath object: {0}")]
    Load(String),
}

/// Produces a loaded datapath object for a configuration hash. Compiling is
/// expensive, so the cache in front of this guarantees one call per hash.
pub trait Compile {
    type Object;
    fn compile(&self, hash: ConfigHash) -> Result<Self::Object, LoadError>;
}

/// Cache eviction policy, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub enum CacheBound {
    Unbounded,
    Lru(usize),
}

struct Inner<O> {
    cells: ahash::HashMap<ConfigHash, Arc<OnceLock<Result<Arc<O>, LoadError>>>>,
    // most recently used last
    order: Vec<ConfigHash>,
}

impl<O> Default for Inner<O> {
    fn default() -> Self {
        Self {
            cells: ahash::HashMap::default(),
            order: Vec::new(),
        }
    }
}

/// Caches compiled datapath templates by configuration hash. At most one
/// compile runs per distinct hash no matter how many callers race for it;
/// every caller observes that one attempt's result. A failed attempt is
/// evicted so a later call may retry.
pub struct TemplateCache<C: Compile> {
    compiler: C,
    bound: CacheBound,
    inner: Mutex<Inner<C::Object>>,
}

impl<C: Compile> TemplateCache<C> {
    pub fn new(compiler: C, bound: CacheBound) -> Self {
        Self {
            compiler,
            bound,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn get_or_compile(&self, hash: ConfigHash) -> Result<Arc<C::Object>, LoadError> {
        let cell = {
            let mut inner = self.inner.lock().unwrap();
            inner.order.retain(|h| *h != hash);
            inner.order.push(hash);
            inner.cells.entry(hash).or_default().clone()
        };

        let result = cell
            .get_or_init(|| {
                info!(config = %hash, "compiling datapath template");
                self.compiler.compile(hash).map(Arc::new)
            })
            .clone();

        let mut inner = self.inner.lock().unwrap();
        match &result {
            Ok(_) => {
                if let CacheBound::Lru(max) = self.bound {
                    while inner.order.len() > max {
                        let evicted = inner.order.remove(0);
                        inner.cells.remove(&evicted);
                        info!(config = %evicted, "evicted datapath template");
                    }
                }
            }
            Err(_) => {
                // drop the failed cell so the next call retries, but only if
                // it is still ours; a concurrent retry may have replaced it
                if let Some(current) = inner.cells.get(&hash)
                    && Arc::ptr_eq(current, &cell)
                {
                    inner.cells.remove(&hash);
                    inner.order.retain(|h| *h != hash);
                }
            }
        }
        result
    }

    #[cfg(test)]
    fn cached(&self, hash: ConfigHash) -> bool {
        self.inner.lock().unwrap().cells.contains_key(&hash)
    }
}

/// Loads the compiled datapath object from disk with map pinning under
/// `<bpf_fs>/globals`, so the kernel creates and pins every missing table by
/// its versioned name.
pub struct ObjectLoader {
    object_path: PathBuf,
    bpf_fs: PathBuf,
}

impl ObjectLoader {
    pub fn new(object_path: PathBuf, bpf_fs: PathBuf) -> Self {
        Self {
            object_path,
            bpf_fs,
        }
    }
}

impl Compile for ObjectLoader {
    type Object = tokio::sync::Mutex<Ebpf>;

    fn compile(&self, _hash: ConfigHash) -> Result<Self::Object, LoadError> {
        let data = std::fs::read(&self.object_path).map_err(|e| {
            LoadError::Read(self.object_path.display().to_string(), e.to_string())
        })?;
        let mut ebpf = EbpfLoader::new()
            .map_pin_path(self.bpf_fs.join(GLOBALS_DIR))
            .load(&data)
            .map_err(|e| LoadError::Load(e.to_string()))?;
        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            warn!(%e, "failed to init ebpf logger");
        }
        Ok(tokio::sync::Mutex::new(ebpf))
    }
}

/// Adapter for the pinned-map backend: loading the template is what creates
/// and pins any missing table.
pub fn ensure_datapath<C>(
    cache: Arc<TemplateCache<C>>,
    hash: ConfigHash,
) -> crate::maps::bpf::EnsureDatapath
where
    C: Compile + Send + Sync + 'static,
    C::Object: Send + Sync,
{
    Arc::new(move || {
        cache
            .get_or_compile(hash)
            .map(|_| ())
            .map_err(|e| TableError::Create("datapath".into(), e.to_string()))
    })
}

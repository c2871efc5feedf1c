//! Bundles, the read interface to the build output, and the bundle cache.
//!
//! A [`Bundle`] is compiled script text plus its decoded source map. The
//! [`BundleCache`] loads each bundle once through a [`BundleSource`] and
//! shares it read-only with every render until it is invalidated.

use crate::error::{BundleLoadError, SourceMapParseError};
use crate::sourcemap::{GeneratedPosition, OriginalPosition, SourceMap};
use base64::Engine;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Raw bundle text as supplied by the build output.
#[derive(Debug, Clone)]
pub struct RawBundle {
    pub script: String,
    pub source_map: Option<String>,
}

/// Read interface to the build output.
pub trait BundleSource: Send + Sync {
    fn read(&self, id: &str) -> Result<RawBundle, BundleLoadError>;
}

/// Compiled script text plus its optional source map. Immutable once loaded.
#[derive(Debug)]
pub struct Bundle {
    id: String,
    code: String,
    source_map: Option<SourceMap>,
    source_map_error: Option<String>,
}

impl Bundle {
    pub fn new(id: impl Into<String>, code: impl Into<String>, source_map: Option<SourceMap>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            source_map,
            source_map_error: None,
        }
    }

    /// Build a bundle from raw text. A malformed source map degrades to
    /// "no translation available" and is logged, it never fails the load.
    pub fn from_raw(id: &str, raw: RawBundle) -> Self {
        let (source_map, source_map_error) = match raw.source_map.as_deref().map(SourceMap::parse) {
            None => (None, None),
            Some(Ok(map)) => (Some(map), None),
            Some(Err(err)) => {
                tracing::warn!(bundle = id, error = %err, "ignoring malformed source map");
                (None, Some(err.to_string()))
            }
        };

        Self {
            id: id.to_string(),
            code: raw.script,
            source_map,
            source_map_error,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn source_map(&self) -> Option<&SourceMap> {
        self.source_map.as_ref()
    }

    /// Why the source map was discarded, if it was.
    pub fn source_map_error(&self) -> Option<&str> {
        self.source_map_error.as_deref()
    }

    pub fn translate(&self, position: GeneratedPosition) -> Option<OriginalPosition> {
        self.source_map.as_ref()?.translate(position)
    }
}

// ============================================================================
// Directory Source
// ============================================================================

/// Reads bundles from a build output directory.
///
/// Security guarantees:
/// - No filesystem escape (path traversal blocked via canonicalization)
/// - Only .js files (classic scripts) are served
/// - Source maps are only read from inside the same directory
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, BundleLoadError> {
        let display = root.as_ref().display().to_string();
        let canonical = root
            .as_ref()
            .canonicalize()
            .map_err(|e| BundleLoadError::InvalidRoot {
                path: display.clone(),
                reason: e.to_string(),
            })?;

        if !canonical.is_dir() {
            return Err(BundleLoadError::InvalidRoot {
                path: display,
                reason: "not a directory".to_string(),
            });
        }

        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path inside the root, following symlinks.
    fn contained(&self, path: &Path) -> Option<PathBuf> {
        path.canonicalize()
            .ok()
            .filter(|canonical| canonical.starts_with(&self.root))
    }

    /// Bundles run as classic scripts, so ES module files are refused.
    fn is_extension_allowed(path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some("js")
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, BundleLoadError> {
        if id.contains("://") || id.starts_with("data:") || id.starts_with("blob:") {
            return Err(BundleLoadError::AccessDenied(id.to_string()));
        }

        let candidate = self.root.join(id.trim_start_matches('/'));
        if !Self::is_extension_allowed(&candidate) {
            return Err(BundleLoadError::InvalidExtension(id.to_string()));
        }

        let canonical = candidate.canonicalize().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BundleLoadError::NotFound(id.to_string()),
            _ => BundleLoadError::Io {
                id: id.to_string(),
                source: e,
            },
        })?;

        if !canonical.starts_with(&self.root) {
            return Err(BundleLoadError::AccessDenied(id.to_string()));
        }
        Ok(canonical)
    }

    fn read_source_map(&self, id: &str, script_path: &Path, script: &str) -> Option<String> {
        let mut sibling = script_path.as_os_str().to_owned();
        sibling.push(".map");
        if let Some(path) = self.contained(Path::new(&sibling)) {
            return read_optional(id, &path);
        }

        let url = source_mapping_url(script)?;
        if url.starts_with("data:") {
            return match decode_data_url(url) {
                Ok(text) => Some(text),
                Err(err) => {
                    tracing::warn!(bundle = id, error = %err, "ignoring inline source map");
                    None
                }
            };
        }

        let path = self.contained(&script_path.parent()?.join(url))?;
        read_optional(id, &path)
    }
}

fn read_optional(id: &str, path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::warn!(bundle = id, path = %path.display(), error = %err, "failed to read source map");
            None
        }
    }
}

/// The value of the last `//# sourceMappingURL=` comment, if any.
fn source_mapping_url(script: &str) -> Option<&str> {
    script.lines().rev().find_map(|line| {
        let line = line.trim();
        line.strip_prefix("//# sourceMappingURL=")
            .or_else(|| line.strip_prefix("//@ sourceMappingURL="))
            .map(str::trim)
            .filter(|url| !url.is_empty())
    })
}

fn decode_data_url(url: &str) -> Result<String, SourceMapParseError> {
    let (_, payload) = url
        .split_once(";base64,")
        .ok_or_else(|| SourceMapParseError::InlineUrl("only base64 data URLs are supported".into()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| SourceMapParseError::InlineUrl(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| SourceMapParseError::InlineUrl(e.to_string()))
}

impl BundleSource for DirectorySource {
    fn read(&self, id: &str) -> Result<RawBundle, BundleLoadError> {
        let path = self.resolve(id)?;
        let script = std::fs::read_to_string(&path).map_err(|e| BundleLoadError::Io {
            id: id.to_string(),
            source: e,
        })?;
        let source_map = self.read_source_map(id, &path, &script);

        Ok(RawBundle { script, source_map })
    }
}

// ============================================================================
// Memory Source
// ============================================================================

/// Bundles held in memory, pushed by the host (for example a build watcher).
#[derive(Default)]
pub struct MemorySource {
    bundles: RwLock<HashMap<String, RawBundle>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, script: impl Into<String>, source_map: Option<String>) {
        self.bundles.write().insert(
            id.into(),
            RawBundle {
                script: script.into(),
                source_map,
            },
        );
    }

    pub fn remove(&self, id: &str) -> bool {
        self.bundles.write().remove(id).is_some()
    }
}

impl BundleSource for MemorySource {
    fn read(&self, id: &str) -> Result<RawBundle, BundleLoadError> {
        self.bundles
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BundleLoadError::NotFound(id.to_string()))
    }
}

impl<S: BundleSource + ?Sized> BundleSource for Arc<S> {
    fn read(&self, id: &str) -> Result<RawBundle, BundleLoadError> {
        (**self).read(id)
    }
}

// ============================================================================
// Bundle Cache
// ============================================================================

type Slot = Arc<OnceCell<Arc<Bundle>>>;

/// Loaded bundles keyed by identifier.
///
/// Concurrent misses on the same key are single-flight: one caller loads,
/// the others block on the same slot and share its result. Failed loads are
/// not cached, and a failure is not shared either: each caller that was
/// waiting on the slot retries the load itself.
pub struct BundleCache {
    source: Box<dyn BundleSource>,
    slots: RwLock<HashMap<String, Slot>>,
}

impl BundleCache {
    pub fn new(source: impl BundleSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_load(&self, id: &str) -> Result<Arc<Bundle>, BundleLoadError> {
        let slot = self.slot(id);
        if let Some(bundle) = slot.get() {
            tracing::debug!(bundle = id, "bundle cache hit");
            return Ok(Arc::clone(bundle));
        }

        let loaded = slot.get_or_try_init(|| {
            tracing::debug!(bundle = id, "bundle cache miss, loading");
            let raw = self.source.read(id)?;
            Ok::<_, BundleLoadError>(Arc::new(Bundle::from_raw(id, raw)))
        });

        match loaded {
            Ok(bundle) => Ok(Arc::clone(bundle)),
            Err(err) => {
                self.discard_empty(id, &slot);
                Err(err)
            }
        }
    }

    fn slot(&self, id: &str) -> Slot {
        if let Some(slot) = self.slots.read().get(id) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(id.to_string()).or_default())
    }

    fn discard_empty(&self, id: &str, slot: &Slot) {
        let mut slots = self.slots.write();
        if slots
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && current.get().is_none())
        {
            slots.remove(id);
        }
    }

    /// Drop a bundle so the next render reloads it (e.g. after a rebuild).
    pub fn invalidate(&self, id: &str) -> bool {
        self.slots.write().remove(id).is_some()
    }

    pub fn invalidate_all(&self) {
        self.slots.write().clear();
    }

    /// Number of loaded bundles.
    pub fn len(&self) -> usize {
        self.slots.read().values().filter(|s| s.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;
    use tempfile::tempdir;

    const MAP: &str = r#"{"version":3,"sources":["App.tsx"],"names":[],"mappings":"AAAA"}"#;

    #[test]
    fn test_directory_reads_bundle_and_sibling_map() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("entry.js"), "var x = 1;").unwrap();
        fs::write(dir.path().join("entry.js.map"), MAP).unwrap();

        let source = DirectorySource::new(dir.path()).unwrap();
        let raw = source.read("entry.js").unwrap();
        assert_eq!(raw.script, "var x = 1;");
        assert_eq!(raw.source_map.as_deref(), Some(MAP));
    }

    #[test]
    fn test_directory_reads_mapping_url_comment() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("maps")).unwrap();
        fs::write(dir.path().join("maps/app.map"), MAP).unwrap();
        fs::write(
            dir.path().join("app.js"),
            "var x = 1;\n//# sourceMappingURL=maps/app.map\n",
        )
        .unwrap();

        let encoded = base64::engine::general_purpose::STANDARD.encode(MAP);
        fs::write(
            dir.path().join("inline.js"),
            format!("var y;\n//# sourceMappingURL=data:application/json;base64,{}", encoded),
        )
        .unwrap();

        let source = DirectorySource::new(dir.path()).unwrap();
        assert_eq!(source.read("app.js").unwrap().source_map.as_deref(), Some(MAP));
        assert_eq!(source.read("inline.js").unwrap().source_map.as_deref(), Some(MAP));
    }

    #[test]
    fn test_directory_blocks_escape_and_non_js() {
        let outer = tempdir().unwrap();
        let root = outer.path().join("dist");
        fs::create_dir(&root).unwrap();
        fs::write(outer.path().join("secret.js"), "leak").unwrap();
        fs::write(root.join("data.json"), "{}").unwrap();

        let source = DirectorySource::new(&root).unwrap();
        assert!(matches!(
            source.read("../secret.js"),
            Err(BundleLoadError::AccessDenied(_))
        ));
        assert!(matches!(
            source.read("https://evil.com/payload.js"),
            Err(BundleLoadError::AccessDenied(_))
        ));
        assert!(matches!(
            source.read("data.json"),
            Err(BundleLoadError::InvalidExtension(_))
        ));
        fs::write(root.join("entry.mjs"), "export const x = 1;").unwrap();
        assert!(matches!(
            source.read("entry.mjs"),
            Err(BundleLoadError::InvalidExtension(_))
        ));
        assert!(matches!(
            source.read("missing.js"),
            Err(BundleLoadError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_root() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file.js");
        fs::write(&file, "").unwrap();
        assert!(matches!(
            DirectorySource::new(&file),
            Err(BundleLoadError::InvalidRoot { .. })
        ));
    }

    #[test]
    fn test_malformed_map_degrades() {
        let source = MemorySource::new();
        source.insert("a.js", "var a;", Some("{broken".to_string()));
        let cache = BundleCache::new(source);

        let bundle = cache.get_or_load("a.js").unwrap();
        assert_eq!(bundle.code(), "var a;");
        assert!(bundle.source_map().is_none());
        assert!(bundle.source_map_error().is_some());
        assert!(bundle.translate(GeneratedPosition::new(0, 0)).is_none());
    }

    #[test]
    fn test_hit_returns_same_bundle_and_invalidate_reloads() {
        let source = Arc::new(MemorySource::new());
        source.insert("a.js", "var v = 1;", None);
        let cache = BundleCache::new(Arc::clone(&source));

        let first = cache.get_or_load("a.js").unwrap();
        let second = cache.get_or_load("a.js").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        source.insert("a.js", "var v = 2;", None);
        assert_eq!(cache.get_or_load("a.js").unwrap().code(), "var v = 1;");

        assert!(cache.invalidate("a.js"));
        assert_eq!(cache.get_or_load("a.js").unwrap().code(), "var v = 2;");
        assert_eq!(cache.len(), 1);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failures_are_not_cached() {
        let source = Arc::new(MemorySource::new());
        let cache = BundleCache::new(Arc::clone(&source));

        assert!(matches!(
            cache.get_or_load("late.js"),
            Err(BundleLoadError::NotFound(_))
        ));
        source.insert("late.js", "var late;", None);
        assert!(cache.get_or_load("late.js").is_ok());
    }

    struct SlowSource {
        reads: AtomicUsize,
    }

    impl BundleSource for SlowSource {
        fn read(&self, id: &str) -> Result<RawBundle, BundleLoadError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            Ok(RawBundle {
                script: format!("// {}", id),
                source_map: Some(MAP.to_string()),
            })
        }
    }

    #[test]
    fn test_concurrent_misses_are_single_flight() {
        let source = Arc::new(SlowSource {
            reads: AtomicUsize::new(0),
        });
        let cache = Arc::new(BundleCache::new(Arc::clone(&source)));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_load("shared.js").unwrap()
                })
            })
            .collect();

        let bundles: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
        assert!(bundles.iter().all(|b| Arc::ptr_eq(b, &bundles[0])));
        assert!(bundles[0].source_map().is_some());
    }
}

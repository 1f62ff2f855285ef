//! Import detectors and I/O class registration.
//!
//! Everything pluggable registers here at startup, from a compile-time
//! table: the built-in I/O classes are always present, and the config's
//! `extensions` list enables optional pieces by name. An unknown name
//! aborts startup.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::config::{Config, ImportConfig};
use crate::error::{DaemonError, DaemonResult};
use crate::io::default::{DefaultGroupIO, DefaultNodeIO};
use crate::io::polling::new_polling_node_io;
use crate::io::transport::TransportGroupIO;
use crate::io::{GroupIO, GroupIoCtx, NodeIO, NodeIoCtx};

/// How a detector wants a path imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub acq_name: String,
    pub file_name: String,
}

/// Decides whether a path is acquisition data.
///
/// Detectors run in registration order; the first to accept a path wins.
/// A detector that fails internally should decline, never abort the
/// import.
pub trait ImportDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Splits `path` (node-relative) into acquisition and file names, or
    /// declines.
    fn detect(&self, path: &str) -> Option<Detection>;
}

pub type NodeIoFactory = fn(NodeIoCtx) -> DaemonResult<Arc<dyn NodeIO>>;
pub type GroupIoFactory = fn(GroupIoCtx) -> DaemonResult<Arc<dyn GroupIO>>;

pub struct Registry {
    detectors: Vec<Arc<dyn ImportDetector>>,
    node_io: HashMap<String, NodeIoFactory>,
    group_io: HashMap<String, GroupIoFactory>,
}

impl Registry {
    /// A registry holding only the built-in I/O classes.
    pub fn new() -> Self {
        let mut registry = Self {
            detectors: Vec::new(),
            node_io: HashMap::new(),
            group_io: HashMap::new(),
        };

        registry.register_node_io("Default", DefaultNodeIO::new);
        registry.register_node_io("Polling", new_polling_node_io);
        // Transport is a group-level concept; its nodes do Default I/O
        registry.register_node_io("Transport", DefaultNodeIO::new);

        registry.register_group_io("Default", DefaultGroupIO::new);
        registry.register_group_io("Polling", DefaultGroupIO::new);
        registry.register_group_io("Transport", TransportGroupIO::new);

        registry
    }

    /// Builds the registry for a configuration, loading its extensions.
    pub fn load(config: &Config) -> DaemonResult<Self> {
        let mut registry = Self::new();

        for name in &config.extensions {
            match name.as_str() {
                "pattern-import" => {
                    let detector = PatternDetector::from_config(&config.import)?;
                    registry.register_detector(Arc::new(detector));
                }
                _ => {
                    return Err(DaemonError::UnknownExtension { name: name.clone() });
                }
            }
            tracing::info!("Loaded extension: {}", name);
        }

        Ok(registry)
    }

    pub fn register_detector(&mut self, detector: Arc<dyn ImportDetector>) {
        self.detectors.push(detector);
    }

    pub fn register_node_io(&mut self, name: impl Into<String>, factory: NodeIoFactory) {
        self.node_io.insert(name.into(), factory);
    }

    pub fn register_group_io(&mut self, name: impl Into<String>, factory: GroupIoFactory) {
        self.group_io.insert(name.into(), factory);
    }

    /// The registered detectors, in registration order.
    pub fn detectors(&self) -> &[Arc<dyn ImportDetector>] {
        &self.detectors
    }

    /// Looks up a node I/O class. `None` means "Default".
    pub fn node_io(&self, class: Option<&str>) -> DaemonResult<NodeIoFactory> {
        let name = class.unwrap_or("Default");
        self.node_io
            .get(name)
            .copied()
            .ok_or_else(|| DaemonError::NoSuchIoClass {
                name: name.to_owned(),
            })
    }

    /// Looks up a group I/O class. `None` means "Default".
    pub fn group_io(&self, class: Option<&str>) -> DaemonResult<GroupIoFactory> {
        let name = class.unwrap_or("Default");
        self.group_io
            .get(name)
            .copied()
            .ok_or_else(|| DaemonError::NoSuchIoClass {
                name: name.to_owned(),
            })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// The built-in `pattern-import` detector.
///
/// Splits a path into acquisition and file name wherever the acquisition
/// part matches one of the configured patterns; the longest matching
/// acquisition prefix wins. Patterns are implicitly anchored.
pub struct PatternDetector {
    acq_patterns: Vec<Regex>,
    file_patterns: Vec<Regex>,
}

impl PatternDetector {
    pub fn from_config(config: &ImportConfig) -> DaemonResult<Self> {
        if config.acq_patterns.is_empty() {
            return Err(DaemonError::InvalidIoConfig(anyhow::anyhow!(
                "pattern-import requires at least one entry in import.acq-patterns"
            )));
        }

        Ok(Self {
            acq_patterns: compile_anchored(&config.acq_patterns)?,
            file_patterns: compile_anchored(&config.file_patterns)?,
        })
    }
}

fn compile_anchored(patterns: &[String]) -> DaemonResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("^(?:{})$", p))
                .map_err(|e| DaemonError::InvalidIoConfig(anyhow::anyhow!("bad pattern: {}", e)))
        })
        .collect()
}

impl ImportDetector for PatternDetector {
    fn name(&self) -> &'static str {
        "pattern-import"
    }

    fn detect(&self, path: &str) -> Option<Detection> {
        let components: Vec<&str> = path.split('/').collect();
        if components.len() < 2 {
            // A bare filename has no acquisition prefix
            return None;
        }

        // Longest acquisition prefix first
        for split in (1..components.len()).rev() {
            let acq_name = components[..split].join("/");
            let file_name = components[split..].join("/");

            if !self.acq_patterns.iter().any(|p| p.is_match(&acq_name)) {
                continue;
            }

            if !self.file_patterns.is_empty()
                && !self.file_patterns.iter().any(|p| p.is_match(&file_name))
            {
                continue;
            }

            return Some(Detection {
                acq_name,
                file_name,
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::load_config_from_str;

    fn pattern_detector(acq: &[&str], file: &[&str]) -> PatternDetector {
        PatternDetector::from_config(&ImportConfig {
            acq_patterns: acq.iter().map(|s| s.to_string()).collect(),
            file_patterns: file.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_pattern_detection() {
        let detector = pattern_detector(&[r"\d{4}/\d{2}/\d{2}"], &[]);

        assert_eq!(
            detector.detect("2025/02/21/meta.txt"),
            Some(Detection {
                acq_name: "2025/02/21".to_string(),
                file_name: "meta.txt".to_string(),
            })
        );

        // Nested file names stay with the file part
        assert_eq!(
            detector.detect("2025/02/21/sub/data.bin"),
            Some(Detection {
                acq_name: "2025/02/21".to_string(),
                file_name: "sub/data.bin".to_string(),
            })
        );

        assert_eq!(detector.detect("notes/meta.txt"), None);
        assert_eq!(detector.detect("meta.txt"), None);
    }

    #[test]
    fn test_file_patterns_restrict() {
        let detector = pattern_detector(&[r"\d{4}/\d{2}/\d{2}"], &[r".*\.txt"]);

        assert!(detector.detect("2025/02/21/meta.txt").is_some());
        assert!(detector.detect("2025/02/21/data.bin").is_none());
    }

    #[test]
    fn test_longest_acq_prefix_wins() {
        let detector = pattern_detector(&[r"a", r"a/b"], &[]);

        assert_eq!(
            detector.detect("a/b/c.dat").unwrap().acq_name,
            "a/b".to_string()
        );
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let result = PatternDetector::from_config(&ImportConfig {
            acq_patterns: vec!["(unclosed".to_string()],
            file_patterns: vec![],
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_builtin_classes() {
        let registry = Registry::new();

        assert!(registry.node_io(None).is_ok());
        assert!(registry.node_io(Some("Default")).is_ok());
        assert!(registry.node_io(Some("Polling")).is_ok());
        assert!(registry.group_io(Some("Transport")).is_ok());
        assert!(matches!(
            registry.node_io(Some("LustreHSM")),
            Err(DaemonError::NoSuchIoClass { .. })
        ));
    }

    #[test]
    fn test_registry_load_unknown_extension() {
        let config = load_config_from_str(
            "database:\n  url: \"sqlite::memory:\"\nextensions:\n  - no-such-extension\n",
        )
        .unwrap();

        assert!(matches!(
            Registry::load(&config),
            Err(DaemonError::UnknownExtension { .. })
        ));
    }

    #[test]
    fn test_registry_load_pattern_import() {
        let config = load_config_from_str(
            "database:\n  url: \"sqlite::memory:\"\n\
             extensions:\n  - pattern-import\n\
             import:\n  acq-patterns:\n    - '\\d{4}/\\d{2}/\\d{2}'\n",
        )
        .unwrap();

        let registry = Registry::load(&config).unwrap();
        assert_eq!(registry.detectors().len(), 1);
        assert!(registry.detectors()[0].detect("2025/02/21/meta.txt").is_some());
    }
}

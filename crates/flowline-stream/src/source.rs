use std::path::PathBuf;

use futures::future::BoxFuture;
use tracing::debug;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::spec::GraphSpec;
use flowline_core::traits::SpecSource;

/// Loads `<dir>/<graph_id>.json`.
pub struct DirSpecSource {
    dir: PathBuf,
}

impl DirSpecSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, graph_id: &str) -> Option<PathBuf> {
        let valid = !graph_id.is_empty()
            && graph_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !graph_id.starts_with('.');
        valid.then(|| self.dir.join(format!("{}.json", graph_id)))
    }
}

impl SpecSource for DirSpecSource {
    fn load(&self, graph_id: &str) -> BoxFuture<'_, Result<GraphSpec>> {
        let path = self.path_for(graph_id);
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            let path = path.ok_or_else(|| FlowlineError::SpecNotFound(graph_id.clone()))?;
            debug!(path = %path.display(), "Loading graph spec");
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FlowlineError::SpecNotFound(graph_id))
                }
                Err(e) => return Err(e.into()),
            };
            GraphSpec::from_json(&raw)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_test_utils::fixtures;

    #[tokio::test]
    async fn test_loads_spec_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let raw = serde_json::to_string(&fixtures::linear()).unwrap();
        std::fs::write(dir.path().join("linear.json"), raw).unwrap();

        let source = DirSpecSource::new(dir.path());
        let spec = source.load("linear").await.unwrap();
        assert_eq!(spec.node_names(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_missing_and_unsafe_ids_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirSpecSource::new(dir.path());
        for id in ["absent", "../etc/passwd", "", ".hidden"] {
            let err = source.load(id).await.unwrap_err();
            assert!(matches!(err, FlowlineError::SpecNotFound(_)), "{}", id);
        }
    }

    #[tokio::test]
    async fn test_malformed_spec_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        let err = DirSpecSource::new(dir.path()).load("broken").await.unwrap_err();
        assert!(matches!(err, FlowlineError::SpecParse(_)));
    }
}

//! Reference rebuild: analyzer output into the reference registry.
//!
//! For each unit of a job the task analyzes every affected artifact with no
//! index lock held, resolves target beans, then swaps the fresh references in
//! under a single write lock and fires one change notification.
//!
//! Stale references are cleared for the analyzed artifacts and for the
//! declaring file of every definition the analyzer returned. An artifact whose
//! analysis fails is still cleared, so it contributes nothing until the next
//! successful rebuild.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::adapter::{AspectAnalyzer, UnitBeans};
use crate::registry::ReferenceRegistry;
use crate::scheduler::{CancelToken, RebuildTask};
use crate::types::{ArtifactPath, UnitId};

pub struct ReferenceRebuild {
    registry: Arc<ReferenceRegistry>,
    analyzer: Arc<dyn AspectAnalyzer>,
}

impl ReferenceRebuild {
    pub fn new(registry: Arc<ReferenceRegistry>, analyzer: Arc<dyn AspectAnalyzer>) -> Self {
        ReferenceRebuild { registry, analyzer }
    }
}

impl RebuildTask for ReferenceRebuild {
    fn name(&self) -> &str {
        "references"
    }

    fn rebuild_unit(&self, unit: &UnitId, artifacts: &BTreeSet<ArtifactPath>, cancel: &CancelToken) {
        let seen = self.registry.get(unit);
        let beans = UnitBeans::new(self.analyzer.as_ref(), unit);

        let mut cleared: Vec<ArtifactPath> = Vec::new();
        let mut fresh = Vec::new();
        let mut failed = 0usize;
        for artifact in artifacts {
            if cancel.is_cancelled() {
                debug!(unit = %unit, artifact = %artifact, "reference rebuild cancelled");
                break;
            }
            if !cleared.contains(artifact) {
                cleared.push(artifact.clone());
            }
            match self.analyzer.analyze(unit, artifact) {
                Ok(result) => {
                    for definition in &result.definitions {
                        if !cleared.contains(&definition.file) {
                            cleared.push(definition.file.clone());
                        }
                    }
                    for reference in result.references {
                        reference.resolve_bean(&beans);
                        fresh.push(reference);
                    }
                }
                Err(e) => {
                    failed += 1;
                    warn!(unit = %unit, artifact = %artifact, error = %e, "aspect analysis failed");
                }
            }
        }

        if cleared.is_empty() {
            return;
        }
        let Some(index) = self.registry.commit_target(unit, seen.as_ref()) else {
            debug!(unit = %unit, "unit removed during reference rebuild, discarding");
            return;
        };
        let added = index.replace_artifacts(&cleared, fresh);
        debug!(
            unit = %unit,
            artifacts = cleared.len(),
            references = added,
            failed,
            "references rebuilt"
        );
        self.registry.notify_changed();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AnalysisResult, AnalyzerError};
    use crate::definition::{Advice, Definition, DefinitionOrigin};
    use crate::index::UnitStore;
    use crate::persistence::MemoryStateStore;
    use crate::reference::Reference;
    use crate::registry::Registry;
    use crate::types::{BeanRef, Member};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted analyzer: artifact -> canned result, missing entries fail.
    #[derive(Default)]
    struct Scripted {
        results: Mutex<HashMap<String, AnalysisResult>>,
    }

    impl Scripted {
        fn set(&self, artifact: &str, result: AnalysisResult) {
            self.results.lock().insert(artifact.to_string(), result);
        }
    }

    impl AspectAnalyzer for Scripted {
        fn analyze(&self, _unit: &UnitId, artifact: &ArtifactPath) -> Result<AnalysisResult, AnalyzerError> {
            self.results
                .lock()
                .get(artifact.as_str())
                .cloned()
                .ok_or_else(|| AnalyzerError::failed(artifact, "malformed"))
        }

        fn resolve_bean(&self, _unit: &UnitId, bean_id: &str) -> Option<BeanRef> {
            let name = if bean_id == "serviceAlias" { "serviceBean" } else { bean_id };
            Some(BeanRef::new(name, "beans.xml", 3))
        }
    }

    fn logging(def_file: &str, line: u32, beans: &[&str]) -> AnalysisResult {
        let mut result = AnalysisResult::new();
        let def = result.define(
            Definition::new(DefinitionOrigin::Xml, "com.acme.LoggingAspect", "log", def_file, Advice::Around)
                .with_aspect_name("LoggingAspect")
                .with_lines(line, line + 2),
        );
        for bean in beans {
            result.push(
                Reference::new(
                    Arc::clone(&def),
                    Member::method("com.acme.Service", "doWork", "src/Service.java"),
                    "src/Service.java",
                )
                .with_target_bean(*bean, "beans.xml", 3),
            );
        }
        result
    }

    fn setup() -> (Arc<ReferenceRegistry>, Arc<Scripted>, ReferenceRebuild) {
        let registry: Arc<ReferenceRegistry> =
            Arc::new(Registry::new("references", Box::new(MemoryStateStore::new())));
        let analyzer = Arc::new(Scripted::default());
        let task = ReferenceRebuild::new(Arc::clone(&registry), analyzer.clone());
        (registry, analyzer, task)
    }

    fn artifacts(paths: &[&str]) -> BTreeSet<ArtifactPath> {
        paths.iter().map(|p| ArtifactPath::from(*p)).collect()
    }

    #[test]
    fn aliases_collapse_after_resolution() {
        let (registry, analyzer, task) = setup();
        analyzer.set("aspects.xml", logging("aspects.xml", 10, &["serviceBean", "serviceAlias"]));
        task.rebuild_unit(&UnitId::new("p"), &artifacts(&["aspects.xml"]), &CancelToken::new());
        assert_eq!(registry.all_references_in_workspace().len(), 1);
    }

    #[test]
    fn rebuild_replaces_previous_references() {
        let (registry, analyzer, task) = setup();
        let unit = UnitId::new("p");
        analyzer.set("aspects.xml", logging("aspects.xml", 10, &["serviceBean"]));
        task.rebuild_unit(&unit, &artifacts(&["aspects.xml"]), &CancelToken::new());

        analyzer.set("aspects.xml", logging("aspects.xml", 20, &["serviceBean"]));
        task.rebuild_unit(&unit, &artifacts(&["aspects.xml"]), &CancelToken::new());

        let all = registry.all_references_in_workspace();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].definition.start_line, 20);
    }

    #[test]
    fn failed_analysis_clears_artifact() {
        let (registry, analyzer, task) = setup();
        let unit = UnitId::new("p");
        analyzer.set("aspects.xml", logging("aspects.xml", 10, &["serviceBean"]));
        task.rebuild_unit(&unit, &artifacts(&["aspects.xml"]), &CancelToken::new());
        assert_eq!(registry.all_references_in_workspace().len(), 1);

        analyzer.results.lock().clear();
        task.rebuild_unit(&unit, &artifacts(&["aspects.xml"]), &CancelToken::new());
        assert!(registry.all_references_in_workspace().is_empty());
        assert!(registry.contains(&unit));
    }

    #[test]
    fn definition_files_are_cleared_too() {
        let (registry, analyzer, task) = setup();
        let unit = UnitId::new("p");
        // The annotated aspect was first seen while analyzing its own file.
        analyzer.set("src/Aspect.java", logging("src/Aspect.java", 10, &["serviceBean"]));
        task.rebuild_unit(&unit, &artifacts(&["src/Aspect.java"]), &CancelToken::new());

        // A config change re-discovers the same aspect with a moved advice.
        analyzer.set("beans.xml", logging("src/Aspect.java", 40, &["serviceBean"]));
        task.rebuild_unit(&unit, &artifacts(&["beans.xml"]), &CancelToken::new());

        let lines: Vec<_> = registry
            .all_references_in_workspace()
            .iter()
            .map(|r| r.definition.start_line)
            .collect();
        assert_eq!(lines, vec![40]);
    }

    #[test]
    fn cancelled_token_writes_nothing() {
        let (registry, analyzer, task) = setup();
        analyzer.set("aspects.xml", logging("aspects.xml", 10, &["serviceBean"]));
        let cancel = CancelToken::new();
        cancel.cancel();
        task.rebuild_unit(&UnitId::new("p"), &artifacts(&["aspects.xml"]), &cancel);
        assert!(registry.all_references_in_workspace().is_empty());
    }

    #[test]
    fn removed_unit_discards_writes() {
        struct Removing {
            registry: Arc<ReferenceRegistry>,
            inner: Scripted,
        }

        impl AspectAnalyzer for Removing {
            fn analyze(&self, unit: &UnitId, artifact: &ArtifactPath) -> Result<AnalysisResult, AnalyzerError> {
                self.registry.remove(unit);
                self.inner.analyze(unit, artifact)
            }
        }

        let registry: Arc<ReferenceRegistry> =
            Arc::new(Registry::new("references", Box::new(MemoryStateStore::new())));
        let inner = Scripted::default();
        inner.set("aspects.xml", logging("aspects.xml", 10, &["serviceBean"]));
        let analyzer = Arc::new(Removing {
            registry: Arc::clone(&registry),
            inner,
        });
        let task = ReferenceRebuild::new(Arc::clone(&registry), analyzer);
        let unit = UnitId::new("p");
        registry.get_or_create(&unit);
        task.rebuild_unit(&unit, &artifacts(&["aspects.xml"]), &CancelToken::new());

        assert!(!registry.contains(&unit));
        assert!(registry.get_or_create(&unit).is_empty());
    }

    #[test]
    fn retired_unit_is_not_recreated() {
        let (registry, analyzer, task) = setup();
        let unit = UnitId::new("closed");
        analyzer.set("aspects.xml", logging("aspects.xml", 10, &["serviceBean"]));
        registry.retire(&unit);
        task.rebuild_unit(&unit, &artifacts(&["aspects.xml"]), &CancelToken::new());
        assert!(!registry.contains(&unit));
        assert!(registry.all_references_in_workspace().is_empty());
    }

    #[test]
    fn multi_artifact_job_clears_all_before_inserting() {
        let (registry, analyzer, task) = setup();
        let unit = UnitId::new("p");
        // The config file re-discovers the annotated aspect; the aspect file
        // itself yields nothing new in the same job.
        analyzer.set("beans.xml", logging("src/Aspect.java", 10, &["serviceBean"]));
        analyzer.set("src/Aspect.java", AnalysisResult::new());
        task.rebuild_unit(&unit, &artifacts(&["beans.xml", "src/Aspect.java"]), &CancelToken::new());

        let all = registry.all_references_in_workspace();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].definition.file, ArtifactPath::from("src/Aspect.java"));
    }

    #[test]
    fn cancelled_before_start_materializes_nothing() {
        let (registry, analyzer, task) = setup();
        analyzer.set("aspects.xml", logging("aspects.xml", 10, &["serviceBean"]));
        let cancel = CancelToken::new();
        cancel.cancel();
        let unit = UnitId::new("p");
        task.rebuild_unit(&unit, &artifacts(&["aspects.xml"]), &cancel);
        assert!(!registry.contains(&unit));
    }
}

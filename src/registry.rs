//! Stage registry.
//!
//! Each artifact type declares an ordered stage sequence, resolved once when
//! the registry is built. Workers iterate the sequence; progress math and
//! resume points come from ordinal lookups, never from scanning name lists.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::ArtifactType;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct PipelineConfig {
    pipeline: PipelineMeta,
}

/// A pipeline descriptor: the ordered stages for one artifact type, with
/// optional shell commands backing individual stages.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineMeta {
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub stages: Vec<String>,
    /// stage name -> executable invoked by the command handler.
    #[serde(default)]
    pub commands: HashMap<String, PathBuf>,
}

// ---------------------------------------------------------------------------
// Stage Sequence
// ---------------------------------------------------------------------------

/// The resolved, ordered stage list for one artifact type.
#[derive(Debug)]
pub struct StageSequence {
    artifact_type: ArtifactType,
    stages: Vec<String>,
    positions: HashMap<String, usize>,
}

impl StageSequence {
    /// Build a sequence, rejecting empty or duplicated stage lists.
    pub fn new(artifact_type: ArtifactType, stages: Vec<String>) -> Result<Self> {
        if stages.is_empty() {
            return Err(Error::Config(format!(
                "pipeline for {artifact_type} declares no stages"
            )));
        }
        let mut positions = HashMap::with_capacity(stages.len());
        for (idx, stage) in stages.iter().enumerate() {
            if positions.insert(stage.clone(), idx).is_some() {
                return Err(Error::Config(format!(
                    "pipeline for {artifact_type} repeats stage {stage:?}"
                )));
            }
        }
        Ok(Self {
            artifact_type,
            stages,
            positions,
        })
    }

    pub fn artifact_type(&self) -> ArtifactType {
        self.artifact_type
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Zero-based position of a stage, O(1).
    pub fn position(&self, stage: &str) -> Option<usize> {
        self.positions.get(stage).copied()
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.positions.contains_key(stage)
    }

    /// The first stage without a recorded timing. A retried artifact resumes
    /// here instead of re-running stages that already succeeded. `None` means
    /// every stage has a timing.
    pub fn resume_point(&self, timings: &BTreeMap<String, f64>) -> Option<&str> {
        self.stages
            .iter()
            .find(|stage| !timings.contains_key(stage.as_str()))
            .map(|s| s.as_str())
    }

    /// The suffix of the sequence starting at `stage`. Empty when the stage
    /// is unknown.
    pub fn stages_from(&self, stage: &str) -> &[String] {
        match self.position(stage) {
            Some(idx) => &self.stages[idx..],
            None => &[],
        }
    }

    /// Progress through the sequence while `current` executes, as a
    /// percentage clamped to [0, 100]. Ordinals are one-based: an artifact
    /// on stage 2 of 4 reports 50. No current stage reports 0.
    pub fn progress_percent(&self, current: Option<&str>) -> f64 {
        let Some(stage) = current else {
            return 0.0;
        };
        match self.position(stage) {
            Some(idx) => (((idx + 1) as f64 / self.stages.len() as f64) * 100.0).clamp(0.0, 100.0),
            None => 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage Registry
// ---------------------------------------------------------------------------

/// Registry of stage sequences, one per artifact type.
pub struct StageRegistry {
    sequences: HashMap<ArtifactType, Arc<StageSequence>>,
    commands: HashMap<ArtifactType, HashMap<String, PathBuf>>,
}

impl StageRegistry {
    /// The built-in pipelines for the four artifact families.
    pub fn builtin() -> Self {
        let mut registry = Self {
            sequences: HashMap::new(),
            commands: HashMap::new(),
        };
        for (ty, stages) in [
            (
                ArtifactType::Document,
                &["extract", "ocr", "translate", "summarize", "index"][..],
            ),
            (
                ArtifactType::Audio,
                &["transcode", "transcribe", "translate", "summarize", "index"][..],
            ),
            (
                ArtifactType::Video,
                &[
                    "extract_audio",
                    "transcribe",
                    "face_match",
                    "summarize",
                    "index",
                ][..],
            ),
            (ArtifactType::Cdr, &["parse", "normalize", "link_graph"][..]),
        ] {
            let stages = stages.iter().map(|s| s.to_string()).collect();
            // Built-in lists are non-empty and unique; new() cannot fail here.
            if let Ok(seq) = StageSequence::new(ty, stages) {
                registry.sequences.insert(ty, Arc::new(seq));
            }
        }
        registry
    }

    /// Built-in pipelines overridden by any `.toml` descriptors in `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::builtin();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read pipeline dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let config: PipelineConfig = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad pipeline descriptor {}: {e}", path.display()))
                })?;
                registry.register(config.pipeline)?;
            }
        }

        Ok(registry)
    }

    /// Install one descriptor, replacing the sequence for its type.
    pub fn register(&mut self, meta: PipelineMeta) -> Result<()> {
        let seq = StageSequence::new(meta.artifact_type, meta.stages)?;
        for stage in meta.commands.keys() {
            if !seq.contains(stage) {
                return Err(Error::UnknownStage {
                    stage: stage.clone(),
                    artifact_type: meta.artifact_type.to_string(),
                });
            }
        }
        self.sequences.insert(meta.artifact_type, Arc::new(seq));
        self.commands.insert(meta.artifact_type, meta.commands);
        Ok(())
    }

    /// Look up the sequence for an artifact type.
    pub fn sequence(&self, artifact_type: ArtifactType) -> Option<Arc<StageSequence>> {
        self.sequences.get(&artifact_type).cloned()
    }

    /// Executable configured for a stage, if the descriptor named one.
    pub fn stage_command(&self, artifact_type: ArtifactType, stage: &str) -> Option<&Path> {
        self.commands
            .get(&artifact_type)?
            .get(stage)
            .map(|p| p.as_path())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_covers_every_artifact_type() {
        let registry = StageRegistry::builtin();
        for ty in ArtifactType::ALL {
            let seq = registry.sequence(ty).unwrap();
            assert!(!seq.is_empty());
            assert_eq!(seq.artifact_type(), ty);
        }
    }

    #[test]
    fn positions_are_ordinal() {
        let seq = StageSequence::new(
            ArtifactType::Document,
            vec!["a".into(), "b".into(), "c".into()],
        )
        .unwrap();
        assert_eq!(seq.position("a"), Some(0));
        assert_eq!(seq.position("c"), Some(2));
        assert_eq!(seq.position("missing"), None);
        assert_eq!(seq.stages_from("b"), &["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn resume_point_skips_timed_stages() {
        let seq = StageSequence::new(
            ArtifactType::Audio,
            vec!["a".into(), "b".into(), "c".into()],
        )
        .unwrap();

        let mut timings = BTreeMap::new();
        assert_eq!(seq.resume_point(&timings), Some("a"));

        timings.insert("a".to_string(), 1.5);
        assert_eq!(seq.resume_point(&timings), Some("b"));

        timings.insert("b".to_string(), 0.2);
        timings.insert("c".to_string(), 0.9);
        assert_eq!(seq.resume_point(&timings), None);
    }

    #[test]
    fn progress_is_one_based_and_clamped() {
        let seq = StageSequence::new(
            ArtifactType::Cdr,
            vec!["parse".into(), "normalize".into(), "link_graph".into(), "publish".into()],
        )
        .unwrap();
        assert_eq!(seq.progress_percent(None), 0.0);
        assert_eq!(seq.progress_percent(Some("parse")), 25.0);
        assert_eq!(seq.progress_percent(Some("normalize")), 50.0);
        assert_eq!(seq.progress_percent(Some("publish")), 100.0);
        assert_eq!(seq.progress_percent(Some("bogus")), 0.0);
    }

    #[test]
    fn empty_and_duplicate_sequences_are_rejected() {
        assert!(StageSequence::new(ArtifactType::Video, vec![]).is_err());
        assert!(
            StageSequence::new(ArtifactType::Video, vec!["x".into(), "x".into()]).is_err()
        );
    }

    #[test]
    fn descriptor_commands_must_name_declared_stages() {
        let mut registry = StageRegistry::builtin();
        let mut commands = HashMap::new();
        commands.insert("nope".to_string(), PathBuf::from("/bin/true"));
        let meta = PipelineMeta {
            artifact_type: ArtifactType::Document,
            stages: vec!["extract".into(), "index".into()],
            commands,
        };
        assert!(matches!(
            registry.register(meta),
            Err(Error::UnknownStage { .. })
        ));
    }

    #[test]
    fn descriptor_overrides_builtin_sequence() {
        let mut registry = StageRegistry::builtin();
        let meta = PipelineMeta {
            artifact_type: ArtifactType::Cdr,
            stages: vec!["parse".into(), "link_graph".into()],
            commands: HashMap::new(),
        };
        registry.register(meta).unwrap();
        let seq = registry.sequence(ArtifactType::Cdr).unwrap();
        assert_eq!(seq.len(), 2);
    }
}

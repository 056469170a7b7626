//! Pluggable stage handlers.
//!
//! The orchestrator does not know what a stage computes, only that it ran,
//! how long it took, and whether it succeeded. A handler receives the
//! artifact context and reports success, failure, or a shared-downstream
//! signal that parks the artifact until the cross-artifact stage covers it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ArtifactId, ArtifactType, JobId};
use crate::registry::StageRegistry;

/// Context handed to a stage handler. The source reference and options are
/// opaque pass-through from submission.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub job_id: JobId,
    pub artifact_id: ArtifactId,
    pub artifact_type: ArtifactType,
    pub filename: String,
    pub source_ref: String,
    pub stage: String,
    pub options: serde_json::Value,
}

/// What a handler reports on success.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// Stage done; the chain continues with the next stage. Any output
    /// references are opaque to the engine.
    Advance { outputs: Option<serde_json::Value> },
    /// Stage done, but a shared downstream stage owns the rest of this
    /// artifact's completion. The chain stops here.
    Deferred,
}

impl StageOutcome {
    pub fn advance() -> Self {
        StageOutcome::Advance { outputs: None }
    }
}

/// One unit of pluggable processing. Implementations own their timeouts;
/// the engine imposes no stage deadline.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, request: &StageRequest) -> Result<StageOutcome>;
}

// ---------------------------------------------------------------------------
// Handler Registry
// ---------------------------------------------------------------------------

/// Registry of handlers indexed by stage name.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Build command handlers for every stage the pipeline descriptors gave
    /// an executable.
    pub fn from_commands(registry: &StageRegistry) -> Self {
        let mut handlers = Self::empty();
        for ty in ArtifactType::ALL {
            let Some(seq) = registry.sequence(ty) else {
                continue;
            };
            for stage in seq.stages() {
                if let Some(command) = registry.stage_command(ty, stage) {
                    handlers.register(stage, Arc::new(CommandHandler::new(command)));
                }
            }
        }
        handlers
    }

    pub fn register(&mut self, stage: impl Into<String>, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage.into(), handler);
    }

    /// Look up the handler for a stage.
    pub fn get(&self, stage: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(stage).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Command Handler
// ---------------------------------------------------------------------------

/// Handler that shells out to an external executable. The artifact context
/// travels in environment variables; a zero exit status is success.
pub struct CommandHandler {
    command: PathBuf,
}

impl CommandHandler {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl StageHandler for CommandHandler {
    async fn run(&self, request: &StageRequest) -> Result<StageOutcome> {
        // Resolve relative command paths against the process CWD so
        // descriptors can point at project-local scripts.
        let abs_command = if self.command.is_relative() {
            std::env::current_dir()?.join(&self.command)
        } else {
            self.command.clone()
        };

        debug!(
            stage = %request.stage,
            artifact_id = %request.artifact_id,
            command = %abs_command.display(),
            "running stage command"
        );

        let status = Command::new(&abs_command)
            .env("INTAKE_JOB_ID", request.job_id.0.to_string())
            .env("INTAKE_ARTIFACT_ID", request.artifact_id.0.to_string())
            .env("INTAKE_ARTIFACT_TYPE", request.artifact_type.as_str())
            .env("INTAKE_FILENAME", &request.filename)
            .env("INTAKE_SOURCE_REF", &request.source_ref)
            .env("INTAKE_STAGE", &request.stage)
            .env("INTAKE_OPTIONS", request.options.to_string())
            .status()
            .await?;

        if status.success() {
            Ok(StageOutcome::advance())
        } else {
            Err(Error::Other(format!(
                "stage {} command exited with status {}",
                request.stage,
                status.code().unwrap_or(-1)
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Always;

    #[async_trait]
    impl StageHandler for Always {
        async fn run(&self, _request: &StageRequest) -> Result<StageOutcome> {
            Ok(StageOutcome::advance())
        }
    }

    #[test]
    fn registry_lookup_by_stage_name() {
        let mut handlers = HandlerRegistry::empty();
        assert!(handlers.get("ocr").is_none());

        handlers.register("ocr", Arc::new(Always));
        assert!(handlers.get("ocr").is_some());
        assert_eq!(handlers.len(), 1);
    }

    #[test]
    fn from_commands_builds_nothing_without_descriptors() {
        let handlers = HandlerRegistry::from_commands(&StageRegistry::builtin());
        assert!(handlers.is_empty());
    }
}

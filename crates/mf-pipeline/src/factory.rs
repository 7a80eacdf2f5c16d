//! Stage factory: map executor keys in a [`PipelineDefinition`] to
//! [`StageExecutor`] implementations.

use std::collections::HashMap;
use std::sync::Arc;

use mf_core::config::ToolsConfig;
use mf_core::{Error, Result};
use mf_tools::ToolRegistry;

use crate::definition::PipelineDefinition;
use crate::stage::StageExecutor;
use crate::stages::{ConvertStage, RepairStage, SliceStage, ValidateStage};

/// Executors addressable by key.
#[derive(Clone, Default)]
pub struct StageRegistry {
    executors: HashMap<String, Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four tool-backed adapters under their own names.
    pub fn with_builtin(tools: Arc<ToolRegistry>, tools_config: &ToolsConfig) -> Self {
        let mut registry = Self::new();
        let builtin: [Arc<dyn StageExecutor>; 4] = [
            Arc::new(ConvertStage::new(tools.clone())),
            Arc::new(ValidateStage::new(
                tools.clone(),
                tools_config.validate_script.clone(),
            )),
            Arc::new(RepairStage::new(tools.clone())),
            Arc::new(SliceStage::new(tools)),
        ];
        for executor in builtin {
            registry.register(executor.name(), executor);
        }
        registry
    }

    /// Add or replace the executor for `key`.
    pub fn register(&mut self, key: impl Into<String>, executor: Arc<dyn StageExecutor>) {
        self.executors.insert(key.into(), executor);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(key).cloned()
    }

    /// Ensure every stage in `definition` names a registered executor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pipeline`] naming the first stage with an unknown key.
    pub fn check(&self, definition: &PipelineDefinition) -> Result<()> {
        for stage in definition.stages() {
            if !self.executors.contains_key(&stage.executor) {
                return Err(Error::pipeline(
                    stage.name.as_str(),
                    format!("unknown executor {:?}", stage.executor),
                ));
            }
        }
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("StageRegistry").field("executors", &keys).finish()
    }
}

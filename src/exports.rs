//! Export metadata - the seam to whatever can list a module's exported symbols
//!
//! Providers answer through an [`ExportReply`], either immediately or later
//! from another thread. Replies are queued on a channel and applied on the
//! session thread at the start of the next tick.

use std::collections::HashMap;

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::module::{Module, ModuleId};

/// One exported symbol of a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedFunction {
    pub name: String,
    pub offset: u64,
}

impl ExportedFunction {
    pub fn new(name: impl Into<String>, offset: u64) -> Self {
        Self {
            name: name.into(),
            offset,
        }
    }
}

/// Supplies the exported symbol table of a module
pub trait MetadataProvider {
    /// Look up the exports of `module_name` and answer through `reply`
    fn module_functions(&mut self, module_name: &str, reply: ExportReply);
}

/// Provider backed by a fixed table, answering synchronously
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticExports {
    modules: HashMap<String, Vec<ExportedFunction>>,
}

impl StaticExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module_name: impl Into<String>, functions: Vec<ExportedFunction>) {
        self.modules.insert(module_name.into(), functions);
    }
}

impl MetadataProvider for StaticExports {
    fn module_functions(&mut self, module_name: &str, reply: ExportReply) {
        let functions = self.modules.get(module_name).cloned().unwrap_or_default();
        reply.send(functions);
    }
}

/// A provider's answer for one module
#[derive(Debug)]
pub struct ExportBatch {
    pub generation: u64,
    pub module_id: ModuleId,
    pub functions: Vec<ExportedFunction>,
}

/// One-shot answer handle passed to a provider
pub struct ExportReply {
    generation: u64,
    module_id: ModuleId,
    sender: Sender<ExportBatch>,
}

impl ExportReply {
    pub fn send(self, functions: Vec<ExportedFunction>) {
        let batch = ExportBatch {
            generation: self.generation,
            module_id: self.module_id,
            functions,
        };
        if self.sender.send(batch).is_err() {
            tracing::debug!("Export reply for module {} dropped; session is gone", self.module_id);
        }
    }
}

/// Routes export requests to the configured provider and collects replies
pub struct Exports {
    provider: Option<Box<dyn MetadataProvider>>,
    generation: u64,
    sender: Sender<ExportBatch>,
    receiver: Receiver<ExportBatch>,
}

impl Default for Exports {
    fn default() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            provider: None,
            generation: 0,
            sender,
            receiver,
        }
    }
}

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_provider(&mut self, provider: Option<Box<dyn MetadataProvider>>) {
        self.provider = provider;
    }

    /// Start a new storage session; replies to earlier requests are discarded
    pub fn next_generation(&mut self) {
        self.generation += 1;
        self.receiver.try_iter().for_each(drop);
    }

    /// Ask the provider for a module's exports. Returns false without a provider.
    pub fn request(&mut self, module: &Module) -> bool {
        let Some(provider) = self.provider.as_mut() else {
            return false;
        };

        let reply = ExportReply {
            generation: self.generation,
            module_id: module.id,
            sender: self.sender.clone(),
        };
        provider.module_functions(&module.name, reply);
        true
    }

    /// Replies received so far for the current session
    pub fn take_replies(&self) -> Vec<ExportBatch> {
        self.receiver
            .try_iter()
            .filter(|batch| batch.generation == self.generation)
            .collect()
    }

    pub fn has_pending_replies(&self) -> bool {
        !self.receiver.is_empty()
    }
}

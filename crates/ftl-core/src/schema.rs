//! Module schema contract consumed by the scaling engines.
//!
//! Schema parsing lives elsewhere; this is the subset of a module's
//! declaration that decides how its runners are deployed: the runtime
//! base (language, image), scaling hints, and which other modules its
//! verbs call.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::keys::DeploymentKey;

/// A module as declared in the schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<ModuleRuntime>,
    #[serde(default)]
    pub decls: Vec<Decl>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRuntime {
    pub base: RuntimeBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<RuntimeScaling>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeBase {
    pub language: String,
    /// Runner image without a tag. Defaults to the stock runner image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeScaling {
    pub min_replicas: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Decl {
    Verb(Verb),
    Data { name: String },
    Config { name: String },
    Secret { name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verb {
    pub name: String,
    #[serde(default)]
    pub metadata: Vec<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Metadata {
    Calls { calls: Vec<Ref> },
    CronJob { cron: String },
    Ingress { method: String, path: String },
}

/// Reference to a declaration in some module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ref {
    pub module: String,
    pub name: String,
}

impl Module {
    /// Modules called by any verb of this module, deduplicated and sorted.
    pub fn callable_modules(&self) -> Vec<String> {
        let modules: BTreeSet<&str> = self
            .verbs()
            .flat_map(|verb| verb.metadata.iter())
            .filter_map(|md| match md {
                Metadata::Calls { calls } => Some(calls.iter()),
                _ => None,
            })
            .flatten()
            .map(|call| call.module.as_str())
            .collect();
        modules.into_iter().map(str::to_string).collect()
    }

    pub fn has_cron(&self) -> bool {
        self.verbs()
            .any(|v| v.metadata.iter().any(|md| matches!(md, Metadata::CronJob { .. })))
    }

    pub fn has_ingress(&self) -> bool {
        self.verbs()
            .any(|v| v.metadata.iter().any(|md| matches!(md, Metadata::Ingress { .. })))
    }

    /// Runtime language, empty when the module has no runtime.
    pub fn language(&self) -> &str {
        self.runtime
            .as_ref()
            .map(|rt| rt.base.language.as_str())
            .unwrap_or_default()
    }

    /// Declared minimum replica count, if any.
    pub fn min_replicas(&self) -> Option<i32> {
        self.runtime.as_ref()?.scaling.map(|s| s.min_replicas)
    }

    fn verbs(&self) -> impl Iterator<Item = &Verb> {
        self.decls.iter().filter_map(|decl| match decl {
            Decl::Verb(verb) => Some(verb),
            _ => None,
        })
    }
}

/// Kind of change carried by a schema event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeType {
    Added,
    Changed,
    Removed,
}

/// One event from the schema event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaChange {
    pub module_name: String,
    /// Builtin modules have no deployment.
    #[serde(default)]
    pub deployment_key: Option<DeploymentKey>,
    pub schema: Module,
    pub change_type: ChangeType,
    /// True while the initial snapshot is still streaming.
    #[serde(default)]
    pub more: bool,
}

//! Build steps as an explicit dependency graph.
//!
//! Each step names the filesystem states it needs (`requires`) and the
//! states it leaves behind (`provides`). A plan is valid only if every
//! requirement is provided by an earlier step, so the step order is checked
//! instead of being an implicit property of source order.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::PlanError;
use crate::token::CacheInvalidationToken;

/// Stands for the cache invalidation token in the commands of a guarded
/// step. Substituted by [`BuildPlan::render`]; the key hashes the
/// placeholder together with the token.
pub const TOKEN_PLACEHOLDER: &str = "{{cache-token}}";

/// One image layer worth of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub name: String,
    pub requires: Vec<String>,
    pub provides: Vec<String>,
    /// Shell commands run by the external layer builder.
    pub commands: Vec<String>,
    /// Additional inputs folded into the layer key (asset digests, tables).
    pub inputs: BTreeMap<String, String>,
    /// Whether the cache invalidation token is part of this layer's key.
    pub guarded_by_token: bool,
}

impl BuildStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires: Vec::new(),
            provides: Vec::new(),
            commands: Vec::new(),
            inputs: BTreeMap::new(),
            guarded_by_token: false,
        }
    }

    pub fn requires<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(states.into_iter().map(Into::into));
        self
    }

    pub fn provides<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides.extend(states.into_iter().map(Into::into));
        self
    }

    pub fn commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    /// Fold the cache invalidation token into this step's key.
    pub fn guarded(mut self) -> Self {
        self.guarded_by_token = true;
        self
    }
}

/// Content-addressed key of one layer. Changes whenever the step, any of
/// its inputs, or any earlier layer changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct LayerKey(String);

impl LayerKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digest(bytes: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(bytes))))
    }
}

impl std::fmt::Display for LayerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a layer key is computed from. Field order is fixed and
/// `inputs` is a `BTreeMap`, so the JSON encoding is canonical.
#[derive(Serialize)]
struct KeyMaterial<'a> {
    parent: &'a str,
    name: &'a str,
    commands: &'a [String],
    inputs: &'a BTreeMap<String, String>,
    token: Option<&'a str>,
}

/// A step as handed to the external layer builder.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedStep {
    pub name: String,
    pub layer_key: LayerKey,
    /// Commands, preceded by a no-op carrying the layer key so builders that
    /// only cache on command text still invalidate when the key changes.
    pub commands: Vec<String>,
}

/// Ordered, validated sequence of build steps on top of a base image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    base_image: String,
    base_provides: Vec<String>,
    steps: Vec<BuildStep>,
}

impl BuildPlan {
    /// Start a plan from a base image that already provides `base_provides`.
    pub fn new<I, S>(base_image: impl Into<String>, base_provides: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            base_image: base_image.into(),
            base_provides: base_provides.into_iter().map(Into::into).collect(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: BuildStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn base_image(&self) -> &str {
        &self.base_image
    }

    pub fn steps(&self) -> &[BuildStep] {
        &self.steps
    }

    /// Position of a step by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Check names are unique, states are provided once, and every
    /// requirement is satisfied by the base image or an earlier step.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(PlanError::DuplicateStep(step.name.clone()));
            }
        }

        let base = format!("base:{}", self.base_image);
        let mut available: HashMap<&str, &str> = self
            .base_provides
            .iter()
            .map(|s| (s.as_str(), base.as_str()))
            .collect();

        for (index, step) in self.steps.iter().enumerate() {
            for state in &step.requires {
                if !available.contains_key(state.as_str()) {
                    let provided_later_by = self.steps[index + 1..]
                        .iter()
                        .find(|later| later.provides.contains(state))
                        .map(|later| later.name.clone());
                    return Err(PlanError::MissingRequirement {
                        step: step.name.clone(),
                        state: state.clone(),
                        provided_later_by,
                    });
                }
            }

            for state in &step.provides {
                if let Some(first) = available.get(state.as_str()) {
                    return Err(PlanError::DuplicateState {
                        state: state.clone(),
                        first: first.to_string(),
                        second: step.name.clone(),
                    });
                }
                available.insert(state.as_str(), step.name.as_str());
            }
        }

        Ok(())
    }

    /// Direct dependencies of each step: the steps that provide its requirements.
    ///
    /// Requirements satisfied by the base image produce no edge.
    pub fn dependencies(&self) -> Result<Vec<(String, Vec<String>)>, PlanError> {
        self.validate()?;

        let mut provider: HashMap<&str, &str> = HashMap::new();
        let mut graph = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let mut deps: Vec<String> = step
                .requires
                .iter()
                .filter_map(|state| provider.get(state.as_str()).map(|s| s.to_string()))
                .collect();
            deps.sort();
            deps.dedup();
            graph.push((step.name.clone(), deps));

            for state in &step.provides {
                provider.insert(state.as_str(), step.name.as_str());
            }
        }

        Ok(graph)
    }

    /// Layer keys for every step, in order.
    ///
    /// Keys chain through their parent, so changing the token changes the
    /// first guarded layer and every layer after it, while layers before it
    /// keep their keys.
    pub fn layer_keys(&self, token: &CacheInvalidationToken) -> Result<Vec<LayerKey>, PlanError> {
        self.validate()?;

        let mut parent = LayerKey::digest(self.base_image.as_bytes());
        let mut keys = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let material = KeyMaterial {
                parent: parent.as_str(),
                name: &step.name,
                commands: &step.commands,
                inputs: &step.inputs,
                token: step.guarded_by_token.then(|| token.as_str()),
            };
            // Serializing plain strings and maps cannot fail
            let encoded = serde_json::to_vec(&material).unwrap_or_default();
            let key = LayerKey::digest(&encoded);
            keys.push(key.clone());
            parent = key;
        }

        Ok(keys)
    }

    /// Steps with their layer keys, ready for the layer builder.
    pub fn render(&self, token: &CacheInvalidationToken) -> Result<Vec<RenderedStep>, PlanError> {
        let keys = self.layer_keys(token)?;

        Ok(self
            .steps
            .iter()
            .zip(keys)
            .map(|(step, layer_key)| {
                let mut commands = Vec::with_capacity(step.commands.len() + 1);
                commands.push(format!("echo 'layer: {layer_key}' > /dev/null"));
                commands.extend(step.commands.iter().map(|command| {
                    if step.guarded_by_token {
                        command.replace(TOKEN_PLACEHOLDER, token.as_str())
                    } else {
                        command.clone()
                    }
                }));
                RenderedStep {
                    name: step.name.clone(),
                    layer_key,
                    commands,
                }
            })
            .collect())
    }
}

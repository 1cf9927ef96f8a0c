//! Named parameter groups.
//!
//! Every weight in a distillation run lives in exactly one [`ParamGroup`],
//! tagged [`ParamRole::Frozen`] or [`ParamRole::Trainable`]. The optimiser is
//! handed [`ParamStore::trainable_vars`] and nothing else, so a frozen CLIP
//! tower can never be updated by accident.
//!
//! Groups are backed by a [`candle_nn::VarMap`]: modules are built through
//! [`ParamGroup::var_builder`] (which registers each weight with a random
//! initial value) and pretrained weights are copied over afterwards with
//! [`ParamGroup::load_state_dict`]. Loading is non-strict and reports what
//! did not line up instead of failing.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamRole {
    Frozen,
    Trainable,
}

/// A tensor whose stored shape disagreed with the module's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub got: Vec<usize>,
}

/// Outcome of a non-strict load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Keys copied into the module.
    pub loaded: Vec<String>,
    /// Module keys with no counterpart in the source; they keep their current value.
    pub missing: Vec<String>,
    /// Source keys the module does not have.
    pub unexpected: Vec<String>,
    /// Keys present on both sides with different shapes; left untouched.
    pub mismatched: Vec<ShapeMismatch>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    fn sort(&mut self) {
        self.loaded.sort();
        self.missing.sort();
        self.unexpected.sort();
        self.mismatched.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

// ── ParamGroup ────────────────────────────────────────────────────────────────

/// A named set of parameters sharing a role, dtype and device.
///
/// Cloning is cheap and the clones share storage.
#[derive(Clone)]
pub struct ParamGroup {
    name: String,
    role: ParamRole,
    varmap: VarMap,
    dtype: DType,
    device: Device,
}

impl std::fmt::Debug for ParamGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamGroup")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("dtype", &self.dtype)
            .field("tensors", &self.varmap.all_vars().len())
            .finish()
    }
}

impl ParamGroup {
    pub fn new(name: impl Into<String>, role: ParamRole, dtype: DType, device: &Device) -> Self {
        Self { name: name.into(), role, varmap: VarMap::new(), dtype, device: device.clone() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ParamRole {
        self.role
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Builder that registers every weight a module asks for in this group.
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device)
    }

    /// Register an explicitly initialised tensor under `name`.
    ///
    /// The tensor is moved to the group's device but keeps its own dtype:
    /// trainable prompts stay F32 even inside a half-precision run.
    pub fn register(&self, name: &str, init: &Tensor) -> CoreResult<Var> {
        let var = Var::from_tensor(&init.to_device(&self.device)?)?;
        let mut data = self.varmap.data().lock().map_err(|_| CoreError::LockPoisoned)?;
        data.insert(name.to_string(), var.clone());
        Ok(var)
    }

    /// Look up a registered variable.
    pub fn get(&self, name: &str) -> CoreResult<Option<Var>> {
        let data = self.varmap.data().lock().map_err(|_| CoreError::LockPoisoned)?;
        Ok(data.get(name).cloned())
    }

    /// Variables sorted by name.
    pub fn vars(&self) -> CoreResult<Vec<(String, Var)>> {
        let data = self.varmap.data().lock().map_err(|_| CoreError::LockPoisoned)?;
        let sorted: BTreeMap<_, _> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(sorted.into_iter().collect())
    }

    pub fn all_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Total number of scalar parameters.
    pub fn num_params(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Snapshot of every tensor in the group.
    ///
    /// The tensors are copies: later optimiser steps or loads do not show
    /// through them.
    pub fn state_dict(&self) -> CoreResult<HashMap<String, Tensor>> {
        let data = self.varmap.data().lock().map_err(|_| CoreError::LockPoisoned)?;
        data.iter().map(|(k, v)| Ok((k.clone(), v.as_detached_tensor().copy()?))).collect()
    }

    /// Copy matching tensors into this group.
    ///
    /// Values are cast to each variable's dtype and device. Keys are matched
    /// exactly; anything else ends up in the returned [`LoadReport`].
    pub fn load_state_dict(&self, tensors: &HashMap<String, Tensor>) -> CoreResult<LoadReport> {
        let data = self.varmap.data().lock().map_err(|_| CoreError::LockPoisoned)?;
        let mut report = LoadReport::default();

        for (name, var) in data.iter() {
            let Some(src) = tensors.get(name) else {
                report.missing.push(name.clone());
                continue;
            };
            if src.dims() != var.dims() {
                report.mismatched.push(ShapeMismatch {
                    name: name.clone(),
                    expected: var.dims().to_vec(),
                    got: src.dims().to_vec(),
                });
                continue;
            }
            let src = src.to_dtype(var.dtype())?.to_device(var.device())?;
            var.set(&src)?;
            report.loaded.push(name.clone());
        }

        report.unexpected = tensors.keys().filter(|k| !data.contains_key(*k)).cloned().collect();
        report.sort();

        debug!(
            group = %self.name,
            loaded = report.loaded.len(),
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            mismatched = report.mismatched.len(),
            "State dict loaded"
        );
        Ok(report)
    }

    /// Load one or more safetensors shards into this group, non-strictly.
    pub fn load_pretrained(&self, paths: &[PathBuf]) -> CoreResult<LoadReport> {
        let mut merged = HashMap::new();
        for path in paths {
            merged.extend(read_safetensors(path, &self.device)?);
        }
        let report = self.load_state_dict(&merged)?;
        info!(
            group = %self.name,
            shards = paths.len(),
            loaded = report.loaded.len(),
            missing = report.missing.len(),
            "Pretrained weights loaded"
        );
        Ok(report)
    }
}

/// Read a safetensors file, mapping a missing path to [`CoreError::WeightsNotFound`].
pub fn read_safetensors(path: &Path, device: &Device) -> CoreResult<HashMap<String, Tensor>> {
    if !path.exists() {
        return Err(CoreError::WeightsNotFound(path.to_path_buf()));
    }
    Ok(candle_core::safetensors::load(path, device)?)
}

// ── ParamStore ────────────────────────────────────────────────────────────────

/// All parameter groups of one model.
///
/// Flat keys are `"<group>.<tensor>"`.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    groups: Vec<ParamGroup>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, group: ParamGroup) -> CoreResult<()> {
        if self.group(group.name()).is_some() {
            return Err(CoreError::Config {
                field: "param_group".into(),
                reason: format!("group '{}' registered twice", group.name()),
            });
        }
        self.groups.push(group);
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&ParamGroup> {
        self.groups.iter().find(|g| g.name() == name)
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// The only variables an optimiser may see.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.groups_with(ParamRole::Trainable).flat_map(|g| g.all_vars()).collect()
    }

    /// Flat names of all trainable tensors, sorted.
    pub fn trainable_names(&self) -> CoreResult<Vec<String>> {
        let mut names = Vec::new();
        for g in self.groups_with(ParamRole::Trainable) {
            names.extend(g.vars()?.into_iter().map(|(n, _)| format!("{}.{}", g.name(), n)));
        }
        names.sort();
        Ok(names)
    }

    pub fn num_params(&self, role: ParamRole) -> usize {
        self.groups_with(role).map(|g| g.num_params()).sum()
    }

    /// Whether `var` belongs to a trainable group.
    pub fn is_trainable(&self, var: &Var) -> bool {
        let id = var.as_tensor().id();
        self.trainable_vars().iter().any(|v| v.as_tensor().id() == id)
    }

    /// Flattened state of the groups with `role`, or of every group.
    pub fn state_dict(&self, role: Option<ParamRole>) -> CoreResult<HashMap<String, Tensor>> {
        let mut out = HashMap::new();
        for g in self.groups.iter().filter(|g| role.map_or(true, |r| g.role() == r)) {
            for (k, t) in g.state_dict()? {
                out.insert(format!("{}.{}", g.name(), k), t);
            }
        }
        Ok(out)
    }

    /// Route flat keys to their groups and load each non-strictly.
    ///
    /// Keys whose group prefix is unknown are reported as unexpected. Groups
    /// that receive no key at all are skipped rather than reported missing.
    pub fn load_state_dict(&self, tensors: &HashMap<String, Tensor>) -> CoreResult<LoadReport> {
        let mut per_group: HashMap<&str, HashMap<String, Tensor>> = HashMap::new();
        let mut report = LoadReport::default();

        for (key, t) in tensors {
            let routed = self.groups.iter().find_map(|g| {
                key.strip_prefix(g.name()).and_then(|rest| rest.strip_prefix('.')).map(|rest| (g.name(), rest))
            });
            match routed {
                Some((group, rest)) => {
                    per_group.entry(group).or_default().insert(rest.to_string(), t.clone());
                }
                None => report.unexpected.push(key.clone()),
            }
        }

        for g in &self.groups {
            let Some(sub) = per_group.get(g.name()) else { continue };
            let r = g.load_state_dict(sub)?;
            let prefix = |n: String| format!("{}.{}", g.name(), n);
            report.loaded.extend(r.loaded.into_iter().map(prefix));
            report.missing.extend(r.missing.into_iter().map(prefix));
            report.unexpected.extend(r.unexpected.into_iter().map(prefix));
            report.mismatched.extend(r.mismatched.into_iter().map(|mut m| {
                m.name = prefix(m.name);
                m
            }));
        }
        report.sort();
        Ok(report)
    }

    fn groups_with(&self, role: ParamRole) -> impl Iterator<Item = &ParamGroup> {
        self.groups.iter().filter(move |g| g.role() == role)
    }
}

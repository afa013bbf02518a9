//! # Checkpoints
//!
//! Loading is split in a pure matching step, [`reconcile`], and an [`apply`]
//! step writing the matched tensors into a `VarStore`. Matching is permissive
//! by default: checkpoint entries that do not correspond to a live parameter
//! are skipped, live parameters absent from the checkpoint keep their value.
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tch::{nn, Tensor};

/// The prefix added by data parallel training wrappers.
pub const DATA_PARALLEL_PREFIX: &str = "module.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Apply what matches, ignore the rest.
    #[default]
    Permissive,
    /// Fail unless every checkpoint entry matches and every parameter is set.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownName,
    ShapeMismatch { expected: Vec<i64>, actual: Vec<i64> },
}

#[derive(Debug)]
pub struct Skipped {
    pub name: String,
    pub reason: SkipReason,
}

/// The outcome of matching a checkpoint against live parameters.
#[derive(Debug, Default)]
pub struct Reconciled {
    /// Entries to load, keyed by live parameter name.
    pub applied: Vec<(String, Tensor)>,
    pub skipped: Vec<Skipped>,
    /// Live parameters that no checkpoint entry provides, sorted.
    pub missing: Vec<String>,
}

impl Reconciled {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.missing.is_empty()
    }
}

/// Reads every named tensor from a libtorch archive (`.ot`), a `.safetensors`
/// or a `.npz` file.
pub fn read<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Tensor)>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::MissingWeights(path.to_path_buf()));
    }
    let tensors = match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(path)?,
        Some("npz") => Tensor::read_npz(path)?,
        _ => Tensor::load_multi(path)?,
    };
    Ok(tensors)
}

/// Matches checkpoint entries to the live parameters by name.
///
/// When every checkpoint name starts with `strip_prefix` the prefix is removed
/// before matching, a prefix only carried by some of the names is left alone.
pub fn reconcile(
    checkpoint: Vec<(String, Tensor)>,
    live: &HashMap<String, Tensor>,
    strip_prefix: Option<&str>,
) -> Reconciled {
    let strip = strip_prefix.filter(|prefix| {
        !checkpoint.is_empty() && checkpoint.iter().all(|(name, _)| name.starts_with(prefix))
    });
    let mut reconciled = Reconciled::default();
    for (name, tensor) in checkpoint {
        let name = match strip {
            Some(prefix) => name[prefix.len()..].to_string(),
            None => name,
        };
        match live.get(&name) {
            None => reconciled.skipped.push(Skipped { name, reason: SkipReason::UnknownName }),
            Some(var) if var.size() != tensor.size() => {
                let reason =
                    SkipReason::ShapeMismatch { expected: var.size(), actual: tensor.size() };
                reconciled.skipped.push(Skipped { name, reason })
            }
            Some(_) => reconciled.applied.push((name, tensor)),
        }
    }
    let applied: HashSet<&str> = reconciled.applied.iter().map(|(n, _)| n.as_str()).collect();
    let mut missing: Vec<String> =
        live.keys().filter(|name| !applied.contains(name.as_str())).cloned().collect();
    missing.sort();
    reconciled.missing = missing;
    reconciled
}

/// Copies the applied entries of `reconciled` into the variables of `vs`.
pub fn apply(vs: &nn::VarStore, reconciled: &Reconciled) -> Result<()> {
    let mut variables = vs.variables();
    tch::no_grad(|| -> Result<()> {
        for (name, value) in reconciled.applied.iter() {
            if let Some(var) = variables.get_mut(name) {
                var.f_copy_(&value.to_device(var.device()))?;
            }
        }
        Ok(())
    })
}

/// Reads `path` and loads the matching entries into `vs`.
pub fn load<P: AsRef<Path>>(
    vs: &nn::VarStore,
    path: P,
    strip_prefix: Option<&str>,
    mode: LoadMode,
) -> Result<Reconciled> {
    let path = path.as_ref();
    let checkpoint = read(path)?;
    let reconciled = reconcile(checkpoint, &vs.variables(), strip_prefix);
    for skipped in reconciled.skipped.iter() {
        tracing::debug!(name = %skipped.name, reason = ?skipped.reason, "skipped checkpoint entry");
    }
    if mode == LoadMode::Strict && !reconciled.is_complete() {
        return Err(Error::CheckpointMismatch {
            skipped: reconciled.skipped.len(),
            missing: reconciled.missing.len(),
        });
    }
    apply(vs, &reconciled)?;
    tracing::info!(
        path = %path.display(),
        applied = reconciled.applied.len(),
        skipped = reconciled.skipped.len(),
        missing = reconciled.missing.len(),
        "loaded checkpoint"
    );
    Ok(reconciled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn store() -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = (vs.root() / "encoder").zeros("weight", &[2, 3]);
        let _ = (vs.root() / "time_embed").zeros("weight", &[4, 3]);
        vs
    }

    fn filled(size: &[i64], value: f64) -> Tensor {
        Tensor::full(size, value, (Kind::Float, Device::Cpu))
    }

    #[test]
    fn uniform_prefix_is_stripped() {
        let vs = store();
        let checkpoint = vec![
            ("wrapper.encoder.weight".to_string(), filled(&[2, 3], 1.)),
            ("wrapper.time_embed.weight".to_string(), filled(&[4, 3], 2.)),
        ];
        let reconciled = reconcile(checkpoint, &vs.variables(), Some("wrapper."));
        assert!(reconciled.is_complete());
        apply(&vs, &reconciled).unwrap();
        let variables = vs.variables();
        assert_eq!(variables["encoder.weight"].sum(Kind::Float).double_value(&[]), 6.);
        assert_eq!(variables["time_embed.weight"].sum(Kind::Float).double_value(&[]), 24.);
    }

    #[test]
    fn partial_prefix_is_kept() {
        let vs = store();
        let checkpoint = vec![
            ("module.encoder.weight".to_string(), filled(&[2, 3], 1.)),
            ("time_embed.weight".to_string(), filled(&[4, 3], 2.)),
        ];
        let reconciled = reconcile(checkpoint, &vs.variables(), Some(DATA_PARALLEL_PREFIX));
        assert_eq!(reconciled.applied.len(), 1);
        assert_eq!(reconciled.skipped[0].name, "module.encoder.weight");
        assert_eq!(reconciled.missing, vec!["encoder.weight".to_string()]);
    }

    #[test]
    fn no_matching_keys_leaves_parameters_unchanged() {
        let vs = store();
        let checkpoint = vec![("cls.seq_relationship.bias".to_string(), filled(&[2], 1.))];
        let reconciled = reconcile(checkpoint, &vs.variables(), None);
        assert!(reconciled.applied.is_empty());
        assert_eq!(reconciled.skipped[0].reason, SkipReason::UnknownName);
        apply(&vs, &reconciled).unwrap();
        for (_, var) in vs.variables() {
            assert_eq!(var.abs().sum(Kind::Float).double_value(&[]), 0.);
        }
    }

    #[test]
    fn shape_mismatch_is_skipped() {
        let vs = store();
        let checkpoint = vec![("time_embed.weight".to_string(), filled(&[2000, 3], 1.))];
        let reconciled = reconcile(checkpoint, &vs.variables(), None);
        assert!(reconciled.applied.is_empty());
        assert_eq!(
            reconciled.skipped[0].reason,
            SkipReason::ShapeMismatch { expected: vec![4, 3], actual: vec![2000, 3] }
        );
    }

    #[test]
    fn load_from_file() {
        let dir = std::env::temp_dir().join(format!("diffusion-bert-ckpt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("partial.ot");
        let encoder = filled(&[2, 3], 3.);
        Tensor::save_multi(&[("module.encoder.weight", &encoder)], &path).unwrap();

        let vs = store();
        let reconciled =
            load(&vs, &path, Some(DATA_PARALLEL_PREFIX), LoadMode::Permissive).unwrap();
        assert_eq!(reconciled.missing, vec!["time_embed.weight".to_string()]);
        let variables = vs.variables();
        assert_eq!(variables["encoder.weight"].sum(Kind::Float).double_value(&[]), 18.);

        let strict = load(&vs, &path, Some(DATA_PARALLEL_PREFIX), LoadMode::Strict);
        assert!(matches!(strict, Err(Error::CheckpointMismatch { skipped: 0, missing: 1 })));

        let missing = load(&vs, dir.join("nope.ot"), None, LoadMode::Permissive);
        assert!(matches!(missing, Err(Error::MissingWeights(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use albert_core::PretrainConfig;
use anyhow::{anyhow, bail, Context, Result};
use memmap2::MmapOptions;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tch::{nn, Kind, Tensor};

/// Partial warm-start plan: which stored tensors land in which live
/// parameters. Computed once before the first step, then discarded.
#[derive(Debug, Default)]
pub struct AssignmentMap {
    /// (stored name, live parameter name) pairs, one per restored tensor.
    pub assignments: Vec<(String, String)>,
    /// Live names that will be restored.
    pub matched: BTreeSet<String>,
    /// Live names left at their initializer values.
    pub unmatched: Vec<String>,
}

/// Strips a TF-style storage suffix (`:0`, `:1`, ...) off a parameter name.
fn normalize_name(name: &str) -> &str {
    match name.rsplit_once(':') {
        Some((stem, suffix)) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
            stem
        }
        _ => name,
    }
}

/// Pairs live parameter names against a checkpoint listing by exact string
/// match after suffix normalization. Unmatched live parameters are expected
/// (partial warm start), not an error. No tensor data is touched here.
pub fn build_assignment_map(live_names: &[String], stored: &[(String, Vec<i64>)]) -> AssignmentMap {
    let stored_names: HashSet<&str> = stored.iter().map(|(name, _)| name.as_str()).collect();

    let mut map = AssignmentMap::default();
    for live in live_names {
        let normalized = normalize_name(live);
        if stored_names.contains(normalized) {
            map.assignments.push((normalized.to_string(), live.clone()));
            map.matched.insert(live.clone());
        } else {
            map.unmatched.push(live.clone());
        }
    }
    map
}

/// Read-only (name, shape) listing of a stored checkpoint.
pub fn list_tensors(path: &Path) -> Result<Vec<(String, Vec<i64>)>> {
    let file = File::open(path).with_context(|| format!("failed to open checkpoint {:?}", path))?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)
        .with_context(|| format!("failed to parse checkpoint {:?}", path))?;

    let mut listing = Vec::new();
    for (name, view) in tensors.tensors() {
        let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
        listing.push((name, shape));
    }
    listing.sort();
    Ok(listing)
}

/// Bulk-assigns the mapped tensors into the var store. Blocking; must finish
/// before the first optimizer step touches the same parameters.
pub fn restore(vs: &mut nn::VarStore, path: &Path, map: &AssignmentMap) -> Result<usize> {
    let file = File::open(path).with_context(|| format!("failed to open checkpoint {:?}", path))?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)
        .with_context(|| format!("failed to parse checkpoint {:?}", path))?;

    let device = vs.device();
    let mut variables = vs.variables();

    let mut restored = 0;
    for (stored_name, live_name) in &map.assignments {
        let view = tensors
            .tensor(stored_name)
            .map_err(|e| anyhow!("tensor {} vanished from checkpoint: {}", stored_name, e))?;
        let var = variables
            .get_mut(live_name)
            .ok_or_else(|| anyhow!("live parameter {} vanished from var store", live_name))?;

        let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
        if shape != var.size() {
            bail!(
                "shape mismatch for {}: checkpoint {:?} vs live {:?}",
                live_name,
                shape,
                var.size()
            );
        }
        let kind = match view.dtype() {
            Dtype::F32 => Kind::Float,
            Dtype::F16 => Kind::Half,
            Dtype::BF16 => Kind::BFloat16,
            other => bail!("unsupported dtype {:?} for {}", other, stored_name),
        };

        let stored = Tensor::from_data_size(view.data(), &shape, kind).to_device(device);
        tch::no_grad(|| {
            var.copy_(&stored);
        });
        restored += 1;
    }

    Ok(restored)
}

/// Serializes every variable of the store to a safetensors file.
pub fn save(vs: &nn::VarStore, path: &Path) -> Result<()> {
    let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    for (name, var) in vs.variables() {
        let shape: Vec<usize> = var.size().iter().map(|&d| d as usize).collect();
        let values: Vec<f32> =
            Vec::try_from(&var.to_kind(Kind::Float).contiguous().view([-1]))
                .with_context(|| format!("failed to export {}", name))?;
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        buffers.push((name, shape, bytes));
    }

    let views: Vec<(&str, TensorView)> = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.as_str(), view))
                .map_err(|e| anyhow!("failed to build tensor view for {}: {}", name, e))
        })
        .collect::<Result<_>>()?;

    safetensors::serialize_to_file(views, &None, path)
        .with_context(|| format!("failed to write checkpoint {:?}", path))?;
    Ok(())
}

/// Writes the config next to the checkpoints so a run is reproducible from
/// its model directory alone.
pub fn write_config_snapshot(config: &PretrainConfig, dir: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(dir.join("config.json"), text)?;
    Ok(())
}

pub fn checkpoint_path(dir: &Path, step: i64) -> PathBuf {
    dir.join(format!("checkpoint_step_{}.safetensors", step))
}

/// Deletes the oldest checkpoints so at most `keep` remain. Ordering is by
/// the step number in the filename, not by mtime.
pub fn prune_checkpoints(dir: &Path, keep: usize) -> Result<()> {
    let mut checkpoints: Vec<(i64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(step) = parse_checkpoint_step(&path) {
            checkpoints.push((step, path));
        }
    }
    checkpoints.sort();

    if checkpoints.len() > keep {
        let excess = checkpoints.len() - keep;
        for (_, path) in checkpoints.into_iter().take(excess) {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove old checkpoint {:?}", path))?;
        }
    }
    Ok(())
}

fn parse_checkpoint_step(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_prefix("checkpoint_step_")?
        .strip_suffix(".safetensors")?;
    stem.parse().ok()
}

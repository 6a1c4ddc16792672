//! Durable checkpoint artifacts
//!
//! Everything written here goes through a temp-file-then-rename path so a
//! crash mid-write never leaves a partial checkpoint visible.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use candle_nn::VarMap;
use safetensors::{serialize, tensor::TensorView, Dtype as SafeDtype};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::adam::Adam;

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Write `bytes` to `path` atomically.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let tmp = temp_sibling(path);
    fs::write(&tmp, bytes)
        .with_context(|| format!("Failed to write temporary file: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to finalize write to: {}", path.display()))?;
    Ok(())
}

/// Serialize a value as pretty JSON, atomically.
pub fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    atomic_write(path, json.as_bytes())
}

/// Persist every variable in the map as a safetensors file, atomically.
pub fn save_weights(varmap: &VarMap, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let tmp = temp_sibling(path);
    varmap
        .save(&tmp)
        .with_context(|| format!("Failed to write weights to: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to finalize weights at: {}", path.display()))?;
    Ok(())
}

/// Persist the optimizer's moment estimates and step counter alongside the
/// weights so a run can be resumed from the epoch boundary.
pub fn save_optimizer_state(optimizer: &Adam, path: &Path) -> Result<()> {
    let state = optimizer.state_tensors();

    // First collect raw bytes, then build views over them
    let mut tensor_data = Vec::new();
    let mut tensor_info = Vec::new();
    for (name, (m, v)) in &state {
        tensor_info.push((
            format!("{name}_m"),
            convert_dtype(m.dtype())?,
            m.dims().to_vec(),
            tensor_data.len(),
        ));
        tensor_data.push(tensor_to_vec(m)?);

        tensor_info.push((
            format!("{name}_v"),
            convert_dtype(v.dtype())?,
            v.dims().to_vec(),
            tensor_data.len(),
        ));
        tensor_data.push(tensor_to_vec(v)?);
    }

    let mut tensors = HashMap::new();
    for (name, dtype, shape, idx) in tensor_info {
        tensors.insert(name, TensorView::new(dtype, shape, &tensor_data[idx])?);
    }

    let mut metadata = HashMap::new();
    metadata.insert("optimizer_type".to_string(), "adam".to_string());
    metadata.insert("step".to_string(), optimizer.get_step().to_string());
    metadata.insert(
        "learning_rate".to_string(),
        optimizer.learning_rate().to_string(),
    );
    metadata.insert("beta1".to_string(), optimizer.beta1().to_string());
    metadata.insert("beta2".to_string(), optimizer.beta2().to_string());
    metadata.insert("eps".to_string(), optimizer.eps().to_string());

    let data = serialize(&tensors, &Some(metadata)).context("Failed to serialize optimizer state")?;
    atomic_write(path, &data)
}

fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::U8 => Ok(SafeDtype::U8),
        DType::U32 => Ok(SafeDtype::U32),
        DType::I64 => Ok(SafeDtype::I64),
        _ => Err(anyhow::anyhow!("Unsupported dtype for safetensors: {:?}", dtype)),
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<u8>> {
    let flattened = tensor.flatten_all()?;
    let data = match tensor.dtype() {
        DType::F32 => {
            let data: Vec<f32> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        _ => return Err(anyhow::anyhow!("Unsupported tensor dtype for conversion")),
    };
    Ok(data)
}

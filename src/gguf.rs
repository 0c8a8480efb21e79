//! Rewriting GGUF files on load
//!
//! Candle's quantized var builder takes tensor names as they are stored in
//! the file. Two cases need more than that:
//! - city96's T5 GGUF uses llama.cpp names, candle's T5 expects HuggingFace names
//! - LoRA deltas have to be fused into quantized FLUX weights
//!
//! Both are handled by reading every tensor, renaming and/or patching it, and
//! writing a new GGUF image in memory that the var builder then loads.

use anyhow::{Context, Result};
use candle_core::quantized::{gguf_file, QTensor};
use candle_core::{DType, Device, Tensor};
use candle_transformers::quantized_var_builder::VarBuilder as QVarBuilder;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, info};

/// `[rows, cols]` of every 2-D tensor in a GGUF file, read from the header only
pub fn tensor_shapes<P: AsRef<Path>>(path: P) -> Result<HashMap<String, (usize, usize)>> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open GGUF: {}", path.display()))?;
    let content = gguf_file::Content::read(&mut file)
        .map_err(|e| anyhow::anyhow!("Failed to read GGUF {}: {}", path.display(), e))?;

    Ok(content
        .tensor_infos
        .iter()
        .filter_map(|(name, info)| match info.shape.dims() {
            [rows, cols] => Some((name.clone(), (*rows, *cols))),
            _ => None,
        })
        .collect())
}

/// Load a GGUF file, renaming every tensor with `rename_fn`
pub fn load_renamed<P, F>(path: P, device: &Device, rename_fn: F) -> Result<QVarBuilder>
where
    P: AsRef<Path>,
    F: Fn(&str) -> String,
{
    rewrite(path.as_ref(), device, rename_fn, &HashMap::new())
}

/// Load a GGUF file with dense deltas added to the named tensors
///
/// Patched tensors are dequantized, summed and requantized to their original
/// ggml type. Without deltas the file is loaded as is.
pub fn load_with_deltas<P: AsRef<Path>>(
    path: P,
    device: &Device,
    deltas: &HashMap<String, Tensor>,
) -> Result<QVarBuilder> {
    let path = path.as_ref();
    if deltas.is_empty() {
        return Ok(QVarBuilder::from_gguf(path, device)?);
    }
    rewrite(path, device, |name| name.to_string(), deltas)
}

fn rewrite<F>(
    path: &Path,
    device: &Device,
    rename_fn: F,
    deltas: &HashMap<String, Tensor>,
) -> Result<QVarBuilder>
where
    F: Fn(&str) -> String,
{
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open GGUF: {}", path.display()))?;
    let content = gguf_file::Content::read(&mut file)
        .map_err(|e| anyhow::anyhow!("Failed to read GGUF {}: {}", path.display(), e))?;

    let mut tensors: Vec<(String, QTensor)> = Vec::with_capacity(content.tensor_infos.len());
    let mut patched = 0usize;

    for tensor_name in content.tensor_infos.keys() {
        let tensor = content
            .tensor(&mut file, tensor_name, &Device::Cpu)
            .map_err(|e| anyhow::anyhow!("Failed to load tensor {}: {}", tensor_name, e))?;

        let mapped_name = rename_fn(tensor_name);
        let tensor = match deltas.get(&mapped_name) {
            Some(delta) => {
                patched += 1;
                add_delta(&tensor, delta)
                    .with_context(|| format!("Failed to fuse delta into {}", mapped_name))?
            }
            None => tensor,
        };
        tensors.push((mapped_name, tensor));
    }

    // Serialize, then free the decoded tensors before the var builder reads
    // the buffer back, so at most two copies of the weights are alive at once.
    let buffer = {
        let metadata: Vec<(&str, &gguf_file::Value)> = content
            .metadata
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        let tensor_refs: Vec<(&str, &QTensor)> =
            tensors.iter().map(|(name, t)| (name.as_str(), t)).collect();

        let mut buffer = Cursor::new(Vec::new());
        gguf_file::write(&mut buffer, &metadata, &tensor_refs)?;
        buffer.into_inner()
    };
    let tensor_count = tensors.len();
    drop(tensors);
    drop(content);
    drop(file);

    info!(
        path = %path.display(),
        tensors = tensor_count,
        patched = patched,
        bytes = buffer.len(),
        "Rewrote GGUF in memory"
    );

    Ok(QVarBuilder::from_gguf_buffer(&buffer, device)?)
}

fn add_delta(tensor: &QTensor, delta: &Tensor) -> Result<QTensor> {
    let dtype = tensor.dtype();
    let weight = tensor.dequantize(&Device::Cpu)?.to_dtype(DType::F32)?;
    let delta = delta.to_dtype(DType::F32)?.reshape(weight.shape())?;
    let fused = (weight + delta)?;
    Ok(QTensor::quantize(&fused, dtype)?)
}

/// Map llama.cpp tensor names to HuggingFace T5 tensor names
///
/// city96's T5 GGUF files use llama.cpp naming conventions, but candle's
/// T5 implementation expects HuggingFace naming.
pub fn map_llama_to_hf(llama_name: &str) -> String {
    match llama_name {
        "token_embd.weight" => return "shared.weight".to_string(),
        "enc.output_norm.weight" => return "encoder.final_layer_norm.weight".to_string(),
        _ => {}
    }

    // enc.blk.{N}.{rest} -> encoder.block.{N}.{hf_rest}
    if let Some(rest) = llama_name.strip_prefix("enc.blk.") {
        if let Some((block_num, rest)) = rest.split_once('.') {
            let hf_rest = match rest {
                "attn_k.weight" => "layer.0.SelfAttention.k.weight",
                "attn_q.weight" => "layer.0.SelfAttention.q.weight",
                "attn_v.weight" => "layer.0.SelfAttention.v.weight",
                "attn_o.weight" => "layer.0.SelfAttention.o.weight",
                "attn_rel_b.weight" => "layer.0.SelfAttention.relative_attention_bias.weight",
                "attn_norm.weight" => "layer.0.layer_norm.weight",
                // gated-gelu has wi_0 and wi_1
                "ffn_gate.weight" => "layer.1.DenseReluDense.wi_0.weight",
                "ffn_up.weight" => "layer.1.DenseReluDense.wi_1.weight",
                "ffn_down.weight" => "layer.1.DenseReluDense.wo.weight",
                "ffn_norm.weight" => "layer.1.layer_norm.weight",
                _ => {
                    debug!(suffix = %rest, "Unknown tensor suffix in GGUF");
                    return llama_name.to_string();
                }
            };
            return format!("encoder.block.{}.{}", block_num, hf_rest);
        }
    }

    debug!(tensor = %llama_name, "Unmapped tensor name in GGUF");
    llama_name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::quantized::GgmlDType;

    #[test]
    fn test_map_llama_to_hf() {
        assert_eq!(map_llama_to_hf("token_embd.weight"), "shared.weight");
        assert_eq!(
            map_llama_to_hf("enc.output_norm.weight"),
            "encoder.final_layer_norm.weight"
        );
        assert_eq!(
            map_llama_to_hf("enc.blk.0.attn_rel_b.weight"),
            "encoder.block.0.layer.0.SelfAttention.relative_attention_bias.weight"
        );
        assert_eq!(
            map_llama_to_hf("enc.blk.23.ffn_gate.weight"),
            "encoder.block.23.layer.1.DenseReluDense.wi_0.weight"
        );
        assert_eq!(map_llama_to_hf("enc.blk.1.unknown.weight"), "enc.blk.1.unknown.weight");
        assert_eq!(map_llama_to_hf("something.else"), "something.else");
    }

    #[test]
    fn test_rewrite_renames_and_patches() -> Result<()> {
        let dev = Device::Cpu;
        let dir = std::env::temp_dir().join(format!("flux-batch-gguf-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("tiny.gguf");

        let weight = QTensor::quantize(&Tensor::ones((2, 4), DType::F32, &dev)?, GgmlDType::F32)?;
        let bias = QTensor::quantize(&Tensor::zeros(4, DType::F32, &dev)?, GgmlDType::F32)?;
        let arch = gguf_file::Value::String("t5".to_string());
        {
            let mut file = std::fs::File::create(&path)?;
            gguf_file::write(
                &mut file,
                &[("general.architecture", &arch)],
                &[("token_embd.weight", &weight), ("enc.output_norm.weight", &bias)],
            )?;
        }

        let shapes = tensor_shapes(&path)?;
        assert_eq!(shapes.get("token_embd.weight"), Some(&(2, 4)));
        assert!(!shapes.contains_key("enc.output_norm.weight"));

        let vb = load_renamed(&path, &dev, map_llama_to_hf)?;
        assert!(vb.get_no_shape("shared.weight").is_ok());
        assert!(vb.get_no_shape("encoder.final_layer_norm.weight").is_ok());
        assert!(vb.get_no_shape("token_embd.weight").is_err());

        let mut deltas = HashMap::new();
        deltas.insert(
            "token_embd.weight".to_string(),
            Tensor::full(0.5f32, (2, 4), &dev)?,
        );
        let vb = load_with_deltas(&path, &dev, &deltas)?;
        let patched = vb.get((2, 4), "token_embd.weight")?.dequantize(&dev)?;
        assert_eq!(patched.to_vec2::<f32>()?, vec![vec![1.5f32; 4]; 2]);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}

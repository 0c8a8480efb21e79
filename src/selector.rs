//! Model selection for the interactive demo
//!
//! Turns the demo's string options (model name, precision, quantized text
//! encoder, LoRA name and weight, device) into a [`PipelinePlan`], then
//! loads a fresh [`FluxPipeline`] from that plan. Planning is pure, so the
//! branching can be checked without any weights on disk.
//!
//! | model     | precision | transformer weights       | LoRA support            |
//! |-----------|-----------|---------------------------|-------------------------|
//! | `schnell` | `int4`    | quantized GGUF (CUDA only)| none                    |
//! | `schnell` | `bf16`    | full precision            | none                    |
//! | `dev`     | `int4`    | quantized GGUF (CUDA only)| one named adapter       |
//! | `dev`     | `bf16`    | full precision            | one named adapter, or all at scale 0 |

use anyhow::Result;
use candle_core::Device;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::download::ModelDownloader;
use crate::error::SelectionError;
use crate::pipeline::{FluxPipeline, PipelineOptions};

/// Supported FLUX.1 model families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Schnell,
    Dev,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schnell => "schnell",
            Self::Dev => "dev",
        }
    }

    /// HuggingFace repository of the reference weights
    pub fn repo(&self) -> &'static str {
        match self {
            Self::Schnell => "black-forest-labs/FLUX.1-schnell",
            Self::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }
}

impl FromStr for ModelFamily {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schnell" => Ok(Self::Schnell),
            "dev" => Ok(Self::Dev),
            other => Err(SelectionError::NotImplemented(other.to_string())),
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weight precision of the FLUX transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Quantized GGUF weights
    Int4,
    /// Full precision safetensors
    Bf16,
}

impl FromStr for Precision {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int4" => Ok(Self::Int4),
            "bf16" => Ok(Self::Bf16),
            other => Err(SelectionError::UnsupportedPrecision(other.to_string())),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int4 => f.write_str("int4"),
            Self::Bf16 => f.write_str("bf16"),
        }
    }
}

/// Compute device requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    pub fn is_cuda(&self) -> bool {
        matches!(self, Self::Cuda(_))
    }

    /// Open the device. Fails if the backend is not compiled in or absent.
    pub fn create(&self) -> Result<Device> {
        let device = match *self {
            Self::Cpu => Device::Cpu,
            Self::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            Self::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }
}

impl FromStr for DeviceSpec {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SelectionError::InvalidDevice(s.to_string());
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => (kind, ordinal.parse().map_err(|_| invalid())?),
            None => (s, 0),
        };
        match kind {
            "cpu" if ordinal == 0 => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(ordinal)),
            "metal" | "mps" => Ok(Self::Metal(ordinal)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(i) => write!(f, "cuda:{i}"),
            Self::Metal(i) => write!(f, "metal:{i}"),
        }
    }
}

/// Which LoRA adapters to attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoraChoice {
    None,
    /// Every registry adapter, attached at scale 0
    All,
    Named(String),
}

impl LoraChoice {
    /// Any name other than `None` or `All` refers to a registry adapter
    pub fn parse(s: &str) -> Self {
        match s {
            "None" => Self::None,
            "All" => Self::All,
            name => Self::Named(name.to_string()),
        }
    }
}

/// A published FLUX.1-dev LoRA adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoraSource {
    pub name: &'static str,
    pub repo: &'static str,
    pub weight_name: &'static str,
}

pub const LORA_REGISTRY: &[LoraSource] = &[
    LoraSource {
        name: "Anime",
        repo: "alvdansen/sonny-anime-fixed",
        weight_name: "araminta_k_sonnyanime_fluxd_fixed.safetensors",
    },
    LoraSource {
        name: "GHIBSKY Illustration",
        repo: "aleksa-codes/flux-ghibsky-illustration",
        weight_name: "lora.safetensors",
    },
    LoraSource {
        name: "Realism",
        repo: "XLabs-AI/flux-RealismLora",
        weight_name: "lora.safetensors",
    },
    LoraSource {
        name: "Children Sketch",
        repo: "Shakker-Labs/FLUX.1-dev-LoRA-Children-Simple-Sketch",
        weight_name: "FLUX-dev-lora-children-simple-sketch.safetensors",
    },
    LoraSource {
        name: "Yarn Art",
        repo: "linoyts/yarn_art_Flux_LoRA",
        weight_name: "pytorch_lora_weights.safetensors",
    },
];

pub fn find_lora(name: &str) -> Result<&'static LoraSource, SelectionError> {
    LORA_REGISTRY
        .iter()
        .find(|l| l.name == name)
        .ok_or_else(|| SelectionError::UnknownLora(name.to_string()))
}

/// Raw demo options, as they arrive from the CLI
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub model: String,
    pub precision: String,
    pub use_qencoder: bool,
    pub lora: String,
    pub lora_weight: f32,
    pub device: String,
}

impl PipelineRequest {
    pub fn new(model: impl Into<String>, precision: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            precision: precision.into(),
            use_qencoder: false,
            lora: "None".to_string(),
            lora_weight: 1.0,
            device: "cuda".to_string(),
        }
    }

    pub fn with_qencoder(mut self, use_qencoder: bool) -> Self {
        self.use_qencoder = use_qencoder;
        self
    }

    pub fn with_lora(mut self, name: impl Into<String>, weight: f32) -> Self {
        self.lora = name.into();
        self.lora_weight = weight;
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }
}

/// Adapter to fuse into the transformer, with its effective scale
#[derive(Debug, Clone, PartialEq)]
pub struct LoraAttachment {
    pub source: &'static LoraSource,
    pub scale: f32,
}

/// Fully resolved selection: what to download and how to build it
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePlan {
    pub family: ModelFamily,
    pub precision: Precision,
    pub quantized_t5: bool,
    pub loras: Vec<LoraAttachment>,
    pub device: DeviceSpec,
}

/// Decide which pipeline variant a request maps to
///
/// Checks run in a fixed order: model name, device, precision (including the
/// CUDA requirement of `int4`), then the LoRA name.
pub fn select_pipeline(request: &PipelineRequest) -> Result<PipelinePlan, SelectionError> {
    let family: ModelFamily = request.model.parse()?;
    let device: DeviceSpec = request.device.parse()?;
    let precision: Precision = request.precision.parse()?;

    if precision == Precision::Int4 && !device.is_cuda() {
        return Err(SelectionError::QuantizedRequiresCuda(device.to_string()));
    }

    let loras = match (family, precision, LoraChoice::parse(&request.lora)) {
        (_, _, LoraChoice::None) => Vec::new(),
        (ModelFamily::Schnell, _, _) => {
            warn!(lora = %request.lora, "LoRA adapters are only supported for FLUX.1-dev, ignoring");
            Vec::new()
        }
        (ModelFamily::Dev, Precision::Int4, LoraChoice::All) => Vec::new(),
        (ModelFamily::Dev, Precision::Bf16, LoraChoice::All) => LORA_REGISTRY
            .iter()
            .map(|source| LoraAttachment { source, scale: 0.0 })
            .collect(),
        (ModelFamily::Dev, _, LoraChoice::Named(name)) => vec![LoraAttachment {
            source: find_lora(&name)?,
            scale: request.lora_weight,
        }],
    };

    Ok(PipelinePlan {
        family,
        precision,
        quantized_t5: request.use_qencoder,
        loras,
        device,
    })
}

/// Download everything a plan needs and build the pipeline on its device
///
/// Each call constructs a new pipeline; nothing is cached between calls
/// apart from hf-hub's file cache.
pub async fn load_pipeline(
    plan: &PipelinePlan,
    downloader: &ModelDownloader,
    options: PipelineOptions,
) -> Result<FluxPipeline> {
    info!(
        model = %plan.family,
        precision = %plan.precision,
        quantized_t5 = plan.quantized_t5,
        loras = plan.loras.len(),
        device = %plan.device,
        "Selecting FLUX pipeline"
    );

    let device = plan.device.create()?;
    let paths = downloader.download_plan(plan).await?;

    FluxPipeline::new(plan, &paths, device, options)
}

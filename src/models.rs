//! Request and response bodies for the HTTP API.
use serde::{Deserialize, Serialize};

use crate::catalog::{CAPTION_MODELS, FLORENCE2_BASE, FLUX, FLUX2, GENERATION_MODELS, SDXL, ZIMAGE_TURBO};
use crate::errors::ServiceError;
use crate::residency::ResidencyState;

fn default_dimension() -> u32 {
    1024
}

fn default_steps() -> u32 {
    30
}

fn default_guidance() -> f32 {
    7.5
}

fn default_generation_model() -> String {
    SDXL.to_string()
}

/// Body of `POST /api/image`. Also the JSON input handed to the generation backend, after
/// [`GenerateRequest::normalized`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    /// 0 lets the backend pick a random seed.
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_guidance")]
    pub guidance: f32,
    #[serde(default = "default_generation_model")]
    pub model: String,
}

impl GenerateRequest {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.prompt.trim().is_empty() {
            return Err(ServiceError::invalid("prompt must not be empty"));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !(256..=2048).contains(&value) {
                return Err(ServiceError::invalid(format!(
                    "{name} must be between 256 and 2048, got {value}"
                )));
            }
        }
        if !(1..=100).contains(&self.steps) {
            return Err(ServiceError::invalid(format!(
                "steps must be between 1 and 100, got {}",
                self.steps
            )));
        }
        if !(0.0..=20.0).contains(&self.guidance) {
            return Err(ServiceError::invalid(format!(
                "guidance must be between 0 and 20, got {}",
                self.guidance
            )));
        }
        if !GENERATION_MODELS.contains(&self.model.as_str()) {
            return Err(ServiceError::invalid(format!(
                "unknown model '{}', expected one of: {}",
                self.model,
                GENERATION_MODELS.join(", ")
            )));
        }
        Ok(())
    }

    /// Apply the per-model parameter rules: step caps and which knobs a pipeline ignores.
    pub fn normalized(mut self) -> Self {
        match self.model.as_str() {
            FLUX => {
                self.steps = self.steps.min(4);
                self.negative_prompt = None;
                self.guidance = 0.0;
            }
            FLUX2 => {
                self.steps = self.steps.min(50);
                self.negative_prompt = None;
            }
            ZIMAGE_TURBO => {
                self.steps = 9;
                self.guidance = 0.0;
                self.negative_prompt = None;
            }
            _ => {}
        }
        self
    }
}

/// Upscale form fields. Only `scale` is used; the generation-style fields are accepted for
/// client compatibility.
#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleForm {
    pub image: Vec<u8>,
    pub scale: u8,
}

impl UpscaleForm {
    pub const DEFAULT_SCALE: u8 = 4;

    pub fn parse_scale(raw: &str) -> Result<u8, ServiceError> {
        match raw.trim().parse::<u8>() {
            Ok(scale @ (2 | 4)) => Ok(scale),
            _ => Err(ServiceError::invalid("Scale must be 2 or 4")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionForm {
    pub image: Vec<u8>,
    pub model: String,
}

impl CaptionForm {
    pub const DEFAULT_MODEL: &'static str = FLORENCE2_BASE;

    pub fn parse_model(raw: &str) -> Result<String, ServiceError> {
        let model = raw.trim();
        if CAPTION_MODELS.contains(&model) {
            return Ok(model.to_string());
        }
        Err(ServiceError::invalid(format!(
            "unknown caption model '{model}', expected one of: {}",
            CAPTION_MODELS.join(", ")
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionResponse {
    pub caption: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidentSummary {
    pub generation: ResidencyState,
    pub upscale: Vec<String>,
    pub caption: Vec<String>,
}

/// Body of `GET /api/queue`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub accepting: bool,
    pub resident: ResidentSummary,
}

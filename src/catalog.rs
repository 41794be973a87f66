//! Model families and the variants each one serves.
//!
//! A family groups variants that compete for the same accelerator residency. Generation
//! backbones are large enough that only one may be resident at a time, so that family is
//! swapped on demand. Upscalers and captioners are small and are preloaded once at startup.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::capabilities::{Capability, CapabilitySet};

pub const REALESRGAN_X2: &str = "realesrgan-x2plus";
pub const REALESRGAN_X4: &str = "realesrgan-x4plus";

pub const BLIP2: &str = "blip2";
pub const FLORENCE2_BASE: &str = "florence2-base";
pub const FLORENCE2_LARGE: &str = "florence2-large";

pub const SDXL: &str = "sdxl";
pub const FLUX: &str = "flux";
pub const FLUX2: &str = "flux2";
pub const ZIMAGE_TURBO: &str = "zimage-turbo";

pub const GENERATION_MODELS: &[&str] = &[SDXL, FLUX, FLUX2, ZIMAGE_TURBO];
pub const CAPTION_MODELS: &[&str] = &[BLIP2, FLORENCE2_BASE, FLORENCE2_LARGE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Generation,
    Upscale,
    Caption,
}

/// How a family shares accelerator memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// At most one variant resident; a request for another variant evicts it.
    Swappable,
    /// Every variant is loaded at startup and kept for the process lifetime.
    Preloaded,
}

impl Family {
    pub const ALL: [Family; 3] = [Family::Generation, Family::Upscale, Family::Caption];

    pub fn residency(self) -> Residency {
        match self {
            Family::Generation => Residency::Swappable,
            Family::Upscale | Family::Caption => Residency::Preloaded,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Family::Generation => "generation",
            Family::Upscale => "upscale",
            Family::Caption => "caption",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upscaler variant for a scale factor.
pub fn upscale_model(scale: u8) -> Option<&'static str> {
    match scale {
        2 => Some(REALESRGAN_X2),
        4 => Some(REALESRGAN_X4),
        _ => None,
    }
}

/// One backend instance to load at startup, registered under every name in `serves`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preload {
    pub family: Family,
    pub variant: String,
    pub serves: Vec<String>,
}

impl Preload {
    fn single(family: Family, variant: &str) -> Self {
        Self {
            family,
            variant: variant.to_string(),
            serves: vec![variant.to_string()],
        }
    }
}

/// Work out which preloaded-family variants to load for a capability set.
///
/// Both upscalers are loaded whenever any upscale capability exists. Florence-2 large handles
/// base requests too, so only the largest available Florence variant is loaded.
pub fn preload_plan(caps: &CapabilitySet) -> Vec<Preload> {
    let mut plan = Vec::new();

    let any_upscale = caps
        .capabilities
        .iter()
        .any(|c| matches!(c, Capability::Upscale { .. }));
    if any_upscale {
        plan.push(Preload::single(Family::Upscale, REALESRGAN_X2));
        plan.push(Preload::single(Family::Upscale, REALESRGAN_X4));
    }

    let captions: Vec<&str> = caps
        .capabilities
        .iter()
        .filter_map(|c| match c {
            Capability::Caption { model } => Some(model.as_str()),
            _ => None,
        })
        .collect();

    if captions.contains(&BLIP2) {
        plan.push(Preload::single(Family::Caption, BLIP2));
    }
    if captions.contains(&FLORENCE2_LARGE) {
        plan.push(Preload {
            family: Family::Caption,
            variant: FLORENCE2_LARGE.to_string(),
            serves: vec![FLORENCE2_LARGE.to_string(), FLORENCE2_BASE.to_string()],
        });
    } else if captions.contains(&FLORENCE2_BASE) {
        plan.push(Preload::single(Family::Caption, FLORENCE2_BASE));
    }

    plan
}

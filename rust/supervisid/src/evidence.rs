use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::panic::{self, AssertUnwindSafe};

pub const MIN_EVIDENCE: usize = 2;
pub const MAX_EVIDENCE: usize = 4;

const DATA_URL_JPEG_PREFIX: &str = "data:image/jpeg;base64,";

/// Bounds one normalization pass. Two call sites exist: quick observation
/// photos and scanned documents that must fit a byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeConfig {
    pub max_edge_px: u32,
    pub initial_quality: u8,
    pub target_bytes: Option<usize>,
    pub quality_step: u8,
    pub min_quality: u8,
}

impl NormalizeConfig {
    pub fn observation() -> Self {
        Self {
            max_edge_px: 800,
            initial_quality: 60,
            target_bytes: None,
            quality_step: 5,
            min_quality: 10,
        }
    }

    pub fn document() -> Self {
        Self {
            max_edge_px: 1200,
            initial_quality: 80,
            target_bytes: Some(200 * 1024),
            quality_step: 5,
            min_quality: 10,
        }
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self::observation()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedImage {
    #[serde(skip)]
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
    pub quality: u8,
    pub sha256: String,
}

impl NormalizedImage {
    pub fn data_url(&self) -> String {
        format!("{}{}", DATA_URL_JPEG_PREFIX, BASE64.encode(&self.jpeg))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvidenceError {
    #[error("at most 4 evidence images may be attached")]
    MaxCountExceeded,
    #[error("image could not be processed: {0}")]
    ImageProcessing(String),
    #[error("no evidence image at index {0}")]
    InvalidIndex(usize),
    #[error("no evidence slot with ticket {0}")]
    UnknownTicket(u64),
    #[error("ticket {0} is already in use")]
    DuplicateTicket(u64),
}

/// Accepts raw base64 or a `data:<mime>;base64,` URL.
pub fn decode_payload(raw: &str) -> Result<Vec<u8>, EvidenceError> {
    let trimmed = raw.trim();
    let body = match trimmed.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(";base64,")
            .map(|(_, b)| b)
            .ok_or_else(|| EvidenceError::ImageProcessing("data URL is not base64".into()))?,
        None => trimmed,
    };
    BASE64
        .decode(body)
        .map_err(|e| EvidenceError::ImageProcessing(format!("invalid base64: {}", e)))
}

fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, EvidenceError> {
    let mut out = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode_image(img)
            .map_err(|e| EvidenceError::ImageProcessing(e.to_string()))?;
    }
    Ok(out)
}

fn fit_longer_edge(img: DynamicImage, max_edge: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w.max(h) <= max_edge {
        return img;
    }
    // resize() keeps the aspect ratio inside the bounding box.
    img.resize(max_edge, max_edge, FilterType::Triangle)
}

/// Downscale and re-encode as JPEG. Quality steps down until the budget is met
/// or the floor is reached; an oversized result at the floor is still accepted.
pub fn normalize_image(raw: &[u8], config: &NormalizeConfig) -> Result<NormalizedImage, EvidenceError> {
    let decoded = image::load_from_memory(raw)
        .map_err(|e| EvidenceError::ImageProcessing(e.to_string()))?;
    let rgb = fit_longer_edge(decoded, config.max_edge_px.max(1)).to_rgb8();

    let floor = config.min_quality.clamp(1, 100);
    let mut quality = config.initial_quality.clamp(floor, 100);
    let mut jpeg = encode_jpeg(&rgb, quality)?;
    if let Some(budget) = config.target_bytes {
        let step = config.quality_step.max(1);
        while jpeg.len() > budget && quality > floor {
            quality = quality.saturating_sub(step).max(floor);
            jpeg = encode_jpeg(&rgb, quality)?;
        }
    }

    let sha256 = format!("{:x}", Sha256::digest(&jpeg));
    Ok(NormalizedImage {
        width: rgb.width(),
        height: rgb.height(),
        bytes: jpeg.len(),
        quality,
        sha256,
        jpeg,
    })
}

/// Runs a normalization step, turning a panic inside the codec into an
/// ordinary rejection.
pub fn contain_panics<F>(step: F) -> Result<NormalizedImage, EvidenceError>
where
    F: FnOnce() -> Result<NormalizedImage, EvidenceError>,
{
    panic::catch_unwind(AssertUnwindSafe(step)).unwrap_or_else(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(EvidenceError::ImageProcessing(format!("decoder panicked: {}", detail)))
    })
}

#[derive(Debug, Clone)]
enum Slot {
    Pending(u64),
    Ready { ticket: u64, image: NormalizedImage },
}

impl Slot {
    fn ticket(&self) -> u64 {
        match self {
            Slot::Pending(t) => *t,
            Slot::Ready { ticket, .. } => *ticket,
        }
    }
}

/// Ordered evidence for one visit. A slot is reserved when normalization
/// starts so concurrent uploads cannot overshoot the maximum. Every slot keeps
/// its ticket for life; ordinals shift as earlier slots resolve.
#[derive(Debug, Clone, Default)]
pub struct EvidenceCollector {
    slots: Vec<Slot>,
}

impl EvidenceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn reserve(&self, ticket: u64) -> Result<(), EvidenceError> {
        if self.slots.len() >= MAX_EVIDENCE {
            return Err(EvidenceError::MaxCountExceeded);
        }
        if self.slots.iter().any(|s| s.ticket() == ticket) {
            return Err(EvidenceError::DuplicateTicket(ticket));
        }
        Ok(())
    }

    pub fn begin(&mut self, ticket: u64) -> Result<(), EvidenceError> {
        self.reserve(ticket)?;
        self.slots.push(Slot::Pending(ticket));
        Ok(())
    }

    /// Resolves a reserved slot. Returns false for a ticket that is not
    /// pending here (session abandoned, or the slot was cancelled).
    pub fn finish(&mut self, ticket: u64, outcome: Result<NormalizedImage, EvidenceError>) -> bool {
        let Some(pos) = self
            .slots
            .iter()
            .position(|s| matches!(s, Slot::Pending(t) if *t == ticket))
        else {
            return false;
        };
        match outcome {
            Ok(image) => self.slots[pos] = Slot::Ready { ticket, image },
            Err(_) => {
                self.slots.remove(pos);
            }
        }
        true
    }

    pub fn add(
        &mut self,
        ticket: u64,
        raw: &[u8],
        config: &NormalizeConfig,
    ) -> Result<NormalizedImage, EvidenceError> {
        self.reserve(ticket)?;
        let image = contain_panics(|| normalize_image(raw, config))?;
        self.slots.push(Slot::Ready {
            ticket,
            image: image.clone(),
        });
        Ok(image)
    }

    /// `index` counts ready images only.
    pub fn remove(&mut self, index: usize) -> Result<NormalizedImage, EvidenceError> {
        let pos = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Slot::Ready { .. }))
            .nth(index)
            .map(|(pos, _)| pos)
            .ok_or(EvidenceError::InvalidIndex(index))?;
        match self.slots.remove(pos) {
            Slot::Ready { image, .. } => Ok(image),
            Slot::Pending(_) => Err(EvidenceError::InvalidIndex(index)),
        }
    }

    /// Drops the slot with this ticket. A pending slot is cancelled and yields
    /// `None`; its late result is then ignored by `finish`.
    pub fn remove_ticket(&mut self, ticket: u64) -> Result<Option<NormalizedImage>, EvidenceError> {
        let pos = self
            .slots
            .iter()
            .position(|s| s.ticket() == ticket)
            .ok_or(EvidenceError::UnknownTicket(ticket))?;
        match self.slots.remove(pos) {
            Slot::Ready { image, .. } => Ok(Some(image)),
            Slot::Pending(_) => Ok(None),
        }
    }

    /// Ready images with their tickets, in slot order.
    pub fn entries(&self) -> Vec<(u64, &NormalizedImage)> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::Ready { ticket, image } => Some((*ticket, image)),
                Slot::Pending(_) => None,
            })
            .collect()
    }

    pub fn images(&self) -> Vec<&NormalizedImage> {
        self.entries().into_iter().map(|(_, img)| img).collect()
    }

    /// Current ready ordinal of a ticket.
    pub fn index_of(&self, ticket: u64) -> Option<usize> {
        self.entries().iter().position(|(t, _)| *t == ticket)
    }

    pub fn count(&self) -> usize {
        self.entries().len()
    }

    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Pending(_)))
            .count()
    }

    pub fn is_sufficient(&self) -> bool {
        (MIN_EVIDENCE..=MAX_EVIDENCE).contains(&self.count())
    }
}

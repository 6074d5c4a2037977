use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{imageops, DynamicImage, GenericImageView, ImageReader, Rgb, RgbImage};
use petcard_contracts::events::EventLog;
use petcard_contracts::generation::{normalize_generation_output, GeneratedPayload, Theme};
use petcard_contracts::watermark::{
    CornerPosition, PlacementMetadata, WatermarkOptions, WatermarkOutcome, WatermarkReport,
};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Conventional logo asset locations, checked in order when no explicit path
/// was configured. The absolute deployment path wins over the repo-relative
/// fallback.
pub const LOGO_SEARCH_PATHS: [&str; 2] = [
    "/opt/petcard/assets/watermark-logo.png",
    "assets/watermark-logo.png",
];

// ---------------------------------------------------------------------------
// Image capability wrapper
// ---------------------------------------------------------------------------

/// Handle to the raster-image capability. Acquired once per call via
/// [`ImageCapability::probe`]; every raster operation hangs off the handle so
/// callers degrade uniformly when the capability is unavailable instead of
/// checking a fallible import at every step.
pub struct ImageCapability(());

struct RegionStats {
    entropy: f64,
    std_dev: f64,
}

impl ImageCapability {
    /// Encode a one-pixel probe image. Failure means the codec stack is
    /// unusable and the orchestrator must pass bytes through untouched.
    pub fn probe() -> Option<Self> {
        let mut sink = Vec::new();
        let probe = RgbImage::from_pixel(1, 1, Rgb([0, 0, 0]));
        let mut encoder = JpegEncoder::new_with_quality(&mut sink, 80);
        match encoder.encode_image(&DynamicImage::ImageRgb8(probe)) {
            Ok(()) => Some(Self(())),
            Err(_) => None,
        }
    }

    /// Best-effort dimensions without a full decode. `None`, never an error,
    /// when the format cannot be introspected.
    pub fn load_metadata(&self, bytes: &[u8]) -> Option<(u32, u32)> {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        image::load_from_memory(bytes).context("image decode failed")
    }

    /// Greyscale entropy and standard deviation of a clipped sample region.
    /// The luma conversion strips alpha.
    fn region_stats(&self, base: &DynamicImage, rect: SampleRect) -> Result<RegionStats> {
        if rect.width == 0 || rect.height == 0 {
            bail!("empty sample region");
        }
        let grey = base
            .crop_imm(rect.left, rect.top, rect.width, rect.height)
            .to_luma8();
        let mut histogram = [0u64; 256];
        let mut sum = 0.0f64;
        for pixel in grey.pixels() {
            histogram[usize::from(pixel[0])] += 1;
            sum += f64::from(pixel[0]);
        }
        let count = f64::from(rect.width) * f64::from(rect.height);
        let mean = sum / count;
        let variance = grey
            .pixels()
            .map(|pixel| {
                let delta = f64::from(pixel[0]) - mean;
                delta * delta
            })
            .sum::<f64>()
            / count;
        let entropy = histogram
            .iter()
            .filter(|&&bin| bin > 0)
            .map(|&bin| {
                let p = bin as f64 / count;
                -p * p.log2()
            })
            .sum();
        Ok(RegionStats {
            entropy,
            std_dev: variance.sqrt(),
        })
    }

    /// Shrink to `target_width` preserving aspect ratio; never enlarges.
    pub fn resize_to_width(&self, image: &DynamicImage, target_width: u32) -> DynamicImage {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 || target_width >= width {
            return image.clone();
        }
        let target_height = ((u64::from(height) * u64::from(target_width)
            + u64::from(width) / 2)
            / u64::from(width))
        .max(1) as u32;
        image.resize_exact(target_width, target_height, FilterType::Lanczos3)
    }

    /// Straight alpha-over composite of `overlay` onto `base` at `(left, top)`.
    pub fn composite_over(
        &self,
        base: &DynamicImage,
        overlay: &DynamicImage,
        left: u32,
        top: u32,
    ) -> DynamicImage {
        let mut canvas = base.to_rgba8();
        imageops::overlay(
            &mut canvas,
            &overlay.to_rgba8(),
            i64::from(left),
            i64::from(top),
        );
        DynamicImage::ImageRgba8(canvas)
    }

    /// Flatten alpha against white and encode as JPEG at `quality`.
    pub fn encode_jpeg(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
        let flattened = flatten_alpha(image);
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
        encoder
            .encode_image(&DynamicImage::ImageRgb8(flattened))
            .context("jpeg encode failed")?;
        Ok(bytes)
    }
}

fn flatten_alpha(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]),
        );
    }
    flattened
}

// ---------------------------------------------------------------------------
// Placement scoring and selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SampleRect {
    left: u32,
    top: u32,
    width: u32,
    height: u32,
}

/// Region the logo would occupy plus margin, clipped to the base bounds.
fn sample_rect(
    base_width: u32,
    base_height: u32,
    overlay_width: u32,
    overlay_height: u32,
    margin: u32,
    left: u32,
    top: u32,
) -> SampleRect {
    SampleRect {
        left,
        top,
        width: overlay_width
            .saturating_add(margin)
            .min(base_width.saturating_sub(left)),
        height: overlay_height
            .saturating_add(margin)
            .min(base_height.saturating_sub(top)),
    }
}

struct ScoredPlacement {
    position: CornerPosition,
    left: u32,
    top: u32,
    score: f64,
}

struct SelectedPlacement {
    position: CornerPosition,
    left: u32,
    top: u32,
    score: Option<f64>,
    auto_placed: bool,
}

/// Busyness of one candidate corner: greyscale entropy (bits) plus standard
/// deviation normalized to [0, 1] so the two stay commensurate. Lower means a
/// visually calmer region. The exact weighting is a tunable heuristic; only
/// the comparative ordering matters.
#[allow(clippy::too_many_arguments)]
fn score_candidate(
    capability: &ImageCapability,
    base: &DynamicImage,
    base_width: u32,
    base_height: u32,
    overlay_width: u32,
    overlay_height: u32,
    margin: u32,
    position: CornerPosition,
) -> Result<ScoredPlacement> {
    let (left, top) =
        position.resolve_offsets(base_width, base_height, overlay_width, overlay_height, margin);
    let rect = sample_rect(
        base_width,
        base_height,
        overlay_width,
        overlay_height,
        margin,
        left,
        top,
    );
    let stats = capability.region_stats(base, rect)?;
    Ok(ScoredPlacement {
        position,
        left,
        top,
        score: stats.entropy + stats.std_dev / 255.0,
    })
}

/// Forced position wins unconditionally; otherwise auto placement scores the
/// deduped candidates and keeps the strict minimum (first-scored wins ties);
/// the fallback position covers scoring being disabled or every candidate
/// failing.
fn select_placement(
    capability: &ImageCapability,
    base: &DynamicImage,
    base_width: u32,
    base_height: u32,
    overlay_width: u32,
    overlay_height: u32,
    options: &WatermarkOptions,
) -> SelectedPlacement {
    if let Some(position) = options.force_position {
        let (left, top) = position.resolve_offsets(
            base_width,
            base_height,
            overlay_width,
            overlay_height,
            options.margin_px,
        );
        return SelectedPlacement {
            position,
            left,
            top,
            score: None,
            auto_placed: false,
        };
    }

    if options.auto_placement {
        let mut best: Option<ScoredPlacement> = None;
        for candidate in options.deduped_candidates() {
            // A failing candidate is dropped, never fatal to the pass.
            let Ok(scored) = score_candidate(
                capability,
                base,
                base_width,
                base_height,
                overlay_width,
                overlay_height,
                options.margin_px,
                candidate,
            ) else {
                continue;
            };
            if best
                .as_ref()
                .map_or(true, |current| scored.score < current.score)
            {
                best = Some(scored);
            }
        }
        if let Some(winner) = best {
            return SelectedPlacement {
                position: winner.position,
                left: winner.left,
                top: winner.top,
                score: Some(winner.score),
                auto_placed: true,
            };
        }
    }

    let position = options.fallback_position;
    let (left, top) = position.resolve_offsets(
        base_width,
        base_height,
        overlay_width,
        overlay_height,
        options.margin_px,
    );
    SelectedPlacement {
        position,
        left,
        top,
        score: None,
        auto_placed: false,
    }
}

// ---------------------------------------------------------------------------
// Logo resolution and sizing
// ---------------------------------------------------------------------------

fn resolve_logo_path(override_path: Option<&Path>) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = override_path {
        candidates.push(path.to_path_buf());
    }
    candidates.extend(LOGO_SEARCH_PATHS.iter().map(PathBuf::from));
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }
    let searched = candidates
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    bail!(
        "watermark logo not found; set WATERMARK_LOGO_PATH or place the asset at one of: {searched}"
    );
}

fn logo_target_width(base_width: u32, options: &WatermarkOptions) -> u32 {
    let scaled = (f64::from(base_width) * options.logo_width_ratio).round() as u32;
    scaled.max(options.min_logo_width_px)
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Watermark `image_bytes` and re-encode as JPEG, degrading instead of
/// failing when the bytes resist decoding:
///
/// - codec capability unavailable: original bytes pass through untouched;
/// - dimensions unreadable but pixels decodable: JPEG conversion without a
///   watermark;
/// - bytes not decodable at all: original bytes pass through untouched.
///
/// A missing logo asset or an encode failure is a real `Err`; the calling
/// pipeline decides whether to ship the unbranded original instead.
pub fn watermark_and_prefer_jpeg(
    image_bytes: &[u8],
    declared_content_type: Option<&str>,
    options: &WatermarkOptions,
) -> Result<WatermarkOutcome> {
    let Some(capability) = ImageCapability::probe() else {
        return Ok(passthrough_outcome(image_bytes, declared_content_type));
    };

    let metadata = capability.load_metadata(image_bytes);
    let decoded = capability.decode(image_bytes).ok();
    match (metadata, decoded) {
        (Some((base_width, base_height)), Some(base)) => {
            brand(&capability, base, base_width, base_height, options)
        }
        (None, Some(base)) => {
            let buffer = capability.encode_jpeg(&base, options.jpeg_quality)?;
            Ok(WatermarkOutcome {
                buffer,
                report: WatermarkReport {
                    content_type: "image/jpeg".to_string(),
                    extension: "jpg".to_string(),
                    watermarked: false,
                    placement: None,
                },
            })
        }
        _ => Ok(passthrough_outcome(image_bytes, declared_content_type)),
    }
}

fn brand(
    capability: &ImageCapability,
    base: DynamicImage,
    base_width: u32,
    base_height: u32,
    options: &WatermarkOptions,
) -> Result<WatermarkOutcome> {
    let logo_path = resolve_logo_path(options.logo_path.as_deref())?;
    let logo_bytes = fs::read(&logo_path)
        .with_context(|| format!("failed reading watermark logo {}", logo_path.display()))?;
    let logo = capability
        .decode(&logo_bytes)
        .with_context(|| format!("failed decoding watermark logo {}", logo_path.display()))?;

    let sized_logo = capability.resize_to_width(&logo, logo_target_width(base_width, options));
    let (overlay_width, overlay_height) = sized_logo.dimensions();
    let placement = select_placement(
        capability,
        &base,
        base_width,
        base_height,
        overlay_width,
        overlay_height,
        options,
    );
    let composited = capability.composite_over(&base, &sized_logo, placement.left, placement.top);
    let buffer = capability.encode_jpeg(&composited, options.jpeg_quality)?;
    Ok(WatermarkOutcome {
        buffer,
        report: WatermarkReport {
            content_type: "image/jpeg".to_string(),
            extension: "jpg".to_string(),
            watermarked: true,
            placement: Some(PlacementMetadata {
                position: placement.position,
                score: placement.score,
                auto_placed: placement.auto_placed,
            }),
        },
    })
}

fn passthrough_outcome(bytes: &[u8], declared_content_type: Option<&str>) -> WatermarkOutcome {
    let (content_type, extension) = content_type_and_extension(declared_content_type);
    WatermarkOutcome {
        buffer: bytes.to_vec(),
        report: WatermarkReport {
            content_type,
            extension,
            watermarked: false,
            placement: None,
        },
    }
}

fn content_type_and_extension(declared: Option<&str>) -> (String, String) {
    let normalized = declared
        .map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
        .filter(|value| !value.is_empty());
    match normalized.as_deref() {
        Some("image/jpeg") | Some("image/jpg") => ("image/jpeg".to_string(), "jpg".to_string()),
        Some("image/png") => ("image/png".to_string(), "png".to_string()),
        Some("image/webp") => ("image/webp".to_string(), "webp".to_string()),
        Some("image/gif") => ("image/gif".to_string(), "gif".to_string()),
        Some(other) => (other.to_string(), "bin".to_string()),
        None => ("application/octet-stream".to_string(), "bin".to_string()),
    }
}

/// Declared content type for a file based on its extension.
pub fn guess_content_type(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())?;
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Image generation providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub run_dir: PathBuf,
    pub prompt: String,
    pub theme: Option<Theme>,
    pub size: String,
    pub n: u64,
    pub seed: Option<i64>,
}

impl GenerateRequest {
    /// Prompt actually sent to the provider: the theme template expanded with
    /// the pet details, or the raw prompt when no theme was picked.
    pub fn effective_prompt(&self) -> String {
        match self.theme {
            Some(theme) => theme.prompt_for(&self.prompt),
            None => self.prompt.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    pub image_path: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: Vec<String>,
    pub artifacts: Vec<GeneratedArtifact>,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(DryrunProvider);
    registry.register(OpenAiImageProvider::new());
    registry
}

/// Offline provider for tests and demos: deterministic solid-color artifacts
/// derived from the prompt and seed.
pub struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let (width, height) = parse_dims(&request.size);
        let prompt = request.effective_prompt();
        let stamp = timestamp_millis();
        let mut artifacts = Vec::new();
        for idx in 0..request.n.max(1) {
            let seed = request.seed.unwrap_or_default() as u64;
            let (r, g, b) = color_from_prompt(&prompt, seed.wrapping_add(idx));
            let image = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
            let image_path = request.run_dir.join(format!(
                "artifact-{}-{:02}-{}.png",
                stamp,
                idx,
                short_artifact_id(&prompt, idx)
            ));
            image
                .save(&image_path)
                .with_context(|| format!("failed to save {}", image_path.display()))?;
            artifacts.push(GeneratedArtifact {
                image_path,
                width,
                height,
            });
        }
        Ok(GenerateResponse {
            provider_request: map_object(json!({
                "endpoint": "dryrun-native",
                "payload": {
                    "prompt": prompt,
                    "size": request.size,
                    "n": request.n,
                    "seed": request.seed,
                }
            })),
            provider_response: map_object(json!({
                "status": "ok",
                "count": artifacts.len(),
            })),
            warnings: Vec::new(),
            artifacts,
        })
    }
}

/// OpenAI-compatible image generation over `POST {base}/images/generations`.
pub struct OpenAiImageProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl OpenAiImageProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: env::var("OPENAI_IMAGE_MODEL")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "gpt-image-1".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("OPENAI_API_KEY")
    }

    fn payload_bytes(&self, payload: GeneratedPayload) -> Result<(Vec<u8>, Option<String>)> {
        match payload {
            GeneratedPayload::Base64(data) => {
                let compact: String = data.split_whitespace().collect();
                let bytes = BASE64
                    .decode(compact.as_bytes())
                    .context("image base64 decode failed")?;
                Ok((bytes, None))
            }
            GeneratedPayload::DataUrl { mime, data } => {
                let bytes = BASE64
                    .decode(data.as_bytes())
                    .context("data URL base64 decode failed")?;
                Ok((bytes, Some(mime)))
            }
            GeneratedPayload::Url(url) => {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .with_context(|| format!("failed downloading generated image ({url})"))?;
                if !response.status().is_success() {
                    let code = response.status().as_u16();
                    let body = response.text().unwrap_or_default();
                    bail!(
                        "generated image download failed ({code}): {}",
                        truncate_text(&body, 512)
                    );
                }
                let mime = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let bytes = response
                    .bytes()
                    .context("failed reading generated image bytes")?
                    .to_vec();
                Ok((bytes, mime))
            }
        }
    }
}

impl Default for OpenAiImageProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for OpenAiImageProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let Some(api_key) = Self::api_key() else {
            bail!("OPENAI_API_KEY not set");
        };
        let endpoint = format!("{}/images/generations", self.api_base);
        let prompt = request.effective_prompt();
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "n": request.n.max(1),
            "size": request.size,
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("OpenAI", response)?;
        let payloads = normalize_generation_output(&response_payload)?;

        let (width, height) = parse_dims(&request.size);
        let stamp = timestamp_millis();
        let mut artifacts = Vec::new();
        for (idx, item) in payloads
            .into_iter()
            .take(request.n.max(1) as usize)
            .enumerate()
        {
            let (bytes, mime) = self.payload_bytes(item)?;
            let ext = extension_from_mime(mime.as_deref());
            let image_path = request
                .run_dir
                .join(format!("artifact-{}-{:02}.{}", stamp, idx, ext));
            fs::write(&image_path, &bytes)
                .with_context(|| format!("failed to write {}", image_path.display()))?;
            artifacts.push(GeneratedArtifact {
                image_path,
                width,
                height,
            });
        }
        if artifacts.is_empty() {
            bail!("OpenAI response returned no images");
        }

        Ok(GenerateResponse {
            provider_request: map_object(json!({
                "endpoint": endpoint,
                "payload": payload,
            })),
            provider_response: map_object(json!({
                "created": response_payload.get("created").cloned().unwrap_or(Value::Null),
                "count": artifacts.len(),
            })),
            warnings: Vec::new(),
            artifacts,
        })
    }
}

// ---------------------------------------------------------------------------
// Stylize-and-brand pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BrandedArtifact {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub report: WatermarkReport,
}

#[derive(Debug, Clone)]
pub struct PipelineRunSummary {
    pub provider: String,
    pub prompt: String,
    pub artifacts: Vec<BrandedArtifact>,
    pub warnings: Vec<String>,
}

/// Generate artifacts with the named provider, then watermark each one. A
/// watermark failure for an artifact keeps the unbranded original and records
/// a warning instead of failing the run.
pub fn stylize_and_brand(
    registry: &ProviderRegistry,
    provider_name: &str,
    request: &GenerateRequest,
    watermark: &WatermarkOptions,
    events: &EventLog,
) -> Result<PipelineRunSummary> {
    let provider = registry.get(provider_name).ok_or_else(|| {
        anyhow!(
            "unknown image provider '{provider_name}' (available: {})",
            registry.names().join(", ")
        )
    })?;
    fs::create_dir_all(&request.run_dir)
        .with_context(|| format!("failed to create {}", request.run_dir.display()))?;

    let prompt = request.effective_prompt();
    events.emit(
        "generation_started",
        map_object(json!({
            "provider": provider.name(),
            "prompt": prompt,
            "size": request.size,
            "n": request.n,
        })),
    )?;
    let response = provider.generate(request)?;
    let mut warnings = response.warnings.clone();
    events.emit(
        "generation_finished",
        map_object(json!({ "count": response.artifacts.len() })),
    )?;

    let mut artifacts = Vec::new();
    for artifact in &response.artifacts {
        let bytes = fs::read(&artifact.image_path)
            .with_context(|| format!("failed reading {}", artifact.image_path.display()))?;
        let declared = guess_content_type(&artifact.image_path);
        match watermark_and_prefer_jpeg(&bytes, declared, watermark) {
            Ok(outcome) => {
                let output_path = branded_sibling(&artifact.image_path, &outcome.report.extension);
                fs::write(&output_path, &outcome.buffer)
                    .with_context(|| format!("failed to write {}", output_path.display()))?;
                let mut fields = map_object(json!({
                    "source": artifact.image_path.display().to_string(),
                    "output": output_path.display().to_string(),
                    "watermarked": outcome.report.watermarked,
                }));
                if let Some(placement) = &outcome.report.placement {
                    fields.insert(
                        "position".to_string(),
                        Value::String(placement.position.to_string()),
                    );
                    if let Some(score) = placement.score {
                        fields.insert("score".to_string(), json!(score));
                    }
                }
                events.emit("watermark_applied", fields)?;
                artifacts.push(BrandedArtifact {
                    source_path: artifact.image_path.clone(),
                    output_path,
                    report: outcome.report,
                });
            }
            Err(err) => {
                // Ship the unbranded original rather than failing the run.
                let warning = format!(
                    "watermark failed for {}: {err:#}",
                    artifact.image_path.display()
                );
                events.emit(
                    "watermark_skipped",
                    map_object(json!({
                        "source": artifact.image_path.display().to_string(),
                        "error": format!("{err:#}"),
                    })),
                )?;
                warnings.push(warning);
                let (content_type, extension) = content_type_and_extension(declared);
                artifacts.push(BrandedArtifact {
                    source_path: artifact.image_path.clone(),
                    output_path: artifact.image_path.clone(),
                    report: WatermarkReport {
                        content_type,
                        extension,
                        watermarked: false,
                        placement: None,
                    },
                });
            }
        }
    }

    events.emit(
        "run_finished",
        map_object(json!({
            "artifacts": artifacts.len(),
            "warnings": warnings.len(),
        })),
    )?;
    Ok(PipelineRunSummary {
        provider: provider.name().to_string(),
        prompt,
        artifacts,
        warnings,
    })
}

fn branded_sibling(path: &Path, extension: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("artifact");
    path.with_file_name(format!("{stem}-branded.{extension}"))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_dims(size: &str) -> (u32, u32) {
    if let Some((raw_width, raw_height)) = size.trim().split_once(['x', 'X']) {
        let width = raw_width.trim().parse::<u32>().unwrap_or(0);
        let height = raw_height.trim().parse::<u32>().unwrap_or(0);
        if width > 0 && height > 0 {
            return (width, height);
        }
    }
    (1024, 1024)
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_artifact_id(prompt: &str, idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(idx.to_be_bytes());
    hex::encode(&hasher.finalize()[..4])
}

fn extension_from_mime(mime: Option<&str>) -> &'static str {
    let normalized = mime
        .map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
        .unwrap_or_default();
    match normalized.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(provider: &str, response: reqwest::blocking::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        bail!(
            "{provider} request failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, 512)
        );
    }
    response
        .json()
        .with_context(|| format!("failed parsing {provider} JSON response"))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let truncated: String = value.chars().take(max_chars).collect();
    format!("{truncated}...")
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use image::{ImageFormat, Luma, Rgba, RgbaImage};
    use petcard_contracts::events::{new_run_id, EventLog};
    use petcard_contracts::generation::Theme;
    use petcard_contracts::watermark::CornerPosition;

    use super::*;

    fn write_logo(dir: &Path, width: u32, height: u32) -> PathBuf {
        let mut logo = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 180]));
        for x in 0..width {
            logo.put_pixel(x, 0, Rgba([0, 0, 0, 255]));
            logo.put_pixel(x, height - 1, Rgba([0, 0, 0, 255]));
        }
        let path = dir.join("watermark-logo.png");
        logo.save(&path).unwrap();
        path
    }

    fn png_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        image.write_to(&mut cursor, ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    fn flat_png(width: u32, height: u32, luma: u8) -> Vec<u8> {
        let image = DynamicImage::ImageLuma8(image::ImageBuffer::from_pixel(
            width,
            height,
            Luma([luma]),
        ));
        png_bytes(&image)
    }

    fn noisy_top_left_png(width: u32, height: u32) -> Vec<u8> {
        let mut image = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
        for y in 0..height / 2 {
            for x in 0..width / 2 {
                let value = ((x * 7919 + y * 104_729) % 256) as u8;
                image.put_pixel(x, y, Rgb([value, value.wrapping_mul(3), value ^ 0xa5]));
            }
        }
        png_bytes(&DynamicImage::ImageRgb8(image))
    }

    fn options_with_logo(logo: PathBuf) -> WatermarkOptions {
        WatermarkOptions {
            logo_path: Some(logo),
            ..WatermarkOptions::default()
        }
    }

    #[test]
    fn capability_probe_succeeds() {
        assert!(ImageCapability::probe().is_some());
    }

    #[test]
    fn logo_width_follows_ratio_with_floor() {
        let options = WatermarkOptions::default();
        assert_eq!(logo_target_width(1000, &options), 220);
        assert_eq!(logo_target_width(100, &options), 64);
    }

    #[test]
    fn resize_is_shrink_only_and_deterministic() {
        let capability = ImageCapability::probe().unwrap();
        let logo = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            400,
            160,
            Rgba([10, 200, 30, 255]),
        ));

        let once = capability.resize_to_width(&logo, 220);
        let twice = capability.resize_to_width(&logo, 220);
        assert_eq!(once.dimensions(), (220, 88));
        assert_eq!(png_bytes(&once), png_bytes(&twice));

        let untouched = capability.resize_to_width(&logo, 800);
        assert_eq!(untouched.dimensions(), (400, 160));
    }

    #[test]
    fn sample_rect_clips_to_image_bounds() {
        let rect = sample_rect(1000, 800, 220, 90, 24, 756, 686);
        assert_eq!(rect.width, 244);
        assert_eq!(rect.height, 114);

        let clipped = sample_rect(100, 100, 90, 90, 24, 10, 10);
        assert!(clipped.left + clipped.width <= 100);
        assert!(clipped.top + clipped.height <= 100);
    }

    #[test]
    fn end_to_end_watermarks_opaque_png_with_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let options = options_with_logo(write_logo(temp.path(), 400, 160));
        let input = flat_png(1000, 1000, 200);

        let outcome = watermark_and_prefer_jpeg(&input, Some("image/png"), &options).unwrap();
        assert_eq!(outcome.report.content_type, "image/jpeg");
        assert_eq!(outcome.report.extension, "jpg");
        assert!(outcome.report.watermarked);
        assert_eq!(&outcome.buffer[..2], &[0xff, 0xd8]);

        let placement = outcome.report.placement.expect("placement metadata");
        assert!(placement.auto_placed);
        assert!(placement.score.is_some());
    }

    #[test]
    fn forced_position_bypasses_scoring() {
        let temp = tempfile::tempdir().unwrap();
        let mut options = options_with_logo(write_logo(temp.path(), 400, 160));
        options.force_position = Some(CornerPosition::TopLeft);
        let input = noisy_top_left_png(400, 400);

        let outcome = watermark_and_prefer_jpeg(&input, Some("image/png"), &options).unwrap();
        let placement = outcome.report.placement.expect("placement metadata");
        assert_eq!(placement.position, CornerPosition::TopLeft);
        assert!(placement.score.is_none());
        assert!(!placement.auto_placed);
    }

    #[test]
    fn auto_placement_avoids_the_noisy_quadrant() {
        let temp = tempfile::tempdir().unwrap();
        let options = options_with_logo(write_logo(temp.path(), 400, 160));
        let input = noisy_top_left_png(400, 400);

        let outcome = watermark_and_prefer_jpeg(&input, Some("image/png"), &options).unwrap();
        let placement = outcome.report.placement.expect("placement metadata");
        assert!(placement.auto_placed);
        assert_ne!(placement.position, CornerPosition::TopLeft);
    }

    #[test]
    fn disabled_auto_placement_uses_fallback_position() {
        let temp = tempfile::tempdir().unwrap();
        let mut options = options_with_logo(write_logo(temp.path(), 400, 160));
        options.auto_placement = false;
        let input = flat_png(600, 600, 90);

        let outcome = watermark_and_prefer_jpeg(&input, Some("image/png"), &options).unwrap();
        let placement = outcome.report.placement.expect("placement metadata");
        assert_eq!(placement.position, CornerPosition::BottomRight);
        assert!(placement.score.is_none());
    }

    #[test]
    fn garbage_bytes_degrade_to_passthrough() {
        let temp = tempfile::tempdir().unwrap();
        let options = options_with_logo(write_logo(temp.path(), 400, 160));
        let input = b"definitely not an image".to_vec();

        let outcome = watermark_and_prefer_jpeg(&input, Some("image/png"), &options).unwrap();
        assert!(!outcome.report.watermarked);
        assert_eq!(outcome.buffer, input);
        assert_eq!(outcome.report.content_type, "image/png");
        assert!(outcome.report.placement.is_none());
    }

    #[test]
    fn missing_logo_error_names_the_env_var() {
        let temp = tempfile::tempdir().unwrap();
        let options = options_with_logo(temp.path().join("no-such-logo.png"));
        let input = flat_png(500, 500, 40);

        let err = watermark_and_prefer_jpeg(&input, Some("image/png"), &options).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("WATERMARK_LOGO_PATH"), "{message}");
        assert!(message.contains("no-such-logo.png"), "{message}");
    }

    #[test]
    fn unknown_declared_type_passes_through_as_declared() {
        let (content_type, extension) = content_type_and_extension(Some("image/tiff"));
        assert_eq!(content_type, "image/tiff");
        assert_eq!(extension, "bin");

        let (content_type, extension) = content_type_and_extension(None);
        assert_eq!(content_type, "application/octet-stream");
        assert_eq!(extension, "bin");

        let (content_type, extension) =
            content_type_and_extension(Some("image/JPEG; charset=binary"));
        assert_eq!(content_type, "image/jpeg");
        assert_eq!(extension, "jpg");
    }

    #[test]
    fn dryrun_provider_is_deterministic_per_prompt_and_seed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first_dir = temp.path().join("a");
        let second_dir = temp.path().join("b");
        fs::create_dir_all(&first_dir)?;
        fs::create_dir_all(&second_dir)?;

        let request = |run_dir: PathBuf| GenerateRequest {
            run_dir,
            prompt: "a corgi named Biscuit".to_string(),
            theme: Some(Theme::BaseballCard),
            size: "64x64".to_string(),
            n: 2,
            seed: Some(7),
        };
        let first = DryrunProvider.generate(&request(first_dir))?;
        let second = DryrunProvider.generate(&request(second_dir))?;
        assert_eq!(first.artifacts.len(), 2);
        assert_eq!(
            fs::read(&first.artifacts[0].image_path)?,
            fs::read(&second.artifacts[0].image_path)?
        );
        Ok(())
    }

    #[test]
    fn pipeline_brands_dryrun_artifacts_and_logs_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let run_dir = temp.path().join("run");
        let options = options_with_logo(write_logo(temp.path(), 400, 160));
        let events = EventLog::new(run_dir.join("events.jsonl"), new_run_id());

        let mut registry = ProviderRegistry::new();
        registry.register(DryrunProvider);
        let request = GenerateRequest {
            run_dir: run_dir.clone(),
            prompt: "a tabby cat".to_string(),
            theme: Some(Theme::Superhero),
            size: "256x256".to_string(),
            n: 1,
            seed: None,
        };

        let summary = stylize_and_brand(&registry, "dryrun", &request, &options, &events)?;
        assert_eq!(summary.provider, "dryrun");
        assert!(summary.warnings.is_empty());
        assert_eq!(summary.artifacts.len(), 1);

        let branded = &summary.artifacts[0];
        assert!(branded.report.watermarked);
        assert!(branded
            .output_path
            .to_string_lossy()
            .ends_with("-branded.jpg"));
        assert!(branded.output_path.is_file());

        let log = fs::read_to_string(events.path())?;
        let kinds: Vec<String> = log
            .lines()
            .map(|line| {
                let record: Value = serde_json::from_str(line).unwrap();
                record["event"].as_str().unwrap_or_default().to_string()
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "generation_started",
                "generation_finished",
                "watermark_applied",
                "run_finished",
            ]
        );
        Ok(())
    }

    #[test]
    fn pipeline_keeps_original_when_watermark_fails() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let run_dir = temp.path().join("run");
        let options = options_with_logo(temp.path().join("missing-logo.png"));
        let events = EventLog::new(run_dir.join("events.jsonl"), new_run_id());

        let mut registry = ProviderRegistry::new();
        registry.register(DryrunProvider);
        let request = GenerateRequest {
            run_dir,
            prompt: "a parrot".to_string(),
            theme: None,
            size: "128x128".to_string(),
            n: 1,
            seed: Some(3),
        };

        let summary = stylize_and_brand(&registry, "dryrun", &request, &options, &events)?;
        assert_eq!(summary.artifacts.len(), 1);
        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.warnings[0].contains("WATERMARK_LOGO_PATH"));

        let kept = &summary.artifacts[0];
        assert!(!kept.report.watermarked);
        assert_eq!(kept.output_path, kept.source_path);
        assert!(kept.source_path.is_file());
        Ok(())
    }

    #[test]
    fn unknown_provider_is_a_descriptive_error() {
        let temp = tempfile::tempdir().unwrap();
        let events = EventLog::new(temp.path().join("events.jsonl"), new_run_id());
        let registry = ProviderRegistry::new();
        let request = GenerateRequest {
            run_dir: temp.path().to_path_buf(),
            prompt: "a dog".to_string(),
            theme: None,
            size: "64x64".to_string(),
            n: 1,
            seed: None,
        };
        let err = stylize_and_brand(
            &registry,
            "nope",
            &request,
            &WatermarkOptions::default(),
            &events,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown image provider"));
    }

    #[test]
    fn parse_dims_accepts_wxh_and_defaults_otherwise() {
        assert_eq!(parse_dims("512x768"), (512, 768));
        assert_eq!(parse_dims(" 1024X1024 "), (1024, 1024));
        assert_eq!(parse_dims("square"), (1024, 1024));
        assert_eq!(parse_dims("0x100"), (1024, 1024));
    }

    #[test]
    fn short_artifact_id_is_stable() {
        assert_eq!(
            short_artifact_id("prompt", 0),
            short_artifact_id("prompt", 0)
        );
        assert_ne!(
            short_artifact_id("prompt", 0),
            short_artifact_id("prompt", 1)
        );
    }
}

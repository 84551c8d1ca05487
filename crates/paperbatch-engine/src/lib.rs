use std::env;
use std::fs;
use std::io::{Cursor, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use paperbatch_contracts::events::EventWriter;
use paperbatch_contracts::jobs::{sanitize_job_id, JobLedger, JobRecord};
use paperbatch_contracts::models::ModelRegistry;
use paperbatch_contracts::prompts::{clean_prompt_lines, pad_to_count};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

pub const A4_WIDTH: u32 = 2480;
pub const A4_HEIGHT: u32 = 3508;

const RASTER_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];
const DRYRUN_STASH_DIR: &str = ".dryrun";

const CREATIVE_DIRECTOR_BRIEF: &str = "You are a creative director for a digital art shop on Etsy selling 'Junk Journal' background papers.";

/// Outcome of one status query against the remote batch service. Non-terminal
/// vendor states pass through verbatim in `Running`.
#[derive(Debug, Clone)]
pub enum BatchPoll {
    Running { state: String },
    Failed { error: String },
    Succeeded { results: String },
}

pub trait BatchBackend: Send + Sync {
    fn name(&self) -> &str;
    fn generate_text(&self, model: &str, instruction: &str) -> Result<String>;
    fn submit(&self, model: &str, prompts: &[String]) -> Result<String>;
    fn poll(&self, job_id: &str) -> Result<BatchPoll>;
}

/// Offline backend: fabricates themes, prompts, and result streams so the
/// whole submit/check/materialize pipeline can run without network access.
/// Submitted request files are stashed under `<root>/.dryrun/` and replayed as
/// a result stream of deterministic solid-color PNGs on poll.
pub struct DryrunBackend {
    root: PathBuf,
}

impl DryrunBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn stash_path(&self, safe_id: &str) -> PathBuf {
        self.root
            .join(DRYRUN_STASH_DIR)
            .join(format!("{safe_id}.jsonl"))
    }
}

impl BatchBackend for DryrunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_text(&self, _model: &str, instruction: &str) -> Result<String> {
        if instruction.contains("one per line") {
            let lines: Vec<String> = (0..8)
                .map(|idx| {
                    format!(
                        "{}. Dryrun textured background page, variant {} ({}).",
                        idx + 1,
                        idx + 1,
                        short_id(instruction, idx)
                    )
                })
                .collect();
            return Ok(lines.join("\n"));
        }
        Ok(format!(
            "Dryrun Collection {}: deterministic placeholder papers for offline runs.",
            short_id(instruction, 0)
        ))
    }

    fn submit(&self, _model: &str, prompts: &[String]) -> Result<String> {
        let id = format!("dryrun-{}", short_id(&prompts.join("\n"), prompts.len() as u64));
        let stash = self.stash_path(&id);
        if let Some(parent) = stash.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&stash, build_request_lines(prompts).join("\n"))
            .with_context(|| format!("failed writing {}", stash.display()))?;
        Ok(format!("batches/{id}"))
    }

    fn poll(&self, job_id: &str) -> Result<BatchPoll> {
        let safe_id = sanitize_job_id(job_id)?;
        let stash = self.stash_path(&safe_id);
        let raw = fs::read_to_string(&stash)
            .with_context(|| format!("dryrun job {job_id} has no stashed request file"))?;

        let mut lines = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            let request: Value = serde_json::from_str(line)
                .with_context(|| format!("dryrun stash for {job_id} is corrupt"))?;
            let prompt = request
                .get("request")
                .and_then(|req| req.get("contents"))
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
                .and_then(|part| part.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let png = dryrun_png(&prompt)?;
            lines.push(
                json!({
                    "response": {
                        "candidates": [{
                            "content": {
                                "parts": [{
                                    "inlineData": {
                                        "mimeType": "image/png",
                                        "data": BASE64.encode(png),
                                    }
                                }]
                            }
                        }]
                    }
                })
                .to_string(),
            );
        }

        Ok(BatchPoll::Succeeded {
            results: lines.join("\n"),
        })
    }
}

/// Blocking client for the Gemini REST surface this tool touches: text
/// generation, Files API upload, batch create/get, and result download.
pub struct GeminiBatchClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl GeminiBatchClient {
    /// Missing credentials are fatal here, before any work is attempted.
    pub fn from_env() -> Result<Self> {
        let Some(api_key) = non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
        else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        Ok(Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            api_key,
            http: HttpClient::new(),
        })
    }

    fn endpoint_for_model(&self, model: &str, verb: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:{verb}", self.api_base, model_path)
    }

    fn upload_endpoint(&self) -> String {
        match self.api_base.strip_suffix("/v1beta") {
            Some(root) => format!("{root}/upload/v1beta/files"),
            None => format!("{}/files", self.api_base),
        }
    }

    fn upload_jsonl(&self, bytes: Vec<u8>) -> Result<String> {
        let endpoint = self.upload_endpoint();
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .header("x-goog-upload-protocol", "raw")
            .header(CONTENT_TYPE, "application/json")
            .body(bytes)
            .send()
            .with_context(|| format!("file upload request failed ({endpoint})"))?;
        let payload = response_json_or_error("file upload", response)?;
        payload
            .get("file")
            .and_then(|file| file.get("name"))
            .or_else(|| payload.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("file upload response carried no file name")
    }

    fn create_batch(&self, model: &str, file_name: &str) -> Result<String> {
        let endpoint = self.endpoint_for_model(model, "batchGenerateContent");
        let payload = json!({
            "batch": {
                "displayName": format!("paperbatch-{}", Uuid::new_v4()),
                "inputConfig": { "fileName": file_name },
            }
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .with_context(|| format!("batch create request failed ({endpoint})"))?;
        let payload = response_json_or_error("batch create", response)?;
        payload
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("batch create response carried no job name")
    }

    fn get_batch(&self, job_id: &str) -> Result<Value> {
        let endpoint = format!("{}/{job_id}", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .with_context(|| format!("batch status request failed ({endpoint})"))?;
        response_json_or_error("batch status", response)
    }

    fn download_result_file(&self, file_name: &str) -> Result<String> {
        let endpoint = format!("{}/{file_name}:download", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .query(&[("alt", "media"), ("key", self.api_key.as_str())])
            .send()
            .with_context(|| format!("result download request failed ({endpoint})"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "result download failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        response
            .text()
            .context("result download body read failed")
    }

    fn list_files(&self) -> Result<Vec<Value>> {
        let endpoint = format!("{}/files", self.api_base);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(&endpoint)
                .query(&[("key", self.api_key.as_str()), ("pageSize", "100")]);
            if let Some(token) = page_token.as_deref() {
                request = request.query(&[("pageToken", token)]);
            }
            let response = request
                .send()
                .with_context(|| format!("file listing request failed ({endpoint})"))?;
            let payload = response_json_or_error("file listing", response)?;
            if let Some(rows) = payload.get("files").and_then(Value::as_array) {
                files.extend(rows.iter().cloned());
            }
            page_token = payload
                .get("nextPageToken")
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|token| !token.is_empty());
            if page_token.is_none() {
                break;
            }
        }
        Ok(files)
    }

    fn fetch_file_by_uri(&self, uri: &str) -> Result<String> {
        let response = self
            .http
            .get(uri)
            .query(&[("alt", "media")])
            .header("x-goog-api-key", self.api_key.as_str())
            .send()
            .with_context(|| format!("raw file fetch failed ({uri})"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("raw file fetch failed ({})", status.as_u16());
        }
        response.text().context("raw file fetch body read failed")
    }

    /// Primary path: SDK-style `:download`. The service rejects sufficiently
    /// large result files there, so any primary error falls back to locating
    /// the file's raw uri in the listing and fetching it with an explicit
    /// `x-goog-api-key` header. A name missing from the listing is terminal.
    fn fetch_results(&self, file_name: &str) -> Result<String> {
        match self.download_result_file(file_name) {
            Ok(content) => Ok(content),
            Err(primary_err) => {
                let files = self.list_files().context("fallback file listing failed")?;
                let uri = files
                    .iter()
                    .find(|file| file.get("name").and_then(Value::as_str) == Some(file_name))
                    .and_then(|file| file.get("uri").and_then(Value::as_str))
                    .map(str::to_string);
                let Some(uri) = uri else {
                    return Err(primary_err.context(format!(
                        "result file {file_name} is not present in the file listing"
                    )));
                };
                self.fetch_file_by_uri(&uri)
            }
        }
    }
}

impl BatchBackend for GeminiBatchClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_text(&self, model: &str, instruction: &str) -> Result<String> {
        let endpoint = self.endpoint_for_model(model, "generateContent");
        let payload = json!({
            "contents": [{ "parts": [{ "text": instruction }] }],
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .with_context(|| format!("text generation request failed ({endpoint})"))?;
        let payload = response_json_or_error("text generation", response)?;
        let text = extract_candidate_text(&payload);
        if text.trim().is_empty() {
            bail!("text model returned an empty response");
        }
        Ok(text)
    }

    fn submit(&self, model: &str, prompts: &[String]) -> Result<String> {
        // NamedTempFile guarantees the request file disappears on every exit
        // path, including upload or create failures.
        let mut request_file =
            tempfile::NamedTempFile::new().context("failed creating batch request file")?;
        for line in build_request_lines(prompts) {
            writeln!(request_file, "{line}").context("failed writing batch request file")?;
        }
        request_file
            .flush()
            .context("failed flushing batch request file")?;

        let bytes = fs::read(request_file.path()).context("failed reading batch request file")?;
        let file_name = self.upload_jsonl(bytes)?;
        self.create_batch(model, &file_name)
    }

    fn poll(&self, job_id: &str) -> Result<BatchPoll> {
        let payload = self.get_batch(job_id)?;
        let state = batch_state(&payload);
        match state.as_str() {
            "JOB_STATE_SUCCEEDED" => {
                let file_name = result_file_name(&payload)
                    .context("batch succeeded but reported no result file")?;
                let results = self.fetch_results(&file_name)?;
                Ok(BatchPoll::Succeeded { results })
            }
            "JOB_STATE_FAILED" => Ok(BatchPoll::Failed {
                error: batch_error_text(&payload),
            }),
            _ => Ok(BatchPoll::Running { state }),
        }
    }
}

/// One decoded inline image payload from the result stream.
#[derive(Debug, Clone)]
pub struct InlineImage {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ParsedResults {
    pub images: Vec<InlineImage>,
    pub discarded: u64,
}

/// Parses the newline-delimited result stream. Each line stands alone:
/// malformed lines bump `discarded` and never abort the parse. Only the first
/// candidate of each response is read; every part with inline base64 data
/// yields one image, in discovery order across the whole stream.
pub fn parse_result_lines(text: &str) -> ParsedResults {
    let mut parsed = ParsedResults::default();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<Value>(trimmed) else {
            parsed.discarded += 1;
            continue;
        };
        let parts = record
            .get("response")
            .and_then(|response| response.get("candidates"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let data = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(|inline| inline.get("data"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            match BASE64.decode(data.as_bytes()) {
                Ok(bytes) => parsed.images.push(InlineImage { bytes }),
                Err(_) => parsed.discarded += 1,
            }
        }
    }
    parsed
}

/// Writes decoded images into the job-scoped directory as
/// `img_<n>.png`, `n` contiguous from 0 in discovery order.
pub fn materialize_images(
    out_root: &Path,
    job_id: &str,
    images: &[InlineImage],
) -> Result<Vec<PathBuf>> {
    let job_dir = out_root.join(sanitize_job_id(job_id)?);
    fs::create_dir_all(&job_dir)
        .with_context(|| format!("failed creating {}", job_dir.display()))?;
    let mut written = Vec::with_capacity(images.len());
    for (idx, image) in images.iter().enumerate() {
        let path = job_dir.join(format!("img_{idx}.png"));
        fs::write(&path, &image.bytes)
            .with_context(|| format!("failed writing {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

/// Scale factors for cover-fitting an input onto the A4 canvas: the scaled
/// image always fully covers 2480x3508, never letterboxes.
pub fn cover_dimensions(width: u32, height: u32) -> (u32, u32) {
    let target_ratio = A4_WIDTH as f64 / A4_HEIGHT as f64;
    let ratio = width as f64 / height as f64;
    if ratio > target_ratio {
        let new_height = A4_HEIGHT;
        let new_width = ((new_height as f64) * ratio).round() as u32;
        (new_width.max(A4_WIDTH), new_height)
    } else {
        let new_width = A4_WIDTH;
        let new_height = ((new_width as f64) / ratio).round() as u32;
        (new_width, new_height.max(A4_HEIGHT))
    }
}

/// Cover-fit then center-crop to exactly A4 at 300dpi. Lanczos resampling;
/// the crop box is symmetric around the scaled image's center.
pub fn normalize_to_a4(image: &DynamicImage) -> DynamicImage {
    let (new_width, new_height) = cover_dimensions(image.width(), image.height());
    let resized = image.resize_exact(new_width, new_height, FilterType::Lanczos3);
    let left = (new_width - A4_WIDTH) / 2;
    let top = (new_height - A4_HEIGHT) / 2;
    resized.crop_imm(left, top, A4_WIDTH, A4_HEIGHT)
}

/// Bundles a directory's raster files into an in-memory deflate zip, entries
/// flattened to the archive root. Same-named files in different subfolders
/// overwrite earlier entries, matching the download bundle's contract.
pub fn zip_directory(dir: &Path) -> Result<Cursor<Vec<u8>>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(dir) {
        let entry = entry.with_context(|| format!("failed walking {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !has_raster_extension(name) {
            continue;
        }
        writer
            .start_file(name, options)
            .with_context(|| format!("failed adding {name} to archive"))?;
        let bytes = fs::read(entry.path())
            .with_context(|| format!("failed reading {}", entry.path().display()))?;
        writer
            .write_all(&bytes)
            .with_context(|| format!("failed compressing {name}"))?;
    }

    let mut cursor = writer.finish().context("failed finishing archive")?;
    cursor.set_position(0);
    Ok(cursor)
}

#[derive(Debug)]
pub enum CheckOutcome {
    Running { state: String },
    Failed { error: String },
    NoImages { discarded: u64 },
    Completed { images: Vec<PathBuf>, discarded: u64 },
}

/// Orchestration facade shared by every front end: owns the output root, the
/// ledger, the event log, and one backend.
pub struct BatchEngine {
    out_root: PathBuf,
    events: EventWriter,
    ledger: JobLedger,
    backend: Box<dyn BatchBackend>,
    text_model: String,
    image_model: String,
}

impl BatchEngine {
    pub fn new(
        out_root: impl Into<PathBuf>,
        backend: Box<dyn BatchBackend>,
        text_model: impl Into<String>,
        image_model: impl Into<String>,
    ) -> Result<Self> {
        let out_root = out_root.into();
        fs::create_dir_all(&out_root)
            .with_context(|| format!("failed creating {}", out_root.display()))?;
        let run_id = Uuid::new_v4().to_string();
        let events = EventWriter::new(out_root.join("events.jsonl"), run_id);
        let ledger = JobLedger::new(&out_root);

        events.emit(
            "run_started",
            json!({
                "out_dir": out_root.to_string_lossy().to_string(),
                "backend": backend.name(),
            }),
        )?;

        Ok(Self {
            out_root,
            events,
            ledger,
            backend,
            text_model: text_model.into(),
            image_model: image_model.into(),
        })
    }

    pub fn out_root(&self) -> &Path {
        &self.out_root
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn emit_event(&self, event_type: &str, payload: Value) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    pub fn synthesize_theme(&self, hint: Option<&str>) -> Result<String> {
        let instruction = theme_instruction(hint);
        let theme = self
            .backend
            .generate_text(&self.text_model, &instruction)?
            .trim()
            .to_string();
        if theme.is_empty() {
            bail!("theme model returned an empty response");
        }
        self.events.emit(
            "theme_selected",
            json!({
                "theme": theme,
                "hint": hint.unwrap_or_default(),
            }),
        )?;
        Ok(theme)
    }

    pub fn synthesize_prompts(&self, theme: &str, count: usize) -> Result<Vec<String>> {
        let instruction = prompt_list_instruction(theme, count);
        let raw = self.backend.generate_text(&self.text_model, &instruction)?;
        let prompts = pad_to_count(clean_prompt_lines(&raw), count)?;
        self.events.emit(
            "prompts_generated",
            json!({
                "theme": theme,
                "count": prompts.len(),
            }),
        )?;
        Ok(prompts)
    }

    /// Theme, prompt list, batch submission, ledger record: the whole "start a
    /// new set" flow.
    pub fn start_collection(&self, hint: Option<&str>, count: usize) -> Result<JobRecord> {
        let theme = self.synthesize_theme(hint)?;
        let prompts = self.synthesize_prompts(&theme, count)?;
        let job_id = self.backend.submit(&self.image_model, &prompts)?;
        let record = self.ledger.create(&job_id, &theme, prompts)?;
        self.events.emit(
            "batch_submitted",
            json!({
                "job_id": job_id,
                "prompt_count": record.prompts.len(),
            }),
        )?;
        Ok(record)
    }

    /// One user-driven check: query status, and on success retrieve, decode,
    /// materialize, and flip the ledger record. The ledger is only touched
    /// when at least one image lands on disk.
    pub fn check_job(&self, record: &mut JobRecord) -> Result<CheckOutcome> {
        let poll = self.backend.poll(&record.job_id)?;
        let outcome = match poll {
            BatchPoll::Running { state } => CheckOutcome::Running { state },
            BatchPoll::Failed { error } => CheckOutcome::Failed { error },
            BatchPoll::Succeeded { results } => {
                let parsed = parse_result_lines(&results);
                if parsed.images.is_empty() {
                    CheckOutcome::NoImages {
                        discarded: parsed.discarded,
                    }
                } else {
                    let images =
                        materialize_images(&self.out_root, &record.job_id, &parsed.images)?;
                    self.ledger.mark_completed(record, images.len() as u64)?;
                    self.events.emit(
                        "images_materialized",
                        json!({
                            "job_id": record.job_id,
                            "image_count": images.len(),
                            "discarded_lines": parsed.discarded,
                        }),
                    )?;
                    CheckOutcome::Completed {
                        images,
                        discarded: parsed.discarded,
                    }
                }
            }
        };
        self.events.emit(
            "job_checked",
            json!({
                "job_id": record.job_id,
                "state": match &outcome {
                    CheckOutcome::Running { state } => state.clone(),
                    CheckOutcome::Failed { .. } => "JOB_STATE_FAILED".to_string(),
                    CheckOutcome::NoImages { .. } | CheckOutcome::Completed { .. } => {
                        "JOB_STATE_SUCCEEDED".to_string()
                    }
                },
            }),
        )?;
        Ok(outcome)
    }

    pub fn job_image_dir(&self, job_id: &str) -> Result<PathBuf> {
        Ok(self.out_root.join(sanitize_job_id(job_id)?))
    }
}

/// Routes the image model's provider to a backend. Anything that isn't the
/// dryrun provider talks to Gemini, so the credential check happens up front.
pub fn backend_for_model(
    registry: &ModelRegistry,
    image_model: &str,
    out_root: &Path,
) -> Result<Box<dyn BatchBackend>> {
    match registry.provider_for(image_model).as_str() {
        "dryrun" => Ok(Box::new(DryrunBackend::new(out_root))),
        _ => Ok(Box::new(GeminiBatchClient::from_env()?)),
    }
}

/// One request envelope per prompt, newline-delimited, in the batch service's
/// wire format.
pub fn build_request_lines(prompts: &[String]) -> Vec<String> {
    prompts
        .iter()
        .map(|prompt| {
            json!({
                "request": {
                    "contents": [{ "parts": [{ "text": prompt }] }],
                    "generation_config": { "response_modalities": ["IMAGE"] },
                }
            })
            .to_string()
        })
        .collect()
}

fn theme_instruction(hint: Option<&str>) -> String {
    match hint.map(str::trim).filter(|value| !value.is_empty()) {
        Some(hint) => format!(
            "{CREATIVE_DIRECTOR_BRIEF}\n\
             The user has suggested: \"{hint}\".\n\
             Based on this, define a specific, catchy, and commercially viable 'Collection Theme' name and a brief description.\n\
             Output ONLY the Theme Name and Description in one line.\n\
             Example: 'Vintage Beekeeper: A nostalgic collection of honeycomb patterns, vintage bee illustrations, and aged paper textures.'"
        ),
        None => format!(
            "{CREATIVE_DIRECTOR_BRIEF}\n\
             Brainstorm a unique, high-potential, and specific 'Collection Theme' for a new set of background papers.\n\
             It should be distinct from generic themes. Think about niches like 'Steampunk Alice in Wonderland', 'Dark Academia Botany', 'Celestial Navigation', 'Victorian Gothic', 'Cottagecore Herbarium'.\n\
             Output ONLY the Theme Name and Description in one line."
        ),
    }
}

fn prompt_list_instruction(theme: &str, count: usize) -> String {
    format!(
        "Act as an expert AI art prompter.\n\
         Target Audience: Etsy customers looking for \"Junk Journal Background Pages\".\n\
         Collection Theme: \"{theme}\"\n\n\
         Task: Generate {count} HIGHLY DETAILED and UNIQUE image generation prompts for this collection.\n\n\
         Requirements:\n\
         1. **Variety**: Ensure a mix of:\n\
            - Full page patterns (seamless or distressed)\n\
            - Collage-style compositions (ephemera, torn paper, stamps)\n\
            - Focal point artistic illustrations with textured backgrounds\n\
            - Macro textures (aged paper, fabric, lace)\n\
         2. **Aesthetics**: All images must look \"Vintage\", \"Textured\", \"Distressed\", and \"High Quality\".\n\
         3. **Format**: Output ONLY the prompts, one per line. No numbering, no bullet points.\n\
         4. **Content**: Each prompt must be a full, descriptive sentence.\n\n\
         Generate exactly {count} prompts now."
    )
}

fn extract_candidate_text(payload: &Value) -> String {
    let parts = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

fn batch_state(payload: &Value) -> String {
    payload
        .get("metadata")
        .and_then(|metadata| metadata.get("state"))
        .or_else(|| payload.get("state"))
        .and_then(Value::as_str)
        .unwrap_or("JOB_STATE_UNSPECIFIED")
        .to_string()
}

fn result_file_name(payload: &Value) -> Option<String> {
    payload
        .get("dest")
        .and_then(|dest| dest.get("fileName"))
        .or_else(|| {
            payload
                .get("metadata")
                .and_then(|metadata| metadata.get("output"))
                .and_then(|output| output.get("responsesFile"))
        })
        .or_else(|| {
            payload
                .get("response")
                .and_then(|response| response.get("responsesFile"))
        })
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn batch_error_text(payload: &Value) -> String {
    let Some(error) = payload.get("error") else {
        return "unreported batch error".to_string();
    };
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

fn has_raster_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            RASTER_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

fn response_json_or_error(what: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{what} response body read failed"))?;
    if !status.is_success() {
        bail!("{what} request failed ({code}): {}", truncate_text(&body, 512));
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{what} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn short_id(seed: &str, idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

fn dryrun_png(prompt: &str) -> Result<Vec<u8>> {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    let image = RgbImage::from_pixel(64, 64, Rgb([digest[0], digest[1], digest[2]]));
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageFormat::Png)
        .context("dryrun image encode failed")?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use paperbatch_contracts::jobs::JobStatus;
    use serde_json::{json, Value};
    use zip::ZipArchive;

    use super::*;

    struct ScriptedBackend {
        poll: BatchPoll,
    }

    impl BatchBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate_text(&self, _model: &str, instruction: &str) -> Result<String> {
            if instruction.contains("one per line") {
                return Ok("1. scripted page one\n2. scripted page two".to_string());
            }
            Ok("Scripted Theme: fixture output.".to_string())
        }

        fn submit(&self, _model: &str, _prompts: &[String]) -> Result<String> {
            Ok("batches/scripted-1".to_string())
        }

        fn poll(&self, _job_id: &str) -> Result<BatchPoll> {
            Ok(self.poll.clone())
        }
    }

    fn inline_line(bytes: &[u8]) -> String {
        json!({
            "response": {
                "candidates": [{
                    "content": {
                        "parts": [{
                            "inlineData": { "mimeType": "image/png", "data": BASE64.encode(bytes) }
                        }]
                    }
                }]
            }
        })
        .to_string()
    }

    #[test]
    fn request_lines_match_the_batch_wire_format() -> anyhow::Result<()> {
        let prompts = vec!["aged parchment".to_string(), "torn lace".to_string()];
        let lines = build_request_lines(&prompts);
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(&lines[0])?;
        assert_eq!(
            first["request"]["contents"][0]["parts"][0]["text"],
            json!("aged parchment")
        );
        assert_eq!(
            first["request"]["generation_config"]["response_modalities"],
            json!(["IMAGE"])
        );
        Ok(())
    }

    #[test]
    fn parse_tolerates_interleaved_garbage_lines() {
        let stream = [
            inline_line(b"img-a"),
            "not json at all".to_string(),
            inline_line(b"img-b"),
            "{\"response\": \"truncat".to_string(),
            inline_line(b"img-c"),
        ]
        .join("\n");

        let parsed = parse_result_lines(&stream);
        assert_eq!(parsed.images.len(), 3);
        assert_eq!(parsed.discarded, 2);
        assert_eq!(parsed.images[1].bytes, b"img-b");
    }

    #[test]
    fn parse_reads_every_part_of_the_first_candidate_only() {
        let line = json!({
            "response": {
                "candidates": [
                    {
                        "content": {
                            "parts": [
                                { "inlineData": { "data": BASE64.encode(b"one") } },
                                { "text": "interstitial commentary" },
                                { "inline_data": { "data": BASE64.encode(b"two") } },
                            ]
                        }
                    },
                    {
                        "content": {
                            "parts": [{ "inlineData": { "data": BASE64.encode(b"ignored") } }]
                        }
                    }
                ]
            }
        })
        .to_string();

        let parsed = parse_result_lines(&line);
        assert_eq!(parsed.images.len(), 2);
        assert_eq!(parsed.images[0].bytes, b"one");
        assert_eq!(parsed.images[1].bytes, b"two");
        assert_eq!(parsed.discarded, 0);
    }

    #[test]
    fn parse_counts_broken_base64_as_discarded() {
        let line = json!({
            "response": {
                "candidates": [{
                    "content": { "parts": [{ "inlineData": { "data": "%%%not-base64%%%" } }] }
                }]
            }
        })
        .to_string();

        let parsed = parse_result_lines(&line);
        assert!(parsed.images.is_empty());
        assert_eq!(parsed.discarded, 1);
    }

    #[test]
    fn materialized_files_get_contiguous_indices() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let images = vec![
            InlineImage { bytes: b"a".to_vec() },
            InlineImage { bytes: b"b".to_vec() },
            InlineImage { bytes: b"c".to_vec() },
        ];
        let written = materialize_images(temp.path(), "batches/job-7", &images)?;

        assert_eq!(written.len(), 3);
        for (idx, path) in written.iter().enumerate() {
            assert_eq!(
                path.file_name().and_then(|name| name.to_str()),
                Some(format!("img_{idx}.png").as_str())
            );
            assert!(path.starts_with(temp.path().join("job-7")));
            assert!(path.exists());
        }
        Ok(())
    }

    #[test]
    fn cover_dimensions_always_cover_the_canvas() {
        for (width, height) in [
            (2480, 3508),
            (1240, 1754),
            (3000, 1500),
            (1000, 3000),
            (5000, 5000),
            (100, 7000),
        ] {
            let (new_width, new_height) = cover_dimensions(width, height);
            assert!(new_width >= A4_WIDTH, "{width}x{height} under-covers width");
            assert!(new_height >= A4_HEIGHT, "{width}x{height} under-covers height");
            assert!(
                new_width == A4_WIDTH || new_height == A4_HEIGHT,
                "{width}x{height} over-scales both axes"
            );
        }
    }

    #[test]
    fn normalize_yields_exact_a4_for_any_aspect_ratio() {
        for (width, height) in [(1240, 1754), (800, 400), (400, 1200)] {
            let input = DynamicImage::ImageRgb8(RgbImage::from_pixel(
                width,
                height,
                Rgb([200, 180, 140]),
            ));
            let output = normalize_to_a4(&input);
            assert_eq!(output.width(), A4_WIDTH);
            assert_eq!(output.height(), A4_HEIGHT);
        }
    }

    #[test]
    fn zip_flattens_and_keeps_only_raster_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::write(temp.path().join("img_0.png"), b"root png")?;
        fs::write(temp.path().join("notes.txt"), b"skipped")?;
        fs::create_dir_all(temp.path().join("nested"))?;
        fs::write(temp.path().join("nested").join("img_1.jpg"), b"nested jpg")?;

        let cursor = zip_directory(temp.path())?;
        assert_eq!(cursor.position(), 0);

        let mut archive = ZipArchive::new(cursor)?;
        let mut names: Vec<String> = (0..archive.len())
            .map(|idx| archive.by_index(idx).map(|file| file.name().to_string()))
            .collect::<Result<_, _>>()?;
        names.sort();
        assert_eq!(names, vec!["img_0.png".to_string(), "img_1.jpg".to_string()]);
        Ok(())
    }

    #[test]
    fn dryrun_pipeline_runs_end_to_end() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out_root = temp.path().join("collections");
        let engine = BatchEngine::new(
            &out_root,
            Box::new(DryrunBackend::new(&out_root)),
            "dryrun-text-1",
            "dryrun-image-1",
        )?;

        let mut record = engine.start_collection(Some("mushroom fairy"), 6)?;
        assert_eq!(record.prompts.len(), 6);
        assert_eq!(record.status, JobStatus::Submitted);
        assert!(record.job_id.starts_with("batches/dryrun-"));

        let outcome = engine.check_job(&mut record)?;
        let CheckOutcome::Completed { images, discarded } = outcome else {
            panic!("dryrun job should complete on first check");
        };
        assert_eq!(images.len(), 6);
        assert_eq!(discarded, 0);
        for (idx, path) in images.iter().enumerate() {
            assert!(path.exists());
            assert_eq!(
                path.file_name().and_then(|name| name.to_str()),
                Some(format!("img_{idx}.png").as_str())
            );
            image::open(path)?;
        }

        let reloaded = engine
            .ledger()
            .find(&record.job_id)?
            .expect("ledger record exists");
        assert_eq!(reloaded.status, JobStatus::Completed);
        assert_eq!(reloaded.image_count, Some(6));

        let job_dir = engine.job_image_dir(&record.job_id)?;
        let archive = ZipArchive::new(zip_directory(&job_dir)?)?;
        assert_eq!(archive.len(), 6);

        let raw = fs::read_to_string(out_root.join("events.jsonl"))?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        for expected in [
            "run_started",
            "theme_selected",
            "prompts_generated",
            "batch_submitted",
            "images_materialized",
            "job_checked",
        ] {
            assert!(types.contains(&expected.to_string()), "missing {expected}");
        }
        Ok(())
    }

    #[test]
    fn running_state_is_reported_verbatim_without_download() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = BatchEngine::new(
            temp.path(),
            Box::new(ScriptedBackend {
                poll: BatchPoll::Running {
                    state: "JOB_STATE_RUNNING".to_string(),
                },
            }),
            "dryrun-text-1",
            "dryrun-image-1",
        )?;
        let mut record =
            engine
                .ledger()
                .create("batches/scripted-1", "theme", vec!["p".to_string()])?;

        let outcome = engine.check_job(&mut record)?;
        let CheckOutcome::Running { state } = outcome else {
            panic!("expected a running outcome");
        };
        assert_eq!(state, "JOB_STATE_RUNNING");
        assert!(!temp.path().join("scripted-1").exists());

        let reloaded = engine
            .ledger()
            .find("batches/scripted-1")?
            .expect("record exists");
        assert_eq!(reloaded.status, JobStatus::Submitted);
        Ok(())
    }

    #[test]
    fn failed_state_surfaces_the_vendor_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = BatchEngine::new(
            temp.path(),
            Box::new(ScriptedBackend {
                poll: BatchPoll::Failed {
                    error: "quota exhausted".to_string(),
                },
            }),
            "dryrun-text-1",
            "dryrun-image-1",
        )?;
        let mut record =
            engine
                .ledger()
                .create("batches/scripted-1", "theme", vec!["p".to_string()])?;

        let CheckOutcome::Failed { error } = engine.check_job(&mut record)? else {
            panic!("expected a failed outcome");
        };
        assert_eq!(error, "quota exhausted");
        Ok(())
    }

    #[test]
    fn imageless_results_do_not_touch_the_ledger() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = BatchEngine::new(
            temp.path(),
            Box::new(ScriptedBackend {
                poll: BatchPoll::Succeeded {
                    results: "garbage line\n{\"response\": {}}".to_string(),
                },
            }),
            "dryrun-text-1",
            "dryrun-image-1",
        )?;
        let mut record =
            engine
                .ledger()
                .create("batches/scripted-1", "theme", vec!["p".to_string()])?;

        let CheckOutcome::NoImages { discarded } = engine.check_job(&mut record)? else {
            panic!("expected a no-images outcome");
        };
        assert_eq!(discarded, 1);

        let reloaded = engine
            .ledger()
            .find("batches/scripted-1")?
            .expect("record exists");
        assert_eq!(reloaded.status, JobStatus::Submitted);
        assert_eq!(reloaded.image_count, None);
        Ok(())
    }

    #[test]
    fn batch_payload_helpers_read_tolerant_key_chains() {
        let payload = json!({
            "metadata": {
                "state": "JOB_STATE_SUCCEEDED",
                "output": { "responsesFile": "files/meta-output" },
            },
        });
        assert_eq!(batch_state(&payload), "JOB_STATE_SUCCEEDED");
        assert_eq!(
            result_file_name(&payload).as_deref(),
            Some("files/meta-output")
        );

        let payload = json!({
            "state": "JOB_STATE_PENDING",
            "dest": { "fileName": "files/dest-output" },
        });
        assert_eq!(batch_state(&payload), "JOB_STATE_PENDING");
        assert_eq!(
            result_file_name(&payload).as_deref(),
            Some("files/dest-output")
        );

        assert_eq!(batch_state(&json!({})), "JOB_STATE_UNSPECIFIED");
        assert_eq!(result_file_name(&json!({})), None);
    }

    #[test]
    fn batch_error_text_prefers_the_message_field() {
        let payload = json!({ "error": { "message": "model is overloaded", "code": 429 } });
        assert_eq!(batch_error_text(&payload), "model is overloaded");

        let payload = json!({ "error": { "code": 500 } });
        assert_eq!(batch_error_text(&payload), "{\"code\":500}");

        assert_eq!(batch_error_text(&json!({})), "unreported batch error");
    }

    #[test]
    fn dryrun_submit_stashes_the_request_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let backend = DryrunBackend::new(temp.path());
        let prompts = vec!["stash me".to_string()];
        let job_id = backend.submit("dryrun-image-1", &prompts)?;

        let safe_id = sanitize_job_id(&job_id)?;
        let stash = temp.path().join(".dryrun").join(format!("{safe_id}.jsonl"));
        assert!(stash.exists());

        let first: Value = serde_json::from_str(fs::read_to_string(stash)?.lines().next().unwrap())?;
        assert_eq!(
            first["request"]["contents"][0]["parts"][0]["text"],
            json!("stash me")
        );
        Ok(())
    }
}

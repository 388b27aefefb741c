use std::path::{Path, PathBuf};

use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path as AxumPath, Query, State, multipart::Field},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::info;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::SharedState;

/// Subdirectory of the uploads root holding question papers
pub const PYQ_DIR: &str = "pyqs";

lazy_static! {
    static ref UNSAFE_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._-]+").unwrap();
}

/// Metadata for one uploaded previous-year question paper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PyqEntry {
    pub id: String,
    pub course: String,
    pub subject: String,
    /// Free text; empty when the uploader left it out
    #[serde(default)]
    pub semester: String,
    /// Exam year, kept as sent (e.g. `2023` or `2022-23`)
    pub year: String,
    pub paper_title: String,
    /// Whether the paper includes worked answers
    #[serde(default)]
    pub has_answers: bool,
    /// Name on disk, under the PYQ directory
    pub file_name: String,
    /// Name the file had on the uploader's machine, used for downloads
    pub original_name: String,
    /// Path at upload time; informational only, downloads resolve `file_name`
    pub file_path: String,
    pub upload_date: DateTime<Utc>,
    /// Times the file was downloaded
    #[serde(default)]
    pub downloads: u64,
    /// Not rated through the API yet; always 0 for new uploads
    #[serde(default)]
    pub rating: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct PyqFilter {
    pub course: Option<String>,
    pub subject: Option<String>,
    pub semester: Option<String>,
    pub year: Option<String>,
}

impl PyqFilter {
    pub fn matches(&self, entry: &PyqEntry) -> bool {
        fn field_ok(wanted: &Option<String>, actual: &str) -> bool {
            match wanted.as_deref().map(str::trim) {
                None | Some("") => true,
                Some(w) => w.eq_ignore_ascii_case(actual.trim()),
            }
        }

        field_ok(&self.course, &entry.course)
            && field_ok(&self.subject, &entry.subject)
            && field_ok(&self.semester, &entry.semester)
            && field_ok(&self.year, &entry.year)
    }
}

/// Make a client-supplied file name safe to use on disk
///
/// Drops any directory part and replaces runs of unusual characters with `_`.
///
/// # Examples
/// ```
/// use vidyasphere::uploads::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name("../../etc/my notes.pdf"), "my_notes.pdf");
/// assert_eq!(sanitize_file_name(""), "file");
/// ```
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned = UNSAFE_CHARS.replace_all(base, "_");
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `Content-Disposition` value that keeps the original file name
///
/// The quoted `filename` is an ASCII fallback with quotes and backslashes
/// escaped; `filename*` carries the exact name percent-encoded.
///
/// # Examples
/// ```
/// use vidyasphere::uploads::attachment_disposition;
///
/// assert_eq!(
///     attachment_disposition("My Notes.pdf"),
///     "attachment; filename=\"My Notes.pdf\"; filename*=UTF-8''My%20Notes.pdf"
/// );
/// ```
pub fn attachment_disposition(original_name: &str) -> String {
    let base = original_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let base = if base.trim().is_empty() { "file" } else { base };

    let mut fallback = String::with_capacity(base.len());
    for c in base.chars() {
        match c {
            '"' | '\\' => {
                fallback.push('\\');
                fallback.push(c);
            }
            ' '..='~' => fallback.push(c),
            _ => fallback.push('_'),
        }
    }

    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(base)
    )
}

/// True if the upload looks like a PDF by name or declared type
pub fn is_pdf(file_name: &str, content_type: Option<&str>) -> bool {
    content_type == Some("application/pdf") || file_name.to_ascii_lowercase().ends_with(".pdf")
}

fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Extension of `name` including the dot, or empty
fn extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

struct UploadedFile {
    original_name: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

async fn read_file(field: Field<'_>) -> Result<UploadedFile, AppError> {
    let original_name = field.file_name().unwrap_or_default().to_string();
    let content_type = field.content_type().map(str::to_string);
    let bytes = field
        .bytes()
        .await
        .map_err(|e| AppError::bad_request(format!("Failed to read upload: {e}")))?
        .to_vec();
    Ok(UploadedFile {
        original_name,
        content_type,
        bytes,
    })
}

async fn store_file(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf, AppError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| AppError::Internal(format!("failed to create {}: {e}", dir.display())))?;
    let path = dir.join(file_name);
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| AppError::Internal(format!("failed to write {}: {e}", path.display())))?;
    Ok(path)
}

fn upload_failed(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "message": message })),
    )
        .into_response()
}

/// Generic PDF upload (`pdfFile` field)
pub async fn handle_upload_pdf(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("Malformed upload: {e}")))?
    {
        if field.name() == Some("pdfFile") {
            upload = Some(read_file(field).await?);
        }
    }

    let Some(file) = upload.filter(|f| !f.bytes.is_empty()) else {
        return Ok(upload_failed("No file uploaded."));
    };
    if !is_pdf(&file.original_name, file.content_type.as_deref()) {
        return Ok(upload_failed("Only PDF files are allowed."));
    }

    let stored_name = format!("{}-{}", unix_millis(), sanitize_file_name(&file.original_name));
    store_file(&state.config.uploads_dir, &stored_name, &file.bytes).await?;

    let file_url = format!(
        "{}/uploads/{}",
        state.config.public_base_url.trim_end_matches('/'),
        urlencoding::encode(&stored_name)
    );
    info!("File uploaded: {file_url}");

    Ok(Json(json!({
        "success": true,
        "message": "File uploaded successfully!",
        "fileUrl": file_url,
    }))
    .into_response())
}

/// PYQ upload: metadata text fields plus the `pyqFile` PDF
pub async fn handle_upload_pyq(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let mut fields = std::collections::HashMap::new();
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("Malformed upload: {e}")))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if name == "pyqFile" {
            upload = Some(read_file(field).await?);
        } else {
            let text = field
                .text()
                .await
                .map_err(|e| AppError::bad_request(format!("Malformed field {name}: {e}")))?;
            fields.insert(name, text.trim().to_string());
        }
    }

    let Some(file) = upload.filter(|f| !f.bytes.is_empty()) else {
        return Err(AppError::bad_request("No file uploaded."));
    };
    if !is_pdf(&file.original_name, file.content_type.as_deref()) {
        return Err(AppError::bad_request("Only PDF files are allowed."));
    }

    let mut take = |key: &str| fields.remove(key).unwrap_or_default();
    let course = take("course");
    let subject = take("subject");
    let semester = take("semester");
    let year = take("year");
    let paper_title = take("paperTitle");
    let has_answers = take("hasAnswers") == "true";
    if course.is_empty() || subject.is_empty() || paper_title.is_empty() || year.is_empty() {
        return Err(AppError::bad_request(
            "course, subject, year and paperTitle are required",
        ));
    }

    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
    let stored_name = format!(
        "pyqFile-{}-{suffix}{}",
        unix_millis(),
        extension(&file.original_name)
    );
    let dir = state.config.uploads_dir.join(PYQ_DIR);
    let path = store_file(&dir, &stored_name, &file.bytes).await?;

    let entry = PyqEntry {
        id: Uuid::new_v4().simple().to_string(),
        course,
        subject,
        semester,
        year,
        paper_title,
        has_answers,
        file_name: stored_name,
        original_name: file.original_name,
        file_path: path.to_string_lossy().to_string(),
        upload_date: Utc::now(),
        downloads: 0,
        rating: 0.0,
    };

    let saved = entry.clone();
    state.db.write(|db| {
        db.pyqs.push(saved);
        Ok::<_, AppError>(())
    })?;
    info!("PYQ uploaded: {} ({})", entry.paper_title, entry.id);

    Ok(Json(json!({
        "message": "File uploaded successfully!",
        "data": entry,
    })))
}

/// Matching PYQs, newest first
pub async fn handle_list_pyqs(
    State(state): State<SharedState>,
    Query(filter): Query<PyqFilter>,
) -> Result<Json<Vec<PyqEntry>>, AppError> {
    let mut entries: Vec<PyqEntry> = state.db.read(|db| {
        Ok::<_, AppError>(db.pyqs.iter().filter(|p| filter.matches(p)).cloned().collect())
    })?;
    entries.sort_by(|a, b| b.upload_date.cmp(&a.upload_date));
    Ok(Json(entries))
}

/// Send a PYQ file and count the download
pub async fn handle_download_pyq(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, AppError> {
    let entry = state
        .db
        .read(|db| Ok::<_, AppError>(db.pyqs.iter().find(|p| p.id == id).cloned()))?
        .ok_or_else(|| AppError::not_found("PYQ not found"))?;

    // resolve by stored name so a tampered filePath cannot point outside the directory
    let path = state
        .config
        .uploads_dir
        .join(PYQ_DIR)
        .join(sanitize_file_name(&entry.file_name));
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| AppError::not_found("PYQ file missing"))?;

    state.db.write(|db| {
        if let Some(p) = db.pyqs.iter_mut().find(|p| p.id == id) {
            p.downloads += 1;
        }
        Ok::<_, AppError>(())
    })?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/pdf")
        .header(
            header::CONTENT_DISPOSITION,
            attachment_disposition(&entry.original_name),
        )
        .body(Body::from(bytes))
        .map_err(|e| AppError::Internal(format!("failed to build response: {e}")))
}

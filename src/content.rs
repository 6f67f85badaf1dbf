//! Clients for the exercise content service.

use crate::exercise::Exercise;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("content service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where a course's exercises come from.
#[async_trait]
pub trait ExerciseSource: Send + Sync {
    /// The stored catalog for a course. May be empty.
    async fn fetch(&self, course_id: &str) -> Result<Vec<Exercise>, ContentError>;

    /// Ask the service to generate a catalog on demand.
    async fn refresh(&self, course_id: &str) -> Result<Vec<Exercise>, ContentError>;
}

#[derive(Debug, Deserialize, Serialize)]
struct CatalogResponse {
    #[serde(default)]
    exercises: Vec<Exercise>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    course_id: &'a str,
}

/// HTTP client for `GET /exercises/{courseId}` and `POST /exercises/refresh`.
#[derive(Debug, Clone)]
pub struct HttpExerciseSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExerciseSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ContentError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn decode(response: reqwest::Response) -> Result<Vec<Exercise>, ContentError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ContentError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let catalog: CatalogResponse = response.json().await?;
        Ok(catalog.exercises)
    }
}

#[async_trait]
impl ExerciseSource for HttpExerciseSource {
    async fn fetch(&self, course_id: &str) -> Result<Vec<Exercise>, ContentError> {
        let url = format!("{}/exercises/{}", self.base_url, course_id);
        info!(%url, "Fetching exercises");
        let response = self.client.get(&url).send().await?;
        Self::decode(response).await
    }

    async fn refresh(&self, course_id: &str) -> Result<Vec<Exercise>, ContentError> {
        let url = format!("{}/exercises/refresh", self.base_url);
        info!(%url, course_id, "Requesting exercise generation");
        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { course_id })
            .send()
            .await?;
        Self::decode(response).await
    }
}

/// Reads a catalog from a local JSON file shaped like the service response.
/// Useful for offline labs; the course id is ignored.
#[derive(Debug, Clone)]
pub struct FileExerciseSource {
    path: PathBuf,
}

impl FileExerciseSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ExerciseSource for FileExerciseSource {
    async fn fetch(&self, _course_id: &str) -> Result<Vec<Exercise>, ContentError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let catalog: CatalogResponse = serde_json::from_str(&raw)?;
        Ok(catalog.exercises)
    }

    async fn refresh(&self, course_id: &str) -> Result<Vec<Exercise>, ContentError> {
        self.fetch(course_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn file_source_reads_service_shaped_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"exercises": [{{"id": "ls-1", "title": "List files", "difficulty": "beginner",
                "starterCode": "", "solutionCode": "ls", "hints": ["try ls"]}}]}}"#
        )
        .unwrap();

        let source = FileExerciseSource::new(file.path());
        let exercises = source.fetch("linux-101").await.unwrap();
        assert_eq!(exercises.len(), 1);
        assert_eq!(exercises[0].id, "ls-1");
        assert_eq!(exercises[0].solution_code.as_deref(), Some("ls"));
        assert_eq!(exercises[0].hints, vec!["try ls"]);
    }

    #[tokio::test]
    async fn file_source_reports_missing_file() {
        let source = FileExerciseSource::new("/definitely/not/here.json");
        assert!(matches!(source.fetch("c").await, Err(ContentError::Io(_))));
    }

    #[tokio::test]
    async fn http_source_reports_unreachable_service() {
        let source =
            HttpExerciseSource::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(matches!(source.fetch("c").await, Err(ContentError::Http(_))));
    }
}

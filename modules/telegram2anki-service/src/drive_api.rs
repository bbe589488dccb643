//! Google Drive client authenticated with a service account.

use crate::error::ApiError;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;

const SERVICE: &str = "drive";

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

const MULTIPART_BOUNDARY: &str = "telegram2anki_upload_boundary";
const APKG_MIME: &str = "application/octet-stream";

/// The parts of a service-account JSON key the client needs
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_json(json: &str) -> Result<Self, ApiError> {
        serde_json::from_str(json.trim())
            .map_err(|e| ApiError::new(SERVICE, format!("Invalid service account credentials: {}", e)))
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

pub struct DriveClient {
    http: Client,
    base_url: String,
    access_token: String,
    folder_id: Option<String>,
}

impl DriveClient {
    /// Signs a JWT assertion with the service account key and trades it for an
    /// access token.
    pub async fn connect(
        base_url: &str,
        key: &ServiceAccountKey,
        folder_id: Option<String>,
    ) -> Result<Self, ApiError> {
        let http = crate::http::shared_client().clone();
        let assertion = sign_assertion(key, chrono::Utc::now().timestamp())?;

        let response = http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| ApiError::new(SERVICE, format!("Token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            return Err(ApiError::with_status(
                SERVICE,
                format!("Token exchange failed: {}", error),
                status.as_u16(),
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::new(SERVICE, format!("Failed to parse token response: {}", e)))?;

        log::info!("[DRIVE] Authenticated as {}", key.client_email);

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: token.access_token,
            folder_id: folder_id.filter(|f| !f.trim().is_empty()),
        })
    }

    /// Id of a non-trashed file with exactly this name in the target folder.
    pub async fn find_file(&self, name: &str) -> Result<Option<String>, ApiError> {
        let url = format!("{}/drive/v3/files", self.base_url);
        let query = file_query(name, self.folder_id.as_deref());

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id, name)"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await
            .map_err(|e| ApiError::new(SERVICE, format!("Failed to list files: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            return Err(ApiError::with_status(SERVICE, error, status.as_u16()));
        }

        let list: FileList = response
            .json()
            .await
            .map_err(|e| ApiError::new(SERVICE, format!("Failed to parse file list: {}", e)))?;

        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    /// Uploads `path` as `name`, replacing the content of an existing file
    /// with the same name. Returns the Drive file id.
    pub async fn upload_file(&self, path: &Path, name: &str) -> Result<String, ApiError> {
        let content = tokio::fs::read(path).await.map_err(|e| {
            ApiError::new(SERVICE, format!("Failed to read {}: {}", path.display(), e))
        })?;

        match self.find_file(name).await? {
            Some(file_id) => {
                log::info!("[DRIVE] Updating existing file {} ({})", name, file_id);
                self.update_content(&file_id, content).await
            }
            None => {
                log::info!("[DRIVE] Creating {}", name);
                self.create_file(name, content).await
            }
        }
    }

    async fn update_content(&self, file_id: &str, content: Vec<u8>) -> Result<String, ApiError> {
        let url = format!("{}/upload/drive/v3/files/{}", self.base_url, file_id);

        let response = self
            .http
            .patch(&url)
            .bearer_auth(&self.access_token)
            .query(&[("uploadType", "media"), ("fields", "id"), ("supportsAllDrives", "true")])
            .header(reqwest::header::CONTENT_TYPE, APKG_MIME)
            .body(content)
            .send()
            .await
            .map_err(|e| ApiError::new(SERVICE, format!("Upload failed: {}", e)))?;

        parse_file_id(response).await
    }

    async fn create_file(&self, name: &str, content: Vec<u8>) -> Result<String, ApiError> {
        let url = format!("{}/upload/drive/v3/files", self.base_url);
        let body = multipart_body(name, self.folder_id.as_deref(), &content);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .query(&[("uploadType", "multipart"), ("fields", "id"), ("supportsAllDrives", "true")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| ApiError::new(SERVICE, format!("Upload failed: {}", e)))?;

        parse_file_id(response).await
    }
}

async fn parse_file_id(response: reqwest::Response) -> Result<String, ApiError> {
    if !response.status().is_success() {
        let status = response.status();
        let error = response.text().await.unwrap_or_default();
        return Err(ApiError::with_status(SERVICE, error, status.as_u16()));
    }

    let file: DriveFile = response
        .json()
        .await
        .map_err(|e| ApiError::new(SERVICE, format!("Failed to parse upload response: {}", e)))?;
    Ok(file.id)
}

fn sign_assertion(key: &ServiceAccountKey, now: i64) -> Result<String, ApiError> {
    let claims = Claims {
        iss: &key.client_email,
        scope: DRIVE_SCOPE,
        aud: &key.token_uri,
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };

    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| ApiError::new(SERVICE, format!("Invalid service account private key: {}", e)))?;

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
        .map_err(|e| ApiError::new(SERVICE, format!("Failed to sign token assertion: {}", e)))
}

/// Drive query matching `name` exactly, optionally inside `folder_id`.
fn file_query(name: &str, folder_id: Option<&str>) -> String {
    let mut query = format!("name = '{}' and trashed = false", escape_query_value(name));
    if let Some(folder) = folder_id {
        query.push_str(&format!(" and '{}' in parents", escape_query_value(folder)));
    }
    query
}

fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn multipart_body(name: &str, folder_id: Option<&str>, content: &[u8]) -> Vec<u8> {
    let mut metadata = json!({ "name": name });
    if let Some(folder) = folder_id {
        metadata["parents"] = json!([folder]);
    }

    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", APKG_MIME).as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
    body
}

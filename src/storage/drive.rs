//! Production remote store: OAuth2 authorization-code flow plus the Drive
//! v3 file API (create folder, resumable upload, list, delete, download).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::{CredentialStore, RemoteStore, TokenSet, UploadResult};
use crate::core::RemoteFile;
use crate::error::{PipelineError, Result};

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const FILES_ENDPOINT: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_ENDPOINT: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Name of the folder created when no folder id override is configured.
const FOLDER_NAME: &str = "vaultd-backups";

pub struct DriveStore {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    credentials: Arc<dyn CredentialStore>,
    /// Config override; when set, `ensure_folder` never creates anything.
    folder_override: Option<String>,
    /// Folder id resolved once per process.
    cached_folder: tokio::sync::Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Deserialize)]
struct FileResource {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedFile {
    id: String,
    name: String,
    created_time: DateTime<Utc>,
    // Drive serializes sizes as decimal strings.
    size: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    files: Vec<ListedFile>,
    next_page_token: Option<String>,
}

impl DriveStore {
    pub fn new(
        client_id: String,
        client_secret: String,
        redirect_uri: String,
        credentials: Arc<dyn CredentialStore>,
        folder_override: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id,
            client_secret,
            redirect_uri,
            credentials,
            folder_override,
            cached_folder: tokio::sync::Mutex::new(None),
        }
    }

    /// URL the operator visits to grant access (authorization-code flow).
    pub fn auth_url(&self) -> String {
        format!(
            "{AUTH_ENDPOINT}?client_id={}&redirect_uri={}&response_type=code\
             &scope={SCOPE}&access_type=offline&prompt=consent",
            self.client_id, self.redirect_uri
        )
    }

    /// Exchange the authorization code and persist the resulting tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<()> {
        let response = self
            .client
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("code", code),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("redirect_uri", &self.redirect_uri),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .map_err(|e| PipelineError::AuthRequired(format!("token exchange failed: {e}")))?;

        let tokens = Self::parse_token_response(response).await?;
        self.credentials.store(&tokens)?;
        info!("OAuth2 tokens stored");
        Ok(())
    }

    async fn parse_token_response(response: reqwest::Response) -> Result<TokenSet> {
        if !response.status().is_success() {
            return Err(PipelineError::AuthRequired(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::AuthRequired(format!("bad token response: {e}")))?;

        Ok(TokenSet {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in),
        })
    }

    /// Current access token, refreshing via the stored refresh token when
    /// expired. `AuthRequired` when the flow has never been completed.
    async fn access_token(&self) -> Result<String> {
        let tokens = self.credentials.load()?.ok_or_else(|| {
            PipelineError::AuthRequired(
                "no stored credentials; run the auth flow first".to_string(),
            )
        })?;

        if !tokens.is_expired() {
            return Ok(tokens.access_token);
        }

        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
            PipelineError::AuthRequired("token expired and no refresh token stored".to_string())
        })?;

        debug!("Refreshing expired access token");
        let response = self
            .client
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("refresh_token", refresh_token.as_str()),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| PipelineError::AuthRequired(format!("token refresh failed: {e}")))?;

        let mut refreshed = Self::parse_token_response(response).await?;
        // Refresh responses usually omit the refresh token; keep the old one.
        refreshed.refresh_token = refreshed.refresh_token.or(Some(refresh_token));
        self.credentials.store(&refreshed)?;
        Ok(refreshed.access_token)
    }
}

#[async_trait]
impl RemoteStore for DriveStore {
    async fn ensure_folder(&self) -> Result<String> {
        if let Some(id) = &self.folder_override {
            return Ok(id.clone());
        }

        let mut cached = self.cached_folder.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let token = self.access_token().await?;
        let response = self
            .client
            .post(FILES_ENDPOINT)
            .bearer_auth(&token)
            .json(&json!({ "name": FOLDER_NAME, "mimeType": FOLDER_MIME }))
            .send()
            .await
            .map_err(|e| PipelineError::RemoteOpFailed(format!("folder creation failed: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::RemoteOpFailed(format!("folder creation failed: {e}")))?;

        let folder: FileResource = response
            .json()
            .await
            .map_err(|e| PipelineError::RemoteOpFailed(format!("bad folder response: {e}")))?;

        info!(folder_id = %folder.id, "Created remote backup folder");
        *cached = Some(folder.id.clone());
        Ok(folder.id)
    }

    async fn upload(&self, local: &Path, name: &str, folder_id: &str) -> Result<UploadResult> {
        let token = self.access_token().await?;
        let size_bytes = tokio::fs::metadata(local).await?.len();

        // Resumable upload: metadata first, then the file streamed to the
        // session URI so the whole artifact is never held in memory.
        let session = self
            .client
            .post(format!("{UPLOAD_ENDPOINT}?uploadType=resumable"))
            .bearer_auth(&token)
            .json(&json!({ "name": name, "parents": [folder_id] }))
            .send()
            .await
            .map_err(|e| PipelineError::UploadFailed(format!("upload session failed: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::UploadFailed(format!("upload session failed: {e}")))?;

        let session_uri = session
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                PipelineError::UploadFailed("upload session returned no location".to_string())
            })?
            .to_string();

        let file = tokio::fs::File::open(local).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .client
            .put(&session_uri)
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_LENGTH, size_bytes)
            .body(body)
            .send()
            .await
            .map_err(|e| PipelineError::UploadFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| PipelineError::UploadFailed(e.to_string()))?;

        let uploaded: FileResource = response
            .json()
            .await
            .map_err(|e| PipelineError::UploadFailed(format!("bad upload response: {e}")))?;

        info!(file_id = %uploaded.id, size_bytes, name, "Artifact uploaded");
        Ok(UploadResult {
            id: uploaded.id,
            size_bytes,
        })
    }

    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteFile>> {
        let token = self.access_token().await?;
        let query = format!("'{folder_id}' in parents and trashed = false");

        // Folders can outgrow a single page; retention must see every file.
        paged(|page_token| {
            let client = self.client.clone();
            let token = token.clone();
            let query = query.clone();
            async move {
                let mut params = vec![
                    ("q", query),
                    ("orderBy", "createdTime desc".to_string()),
                    ("fields", "nextPageToken,files(id,name,createdTime,size)".to_string()),
                    ("pageSize", "1000".to_string()),
                ];
                if let Some(t) = page_token {
                    params.push(("pageToken", t));
                }

                let response = client
                    .get(FILES_ENDPOINT)
                    .bearer_auth(&token)
                    .query(&params)
                    .send()
                    .await
                    .map_err(|e| PipelineError::DownloadFailed(format!("list failed: {e}")))?
                    .error_for_status()
                    .map_err(|e| PipelineError::DownloadFailed(format!("list failed: {e}")))?;

                let listed: ListResponse = response
                    .json()
                    .await
                    .map_err(|e| PipelineError::DownloadFailed(format!("bad list response: {e}")))?;

                let files = listed
                    .files
                    .into_iter()
                    .map(|f| RemoteFile {
                        id: f.id,
                        name: f.name,
                        created_time: f.created_time,
                        size_bytes: f.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                    })
                    .collect();
                Ok((files, listed.next_page_token))
            }
        })
        .await
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        let token = self.access_token().await?;
        self.client
            .delete(format!("{FILES_ENDPOINT}/{file_id}"))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| PipelineError::RemoteOpFailed(format!("delete failed: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::RemoteOpFailed(format!("delete failed: {e}")))?;

        debug!(file_id, "Remote artifact deleted");
        Ok(())
    }

    async fn download(&self, file_id: &str, dest: &Path) -> Result<()> {
        let token = self.access_token().await?;
        let mut response = self
            .client
            .get(format!("{FILES_ENDPOINT}/{file_id}"))
            .bearer_auth(&token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| PipelineError::DownloadFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| PipelineError::DownloadFailed(e.to_string()))?;

        let mut out = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| PipelineError::DownloadFailed(e.to_string()))?
        {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;

        info!(file_id, dest = %dest.display(), "Artifact downloaded");
        Ok(())
    }
}

/// Drain a paginated listing by following continuation tokens until the
/// final page arrives without one.
async fn paged<F, Fut>(mut fetch: F) -> Result<Vec<RemoteFile>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<RemoteFile>, Option<String>)>>,
{
    let mut all = Vec::new();
    let mut page_token = None;
    loop {
        let (mut files, next) = fetch(page_token.take()).await?;
        all.append(&mut files);
        match next {
            Some(token) => page_token = Some(token),
            None => return Ok(all),
        }
    }
}

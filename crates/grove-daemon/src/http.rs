//! HTTP client for grove servers, built on reqwest.

use async_trait::async_trait;
use grove_core::remote::{
    self, GroveApi, ModuleInfo, ModuleList, RemoteError, Upload, API_KEY_HEADER, MODULES_PATH,
    UPLOAD_PATH,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use tracing::debug;

/// `GroveApi` over HTTP.
#[derive(Clone)]
pub struct HttpGroveApi {
    client: Client,
}

impl HttpGroveApi {
    pub fn new() -> remote::Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    fn url(origin: &str, path: &str) -> String {
        format!("{}{}", origin.trim_end_matches('/'), path)
    }

    /// Turn non-2xx responses into `RemoteError::Status` carrying the body.
    async fn check(response: Response) -> remote::Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn transport(e: reqwest::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

#[async_trait]
impl GroveApi for HttpGroveApi {
    async fn fetch_file(&self, origin: &str, remote_path: &str, api_key: &str) -> remote::Result<String> {
        let url = Self::url(origin, remote_path);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await
            .map_err(transport)?;
        Self::check(response)
            .await?
            .text()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn list_modules(&self, origin: &str, api_key: &str) -> remote::Result<Vec<ModuleInfo>> {
        let url = Self::url(origin, MODULES_PATH);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await
            .map_err(transport)?;
        let list: ModuleList = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(list.content)
    }

    async fn upload_file(&self, origin: &str, api_key: &str, upload: Upload) -> remote::Result<()> {
        let url = Self::url(origin, UPLOAD_PATH);
        debug!("POST {} ({} bytes)", url, upload.data.len());

        let part = Part::bytes(upload.data).file_name(upload.file_name.clone());
        let form = Form::new()
            .text("fileName", upload.file_name)
            .text("projectId", upload.project_id)
            .part("data", part);

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, api_key)
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await.map(|_| ())
    }
}

//! Fetching module and symbol files

use std::time::Duration;

use async_trait::async_trait;

use crate::common::config::StoreConfig;
use crate::common::{Error, Result};

use super::assembly::AssemblyInfo;
use super::reader::read_assembly;

/// A module to load, with its side-car symbol file if one was listed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRequest {
    pub url: String,
    pub symbols_url: Option<String>,
}

/// Produces indexed assemblies from module urls
#[async_trait]
pub trait AssemblyLoader: Send + Sync + 'static {
    async fn load(&self, request: &ModuleRequest) -> Result<AssemblyInfo>;

    /// Fetch a source document over HTTP (Source Link)
    async fn fetch_source(&self, url: &str) -> Result<String> {
        Err(Error::Fetch {
            url: url.to_string(),
            error: "source download not supported".to_string(),
        })
    }
}

/// Loads modules over HTTP, or from disk for `file://` urls and plain paths
pub struct HttpLoader {
    client: reqwest::Client,
    embedded_symbols: bool,
}

impl HttpLoader {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("browser-debug-proxy/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            embedded_symbols: config.embedded_symbols,
        })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let fetch_error = |error: String| Error::Fetch {
            url: url.to_string(),
            error,
        };

        if let Some(path) = local_path(url) {
            return tokio::fs::read(&path)
                .await
                .map_err(|e| fetch_error(e.to_string()));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fetch_error(format!("status {}", response.status())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Path of a url that names a local file
fn local_path(url: &str) -> Option<std::path::PathBuf> {
    match url::Url::parse(url) {
        Ok(u) if u.scheme() == "file" => u.to_file_path().ok(),
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => None,
        // Single letter schemes are drive letters
        Ok(u) if u.scheme().len() > 1 => None,
        _ => Some(url.into()),
    }
}

#[async_trait]
impl AssemblyLoader for HttpLoader {
    #[tracing::instrument(skip(self), fields(url = %request.url))]
    async fn load(&self, request: &ModuleRequest) -> Result<AssemblyInfo> {
        let (module, symbols) = match &request.symbols_url {
            Some(symbols_url) => {
                let (module, symbols) = tokio::join!(self.fetch(&request.url), self.fetch(symbols_url));
                (module?, Some(symbols?))
            }
            None => (self.fetch(&request.url).await?, None),
        };
        tracing::debug!(
            module_bytes = module.len(),
            symbol_bytes = symbols.as_ref().map(Vec::len),
            "fetched module"
        );

        let url = request.url.clone();
        let embedded = self.embedded_symbols;
        tokio::task::spawn_blocking(move || {
            read_assembly(&url, &module, symbols.as_deref(), embedded)
        })
        .await
        .map_err(|e| Error::TaskFailed(e.to_string()))?
    }

    async fn fetch_source(&self, url: &str) -> Result<String> {
        let bytes = self.fetch(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_local_path_detection() {
        assert_eq!(local_path("http://localhost/app.dll"), None);
        assert_eq!(
            local_path("file:///tmp/app.dll"),
            Some(std::path::PathBuf::from("/tmp/app.dll"))
        );
        assert_eq!(
            local_path("bin/app.dll"),
            Some(std::path::PathBuf::from("bin/app.dll"))
        );
    }

    #[tokio::test]
    async fn test_fetch_local_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();

        let loader = HttpLoader::new(&StoreConfig::default()).unwrap();
        let path = file.path().to_string_lossy().into_owned();
        assert_eq!(loader.fetch(&path).await.unwrap(), b"hello");
        assert_eq!(loader.fetch_source(&path).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_missing_file_is_fetch_error() {
        let loader = HttpLoader::new(&StoreConfig::default()).unwrap();
        let err = loader.fetch("/nonexistent/app.dll").await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
    }
}

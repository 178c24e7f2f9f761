//! Replay fixtures: scripted server exchanges loaded from JSON.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use reqwest::Method;
use serde::Deserialize;
use url::Url;

use segfetch::{
    DownloadOptions, DownloadResponse, Engine, GroupStatus, RequestGroup, ScriptedConnection,
    ScriptedConnector,
};

/// A replay fixture: downloads to start and the connections serving them.
#[derive(Debug, Clone, Deserialize)]
pub struct Fixture {
    pub downloads: Vec<FixtureDownload>,
    #[serde(default)]
    pub connections: Vec<FixtureConnection>,
}

/// One download with its candidate URIs.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureDownload {
    pub uris: Vec<String>,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A scripted connection, handed out in file order per `host:port`.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureConnection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub steps: Vec<FixtureStep>,
}

fn default_port() -> u16 {
    80
}

/// What the peer does next.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixtureStep {
    /// Nothing arrives for `polls` reads.
    Pending { polls: usize },
    /// A response header block for `url`.
    Response {
        status: u16,
        url: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    /// Raw body bytes.
    Body { data: String },
}

impl Fixture {
    /// Reads and parses a fixture file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture '{}'", path.display()))?;
        let fixture: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse fixture '{}'", path.display()))?;
        if fixture.downloads.is_empty() {
            bail!("Fixture '{}' declares no downloads", path.display());
        }
        Ok(fixture)
    }

    /// Builds an engine serving the scripted connections, with every
    /// download added and waiting.
    pub fn into_engine(self, options: DownloadOptions) -> Result<Engine> {
        let mut connector = ScriptedConnector::new();
        for connection in self.connections {
            connector.add(connection.build()?);
        }

        let options = Arc::new(options);
        let mut engine = Engine::new(Box::new(connector));
        for download in self.downloads {
            let uris = download
                .uris
                .iter()
                .map(|uri| Url::parse(uri).with_context(|| format!("Invalid URI '{uri}'")))
                .collect::<Result<Vec<_>>>()?;
            let method = download
                .method
                .parse::<Method>()
                .with_context(|| format!("Invalid method '{}'", download.method))?;
            let id = engine.allocate_group_id();
            engine.add_group(RequestGroup::new(id, uris, Arc::clone(&options)).with_method(method));
        }
        Ok(engine)
    }
}

impl FixtureConnection {
    fn build(self) -> Result<ScriptedConnection> {
        let mut connection = ScriptedConnection::new(self.host, self.port);
        for step in self.steps {
            connection = match step {
                FixtureStep::Pending { polls } => connection.pending(polls),
                FixtureStep::Response {
                    status,
                    url,
                    headers,
                } => {
                    let url = Url::parse(&url).with_context(|| format!("Invalid URI '{url}'"))?;
                    let response = DownloadResponse::from_parts(
                        status,
                        headers.iter().map(|(name, value)| (name.as_str(), value.as_str())),
                        url,
                    )?;
                    connection.response(response)
                }
                FixtureStep::Body { data } => connection.body(data.into_bytes()),
            };
        }
        Ok(connection)
    }
}

/// Renders one summary line per download.
#[must_use]
pub fn summary(engine: &Engine) -> Vec<String> {
    engine
        .groups()
        .map(|group| {
            let target = group
                .file_path()
                .map_or_else(|| "-".to_string(), |path| path.display().to_string());
            match group.status() {
                GroupStatus::Complete => format!(
                    "{}: complete {} ({} bytes)",
                    group.id(),
                    target,
                    group.completed_length()
                ),
                GroupStatus::Failed { failure, message } => {
                    format!("{}: failed ({failure:?}) {message}", group.id())
                }
                other => format!("{}: {other:?}", group.id()),
            }
        })
        .collect()
}

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use reframe::config::ProxyConfig;
use reframe::geometry::ResizeRequest;
use reframe::hooks::{Hooks, Source, SourceBody};
use reframe::pipeline::Proxy;
use reframe::server;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "reframe")]
#[command(about = "HTTP image-resizing proxy")]
#[command(long_about = "\
HTTP image-resizing proxy

Serves derived images from a directory of originals. The request path names
the source image and the target size:

  GET /photos/dog/200x300.jpg   →  <root>/photos/dog.jpg, resized to 200x300
  GET /photos/dog/640x.jpg      →  same source, width 640, height from aspect
  GET /photos/dog.jpg           →  the original, re-encoded (metadata stripped)

Targets larger than the source are refused (404) — no upscaling. Rendered
responses are cached in memory and concurrent requests for the same path are
coalesced into a single render.")]
struct Args {
    /// Directory holding the source images
    #[arg(long, default_value = "content")]
    root: PathBuf,
    /// Port to listen on
    #[arg(long, default_value_t = 9090)]
    port: u16,
    /// s-maxage seconds advertised to shared caches
    #[arg(long, default_value_t = 2_628_000)]
    server_cache_duration: u64,
    /// max-age seconds advertised to clients
    #[arg(long, default_value_t = 3_600)]
    client_cache_duration: u64,
    /// Disable the in-memory response cache (and with it, request coalescing)
    #[arg(long)]
    no_memory_cache: bool,
    /// Seconds a cached render is reused before expiring
    #[arg(long, default_value_t = 30)]
    memory_cache_ttl: u64,
}

/// Source hook reading originals from a local directory.
///
/// The request's folder names the image and the extension picks the file:
/// `/photos/dog/200x300.jpg` reads `<root>/photos/dog.jpg`. Original
/// requests (`/photos/dog.jpg`) read the named file directly.
struct FsSource {
    root: PathBuf,
}

impl FsSource {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn source_path(&self, request: &ResizeRequest) -> Option<PathBuf> {
        let folder = request.folder.trim_matches('/');
        if request.is_original {
            return Some(self.root.join(folder).join(&request.filename));
        }
        if folder.is_empty() {
            // A sized request at the root has no image name to resolve.
            return None;
        }
        let mut path = self.root.join(folder);
        path.set_extension(request.extension.trim_start_matches('.'));
        Some(path)
    }
}

#[async_trait]
impl Source for FsSource {
    async fn fetch(
        &self,
        request: &ResizeRequest,
    ) -> anyhow::Result<Option<(SourceBody, SystemTime)>> {
        let Some(path) = self.source_path(request) else {
            return Ok(None);
        };
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Ok(None);
        }
        let modified = metadata
            .modified()
            .with_context(|| format!("mtime of {}", path.display()))?;
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Some((SourceBody::Buffer(bytes.into()), modified)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reframe=info")),
        )
        .init();

    let args = Args::parse();
    let config = ProxyConfig {
        server_cache_duration: args.server_cache_duration,
        client_cache_duration: args.client_cache_duration,
        memory_cache: !args.no_memory_cache,
        memory_cache_ttl: Duration::from_secs(args.memory_cache_ttl),
        ..ProxyConfig::default()
    };

    let source = Arc::new(FsSource::new(args.root.clone()));
    let proxy = Arc::new(Proxy::new(config, Hooks::new(source)));
    let app = server::router(proxy);

    let addr = format!("0.0.0.0:{}", args.port);
    info!(
        "listening on http://{} serving images from {}",
        addr,
        args.root.display()
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

use crate::models::chunk::DEFAULT_CHUNK_SIZE;
use crate::services::upload_service::DEFAULT_MAX_TOTAL_SIZE;
use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use reqwest::Url;
use std::{env, fmt::Display, path::PathBuf, str::FromStr};

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked upload server and client")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the upload server
    Serve(ServeArgs),
    /// Queue files and upload them; with no files, resume queued uploads
    Push(PushArgs),
    /// Print queued uploads and their progress as JSON
    Status(CacheArgs),
    /// Forget every queued upload
    Cancel(CacheArgs),
}

#[derive(ClapArgs, Debug)]
pub struct ServeArgs {
    /// Host to bind to (overrides UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding one sub-directory per token (overrides UPLOAD_DIR)
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Largest accepted upload in bytes (overrides UPLOAD_MAX_TOTAL_SIZE)
    #[arg(long)]
    pub max_total_size: Option<u64>,

    /// Largest accepted chunk body in bytes (overrides UPLOAD_MAX_CHUNK_SIZE)
    #[arg(long)]
    pub max_chunk_size: Option<usize>,
}

#[derive(ClapArgs, Debug)]
pub struct CacheArgs {
    /// Client chunk cache database (overrides UPLOAD_CACHE_DB)
    #[arg(long)]
    pub cache_db: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
pub struct PushArgs {
    /// Files to upload
    pub files: Vec<PathBuf>,

    /// Upload endpoint (overrides UPLOAD_SERVER_URL)
    #[arg(long)]
    pub server_url: Option<String>,

    #[command(flatten)]
    pub cache: CacheArgs,

    /// Chunk size in bytes (overrides UPLOAD_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Upload token; the server directory for it must already exist.
    /// Generated when omitted. Only valid with a single file.
    #[arg(long)]
    pub token: Option<String>,

    /// Destination path hint sent with every chunk
    #[arg(long, default_value = "")]
    pub path: String,

    /// MIME type sent with every chunk
    #[arg(long, default_value = "application/octet-stream")]
    pub filetype: String,
}

/// Server configuration after merging flags and environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub max_total_size: u64,
    pub max_chunk_size: usize,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client configuration after merging flags and environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: Url,
    pub cache_db: PathBuf,
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct PushJob {
    pub client: ClientConfig,
    pub files: Vec<PathBuf>,
    pub token: Option<String>,
    pub path: String,
    pub filetype: String,
}

/// A fully resolved invocation.
#[derive(Debug, Clone)]
pub enum AppCommand {
    Serve(ServerConfig),
    Push(PushJob),
    Status { cache_db: PathBuf },
    Cancel { cache_db: PathBuf },
}

impl AppCommand {
    /// Parse CLI arguments and merge them with environment fallbacks.
    pub fn from_env_and_args() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self> {
        match args.command {
            Command::Serve(serve) => {
                let max_chunk_size = match serve.max_chunk_size {
                    Some(size) => size,
                    None => env_or("UPLOAD_MAX_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
                };
                if max_chunk_size == 0 {
                    bail!("max chunk size must be greater than zero");
                }
                Ok(Self::Serve(ServerConfig {
                    host: match serve.host {
                        Some(host) => host,
                        None => env::var("UPLOAD_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
                    },
                    port: match serve.port {
                        Some(port) => port,
                        None => env_or("UPLOAD_PORT", 3000)?,
                    },
                    upload_dir: match serve.upload_dir {
                        Some(dir) => dir,
                        None => env_path("UPLOAD_DIR", "./data/uploads"),
                    },
                    max_total_size: match serve.max_total_size {
                        Some(size) => size,
                        None => env_or("UPLOAD_MAX_TOTAL_SIZE", DEFAULT_MAX_TOTAL_SIZE)?,
                    },
                    max_chunk_size,
                }))
            }
            Command::Push(push) => {
                if push.token.is_some() && push.files.len() != 1 {
                    bail!("--token can only be used with exactly one file");
                }
                let raw_url = match push.server_url {
                    Some(url) => url,
                    None => env::var("UPLOAD_SERVER_URL")
                        .unwrap_or_else(|_| "http://127.0.0.1:3000/upload".into()),
                };
                let server_url = Url::parse(&raw_url)
                    .with_context(|| format!("parsing server URL `{}`", raw_url))?;
                let chunk_size = match push.chunk_size {
                    Some(size) => size,
                    None => env_or("UPLOAD_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
                };
                if chunk_size == 0 {
                    bail!("chunk size must be greater than zero");
                }
                Ok(Self::Push(PushJob {
                    client: ClientConfig {
                        server_url,
                        cache_db: cache_db(push.cache),
                        chunk_size,
                    },
                    files: push.files,
                    token: push.token,
                    path: push.path,
                    filetype: push.filetype,
                }))
            }
            Command::Status(cache) => Ok(Self::Status {
                cache_db: cache_db(cache),
            }),
            Command::Cancel(cache) => Ok(Self::Cancel {
                cache_db: cache_db(cache),
            }),
        }
    }
}

fn cache_db(args: CacheArgs) -> PathBuf {
    args.cache_db
        .unwrap_or_else(|| env_path("UPLOAD_CACHE_DB", "./data/client/chunks.db"))
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var_os(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

/// Parse `key` from the environment, `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

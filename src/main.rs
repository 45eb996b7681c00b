use anyhow::{Context, Result, anyhow};
use bytesize::ByteSize;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueHint};
use iocraft::prelude::*;
use s3bug::{
    CompletedUpload, MemoryStore, MultipartUploader, ObjectStore, S3Store, S3StoreConfig,
    UploadTarget,
    config::{self, Config},
    payload,
    provision::{DockerProvisioner, with_environment},
};
use std::{
    io::Cursor,
    path::{Path, PathBuf},
    process::ExitCode,
};
use tokio::{io::AsyncRead, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::ui::{ConfigRows, ErrorMessage, ProgressBar, SuccessMessage, UploadSummary};

mod ui;

type Source = Box<dyn AsyncRead + Unpin + Send>;

#[derive(Parser)]
#[command(name = "s3bug")]
#[command(version)]
#[command(about = "Reproduce multipart uploads against an ephemeral S3 emulator")]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct UploadArgs {
    /// Bucket to upload into (created if missing)
    #[arg(short, long)]
    bucket: Option<String>,
    /// Object key
    #[arg(short, long)]
    key: Option<String>,
    /// Content type sent on initiation; pass "" to send none
    #[arg(long)]
    content_type: Option<String>,
    /// Size of each part, e.g. "10 MiB"
    #[arg(long)]
    chunk_size: Option<ByteSize>,
    /// Upload into an in-process store instead of a real endpoint
    #[arg(long)]
    in_memory: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the storage emulator, upload the payload, report the outcome
    Run {
        /// Emulator image to start
        #[arg(long)]
        image: Option<String>,
        /// Use this store instead of starting an emulator
        #[arg(long)]
        endpoint: Option<Url>,
        /// Upload this file instead of the generated payload
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        file: Option<PathBuf>,
        /// Size of the generated payload, e.g. "25 MiB"
        #[arg(long)]
        size: Option<ByteSize>,
        #[command(flatten)]
        upload: UploadArgs,
    },
    /// Upload a file to an existing store
    Upload {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        /// Store endpoint, e.g. http://localhost:4566
        #[arg(long)]
        endpoint: Option<Url>,
        #[command(flatten)]
        upload: UploadArgs,
    },
    /// Write the generated payload to a file
    Generate {
        #[arg(value_hint = ValueHint::FilePath)]
        output: PathBuf,
        /// Payload size, e.g. "25 MiB"
        #[arg(long)]
        size: Option<ByteSize>,
    },
    /// Show the effective configuration
    Config,
}

fn main() -> Result<ExitCode> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let _rt_guard = rt.enter();
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    rt.block_on(run_cli(cli))
}

async fn run_cli(cli: Cli) -> Result<ExitCode> {
    let mut config = config::read_config()?;

    match cli.command {
        Commands::Config => {
            show_config(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Generate { output, size } => {
            generate(&output, size.unwrap_or(config.payload_size)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            image,
            endpoint,
            file,
            size,
            upload,
        } => {
            apply_upload_args(&mut config, &upload);
            if let Some(image) = image {
                config.image = image;
            }
            if let Some(size) = size {
                config.payload_size = size;
            }
            config.endpoint = endpoint.or(config.endpoint);
            run(&config, file.as_deref(), upload.in_memory).await
        }
        Commands::Upload {
            file,
            endpoint,
            upload,
        } => {
            apply_upload_args(&mut config, &upload);
            config.endpoint = endpoint.or(config.endpoint);
            if config.endpoint.is_none() && !upload.in_memory {
                return Err(anyhow!(
                    "An endpoint must be given via --endpoint or configured; use `s3bug run` to start an emulator"
                ));
            }
            run(&config, Some(&file), upload.in_memory).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "s3bug=debug,info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_upload_args(config: &mut Config, args: &UploadArgs) {
    if let Some(bucket) = &args.bucket {
        config.bucket = bucket.clone();
    }
    if let Some(key) = &args.key {
        config.key = key.clone();
    }
    if let Some(content_type) = &args.content_type {
        config.content_type = Some(content_type.clone()).filter(|c| !c.trim().is_empty());
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling upload");
            cancel.cancel();
        }
    });
}

async fn open_source(file: Option<&Path>, payload_size: ByteSize) -> Result<(Source, u64)> {
    match file {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let len = file
                .metadata()
                .await
                .context("Failed to get file metadata")?
                .len();
            Ok((Box::new(file), len))
        }
        None => {
            let size = usize::try_from(payload_size.as_u64()).context("Payload size too large")?;
            let payload = payload::generate(size).context("Failed to generate payload")?;
            let len = payload.len() as u64;
            Ok((Box::new(Cursor::new(payload)), len))
        }
    }
}

fn s3_store(config: &Config, endpoint: Url) -> S3Store {
    S3Store::new(S3StoreConfig {
        endpoint,
        region: config.region.clone(),
        access_key_id: config.access_key_id.clone(),
        secret_access_key: config.secret_access_key.clone(),
        force_path_style: true,
    })
}

async fn run(config: &Config, file: Option<&Path>, in_memory: bool) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let (source, total_bytes) = open_source(file, config.payload_size).await?;

    let outcome = if in_memory {
        upload_to(MemoryStore::new(), config, source, total_bytes, &cancel).await
    } else if let Some(endpoint) = config.endpoint.clone() {
        upload_to(s3_store(config, endpoint), config, source, total_bytes, &cancel).await
    } else {
        let provisioner = DockerProvisioner::new(&config.image)
            .with_service_port(config.service_port)
            .with_startup_timeout(config.startup_timeout)
            .with_cancellation(cancel.clone());

        println!("Starting {} ...", provisioner.image());
        with_environment(&provisioner, config.service_port, |endpoint| {
            println!("Storage emulator listening on {}", endpoint);
            upload_to(s3_store(config, endpoint), config, source, total_bytes, &cancel)
        })
        .await
    };

    Ok(report(outcome))
}

async fn upload_to<S: ObjectStore>(
    store: S,
    config: &Config,
    source: Source,
    total_bytes: u64,
    cancel: &CancellationToken,
) -> Result<CompletedUpload> {
    let chunk_size =
        usize::try_from(config.chunk_size.as_u64()).context("Chunk size too large")?;
    let uploader = MultipartUploader::new(store).with_chunk_size(chunk_size);

    let mut target = UploadTarget::new(&config.bucket, &config.key);
    target.content_type = config.content_type.clone();

    let (tx, rx) = watch::channel(0.0f32);
    let upload = uploader.upload_with_progress(&target, source, Some(cancel), move |progress| {
        let percent = if total_bytes == 0 {
            100.0
        } else {
            (progress.bytes_uploaded as f32 / total_bytes as f32) * 100.0
        };
        let _ = tx.send(percent);
    });
    tokio::pin!(upload);

    let mut progress_bar = element!(ProgressBar(
        title: format!("Uploading s3://{}/{} ({})", target.bucket, target.key, ByteSize::b(total_bytes)),
        progress: Some(rx)
    ));

    let result = tokio::select! {
        result = &mut upload => result,
        _ = progress_bar.render_loop() => upload.await,
    };

    Ok(result?)
}

fn report(outcome: Result<CompletedUpload>) -> ExitCode {
    match outcome {
        Ok(upload) => {
            element!(UploadSummary(
                location: format!("s3://{}/{}", upload.bucket, upload.key),
                upload_id: upload.upload_id,
                e_tag: upload.e_tag,
                bytes: upload.bytes_uploaded,
                parts: upload
                    .parts
                    .into_iter()
                    .map(|part| (part.part_number, part.e_tag))
                    .collect::<Vec<_>>(),
            ))
            .print();
            element!(SuccessMessage(message: "Success!".to_string())).print();
            ExitCode::SUCCESS
        }
        Err(err) => {
            let causes = err.chain().skip(1).map(|cause| cause.to_string()).collect::<Vec<_>>();
            element!(ErrorMessage(message: format!("Failed :-( {}", err), causes: causes)).print();
            ExitCode::FAILURE
        }
    }
}

async fn generate(output: &Path, size: ByteSize) -> Result<()> {
    let size = usize::try_from(size.as_u64()).context("Payload size too large")?;
    let payload = payload::generate(size).context("Failed to generate payload")?;
    tokio::fs::write(output, &payload)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    element!(SuccessMessage(message: format!(
        "Wrote {} ({} bytes) to {}",
        ByteSize::b(payload.len() as u64),
        payload.len(),
        output.display()
    )))
    .print();
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    let path = config::config_path()?;
    let rows = vec![
        ("config file".to_string(), path.display().to_string()),
        ("image".to_string(), config.image.clone()),
        ("service_port".to_string(), config.service_port.to_string()),
        (
            "endpoint".to_string(),
            config
                .endpoint
                .as_ref()
                .map(Url::to_string)
                .unwrap_or_else(|| "<start emulator>".to_string()),
        ),
        ("region".to_string(), config.region.clone()),
        ("bucket".to_string(), config.bucket.clone()),
        ("key".to_string(), config.key.clone()),
        (
            "content_type".to_string(),
            config
                .content_type
                .clone()
                .unwrap_or_else(|| "<none>".to_string()),
        ),
        ("chunk_size".to_string(), config.chunk_size.to_string()),
        ("payload_size".to_string(), config.payload_size.to_string()),
        (
            "startup_timeout".to_string(),
            humantime::format_duration(config.startup_timeout).to_string(),
        ),
    ];

    element!(ConfigRows(title: "s3bug configuration".to_string(), rows: rows)).print();
    Ok(())
}

//! Command handlers for the ossxfer CLI

use crate::TransferArgs;
use anyhow::{Context, Result};
use clap::Command;
use clap_complete::{generate, Shell as ClapShell};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use ossxfer_core::{
    get_config_path, load_config_from, validate_config, ByteRange, ConfigFile, Copier,
    CopyRequest, DownloadRequest, Downloader, ObjectClient, ProgressCallback, S3Client,
    TransferOptions, UploadRequest, Uploader,
};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Load the configuration from `path`, or from the default location
pub fn load(path: Option<&Path>) -> ossxfer_core::Result<ConfigFile> {
    match path {
        Some(path) => load_config_from(path),
        None => load_config_from(&get_config_path()?),
    }
}

/// Splits `bucket/key`.
fn parse_location(location: &str) -> Result<(String, String)> {
    let location = location.strip_prefix("oss://").unwrap_or(location);
    match location.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(anyhow::anyhow!(
            "Expected <bucket>/<key>, got {:?}",
            location
        )),
    }
}

/// Config-file settings with command-line overrides on top
fn transfer_options(config: &ConfigFile, args: &TransferArgs, for_copy: bool) -> TransferOptions {
    let mut options = if for_copy {
        TransferOptions::for_copy()
    } else {
        TransferOptions::default()
    };
    if let Some(transfer) = &config.transfer {
        transfer.apply_to(&mut options, for_copy);
    }

    if let Some(part_size) = args.part_size {
        options.part_size = part_size;
    }
    if let Some(parallel) = args.parallel {
        options.parallel_num = parallel;
    }
    if args.checkpoint || args.checkpoint_dir.is_some() {
        options.enable_checkpoint = true;
    }
    if let Some(dir) = &args.checkpoint_dir {
        options.checkpoint_dir = Some(dir.clone());
    }
    if args.leave_parts {
        options.leave_parts_on_error = true;
    }
    if args.verify_data {
        options.verify_data = true;
    }
    options
}

fn connect(config: &ConfigFile) -> Result<Arc<dyn ObjectClient>> {
    validate_config(config)?;
    debug!("Connecting to {}", config.endpoint.url);
    Ok(Arc::new(S3Client::from_config(config)?))
}

/// Progress bar fed by the transfer's callback; hidden with `--no-progress`
fn progress_bar(args: &TransferArgs) -> Result<(ProgressBar, Option<ProgressCallback>)> {
    if args.no_progress {
        return Ok((ProgressBar::hidden(), None));
    }

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )?
            .progress_chars("#>-"),
    );

    let bar = pb.clone();
    let callback = ProgressCallback::new(move |_, transferred, total| {
        if total > 0 && bar.length() != Some(total) {
            bar.set_length(total);
        }
        bar.set_position(transferred);
    });
    Ok((pb, Some(callback)))
}

/// Handle upload command
pub async fn handle_upload(
    config_path: Option<&Path>,
    file: &Path,
    target: &str,
    content_type: Option<String>,
    args: &TransferArgs,
) -> Result<()> {
    let config = load(config_path)?;
    let (bucket, key) = parse_location(target)?;

    if !file.is_file() {
        return Err(anyhow::anyhow!("File not found: {}", file.display()));
    }
    let file_size = file.metadata()?.len();

    // Detect content type
    let content_type = content_type.unwrap_or_else(|| {
        mime_guess::from_path(file)
            .first_or_octet_stream()
            .to_string()
    });

    println!("Uploading {} -> {}/{}...", file.display(), bucket, key);
    println!("  Size: {}", format_bytes(file_size));

    let uploader = Uploader::new(connect(&config)?, transfer_options(&config, args, false));
    let (pb, progress) = progress_bar(args)?;
    let mut request = UploadRequest::new(bucket, key).with_content_type(content_type);
    request.progress = progress;

    let result = uploader.upload_file(request, file).await;
    pb.finish_and_clear();
    let result = result.with_context(|| format!("Uploading {}", file.display()))?;

    println!("  {} Upload complete", style("✓").green());
    println!("  ETag: {}", result.etag);
    if let Some(upload_id) = &result.upload_id {
        println!("  Upload ID: {}", upload_id);
    }

    Ok(())
}

/// Handle download command
pub async fn handle_download(
    config_path: Option<&Path>,
    source: &str,
    file: &Path,
    range: Option<&str>,
    version_id: Option<String>,
    args: &TransferArgs,
) -> Result<()> {
    let config = load(config_path)?;
    let (bucket, key) = parse_location(source)?;

    let mut request = DownloadRequest::new(bucket.clone(), key.clone());
    if let Some(range) = range {
        request = request.with_range(range.parse::<ByteRange>()?);
    }
    if let Some(version_id) = version_id {
        request = request.with_version_id(version_id);
    }

    println!("Downloading {}/{} -> {}...", bucket, key, file.display());

    let downloader = Downloader::new(connect(&config)?, transfer_options(&config, args, false));
    let (pb, progress) = progress_bar(args)?;
    request.progress = progress;

    let result = downloader.download_file(request, file).await;
    pb.finish_and_clear();
    let result = result.with_context(|| format!("Downloading {}/{}", bucket, key))?;

    println!(
        "  {} Download complete ({})",
        style("✓").green(),
        format_bytes(result.written)
    );

    Ok(())
}

/// Handle copy command
pub async fn handle_copy(
    config_path: Option<&Path>,
    source: &str,
    target: &str,
    version_id: Option<String>,
    storage_class: Option<String>,
    args: &TransferArgs,
) -> Result<()> {
    let config = load(config_path)?;
    let (source_bucket, source_key) = parse_location(source)?;
    let (bucket, key) = parse_location(target)?;

    let mut request = CopyRequest::new(source_bucket, source_key, bucket, key);
    if let Some(version_id) = version_id {
        request = request.with_source_version_id(version_id);
    }
    if let Some(storage_class) = storage_class {
        request = request.with_storage_class(storage_class);
    }

    println!("Copying {} -> {}...", source, target);

    let copier = Copier::new(connect(&config)?, transfer_options(&config, args, true));
    let (pb, progress) = progress_bar(args)?;
    request.progress = progress;

    let result = copier.copy(request).await;
    pb.finish_and_clear();
    let result = result.with_context(|| format!("Copying {} to {}", source, target))?;

    println!("  {} Copy complete", style("✓").green());
    println!("  ETag: {}", result.etag);

    Ok(())
}

/// Handle config commands
pub async fn handle_config(config_path: Option<&Path>, action: &str) -> Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => get_config_path()?,
    };

    match action {
        "show" => {
            let config = load_config_from(&path)?;

            println!("Current configuration ({}):", path.display());
            println!();
            println!("Endpoint:");
            println!("  URL: {}", config.endpoint.url);
            println!("  Region: {}", config.endpoint.region);
            println!("  Path style: {}", config.endpoint.force_path_style);
            println!(
                "  Access key: {}",
                config
                    .endpoint
                    .access_key_id
                    .as_deref()
                    .map(mask)
                    .unwrap_or_else(|| "(not set)".to_string())
            );

            let transfer = config.transfer.clone().unwrap_or_default();
            println!();
            println!("Transfer:");
            println!("  Part size: {}", format_bytes(transfer.part_size));
            println!("  Copy part size: {}", format_bytes(transfer.copy_part_size));
            println!("  Parallel: {}", transfer.parallel_num);
            println!("  Checkpoint: {}", transfer.enable_checkpoint);
            if let Some(dir) = &transfer.checkpoint_dir {
                println!("  Checkpoint dir: {}", dir.display());
            }
            println!("  CRC verification: {}", transfer.enable_crc);

            Ok(())
        }
        "validate" => {
            println!("Validating {}...", path.display());

            let config = load_config_from(&path)?;
            validate_config(&config)?;
            println!("  {} Valid configuration", style("✓").green());

            Ok(())
        }
        _ => {
            println!("Unknown action: {}", action);
            println!("Available actions: show, validate");
            Ok(())
        }
    }
}

/// Keeps the first four characters of a secret
fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{}****", visible)
}

/// Format bytes to human-readable size
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Handle shell completion generation
pub async fn handle_completion(shell: &str, cmd: &mut Command) -> Result<()> {
    use std::io;

    let clap_shell = match shell {
        "bash" => ClapShell::Bash,
        "zsh" => ClapShell::Zsh,
        "fish" => ClapShell::Fish,
        "elvish" => ClapShell::Elvish,
        "powershell" | "pwsh" => ClapShell::PowerShell,
        _ => {
            return Err(anyhow::anyhow!(
                "Unsupported shell: {}\nSupported shells: bash, zsh, fish, elvish, powershell",
                shell
            ));
        }
    };

    // script on stdout so it can be sourced; hints on stderr
    generate(clap_shell, cmd, "ossxfer", &mut io::stdout());

    match shell {
        "bash" => eprintln!("# Add to your ~/.bashrc: source <(ossxfer completion bash)"),
        "zsh" => eprintln!("# Add to your ~/.zshrc: source <(ossxfer completion zsh)"),
        "fish" => eprintln!(
            "# ossxfer completion fish > ~/.config/fish/completions/ossxfer.fish"
        ),
        "elvish" => eprintln!("# ossxfer completion elvish > ~/.elvish/lib/ossxfer.elv"),
        _ => eprintln!("# ossxfer completion powershell | Out-String | Invoke-Expression"),
    }

    Ok(())
}

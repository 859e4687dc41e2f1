use anyhow::Result;
use chrono::NaiveDate;
use register_extract::config::AppConfig;
use register_extract::deduplication::BatchWindow;
use register_extract::errors::error_logging;
use register_extract::export;
use register_extract::normalizer::RegisterImage;
use register_extract::observability;
use register_extract::pipeline::Pipeline;
use register_extract::recognizer::ReplayRecognizer;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const USAGE: &str =
    "usage: register-extract <image> <tokens.json> [<image> <tokens.json> ...] [out_dir]";

/// One register page and its recorded recognizer output
struct Page {
    image: PathBuf,
    tokens: PathBuf,
}

/// Command line arguments of the demonstration driver
struct Args {
    pages: Vec<Page>,
    out_dir: PathBuf,
}

fn parse_args() -> Result<Args> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    // An odd trailing argument names the output directory
    let out_dir = match args.len() % 2 {
        1 => args.pop(),
        _ => None,
    }
    .unwrap_or_else(|| "register_export".to_string());
    if args.is_empty() {
        return Err(anyhow::anyhow!(USAGE));
    }
    let pages = args
        .chunks(2)
        .map(|pair| Page {
            image: PathBuf::from(&pair[0]),
            tokens: PathBuf::from(&pair[1]),
        })
        .collect();
    Ok(Args {
        pages,
        out_dir: out_dir.into(),
    })
}

/// Caller metadata from `REGISTER_CENTER_NAME` and `REGISTER_DATE` (yyyy-mm-dd)
fn apply_metadata_overrides(mut image: RegisterImage) -> Result<RegisterImage> {
    if let Ok(center) = env::var("REGISTER_CENTER_NAME") {
        if !center.trim().is_empty() {
            image = image.with_center(center.trim());
        }
    }
    if let Ok(date) = env::var("REGISTER_DATE") {
        let parsed = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|e| {
            error_logging::log_config_error(&e, "REGISTER_DATE", "parse_metadata");
            anyhow::anyhow!("REGISTER_DATE must be yyyy-mm-dd, got '{}'", date)
        })?;
        image = image.with_date(parsed);
    }
    Ok(image)
}

fn mime_for(path: &std::path::Path) -> Option<&'static str> {
    match path.extension()?.to_str()?.to_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file first
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    observability::init_tracing(&config.observability)?;
    config.validate()?;

    let args = parse_args()?;

    // Ctrl-C cancels the batch cooperatively
    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    // Cross-page duplicates are only found among pages of this invocation
    let mut window = BatchWindow::from_config(&config.deduplication);
    let multi_page = args.pages.len() > 1;

    for (index, page) in args.pages.iter().enumerate() {
        let bytes = std::fs::read(&page.image).map_err(|e| {
            error_logging::log_filesystem_error(&e, "read_image", page.image.to_str(), None);
            anyhow::anyhow!("Cannot read image {}: {}", page.image.display(), e)
        })?;
        let mut image = RegisterImage::new(bytes);
        if let Some(mime) = mime_for(&page.image) {
            image = image.with_mime(mime);
        }
        let image = apply_metadata_overrides(image)?;

        let recognizer = Arc::new(ReplayRecognizer::from_json_file(&page.tokens)?);
        let pipeline = Pipeline::new(&config, recognizer)?;

        let result = pipeline
            .process_with_window(image, Some(&window), &cancel)
            .await?;
        window.push(&result.batch);
        for warning in &result.warnings {
            warn!(?warning, "Image quality warning");
        }

        let out_dir = if multi_page {
            args.out_dir.join(format!("page-{}", index + 1))
        } else {
            args.out_dir.clone()
        };
        let files = export::export_all(&result, &out_dir)?;
        info!(
            page = index + 1,
            records = result.batch.records.len(),
            skipped_rows = result.batch.skipped_rows,
            partial = result.is_partial(),
            csv = %files.csv.display(),
            json = %files.nested_json.display(),
            "Register extracted"
        );

        println!(
            "{}: {} records ({} duplicates, {} skipped lines) written to {}",
            page.image.display(),
            result.batch.records.len(),
            result.batch.records.iter().filter(|r| r.is_duplicate()).count(),
            result.batch.skipped_rows,
            out_dir.display()
        );
    }
    Ok(())
}

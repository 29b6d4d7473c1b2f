use clap::{Parser, Subcommand};
use std::path::PathBuf;
use virex::orchestrator::{self, CancelToken, ExtractMode};
use virex::EngineConfig;

#[derive(Parser)]
#[command(name = "virex", version = "1.0.0", about = "Forensic recovery engine for dash-cam/CCTV video evidence")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze every video file reachable from IMAGE_PATH: integrity + structure, no recovery.
    ///
    /// IMAGE_PATH may be a raw/EWF disk image (carved and walked via the full
    /// recovery pipeline) or a directory of already-extracted video files.
    Analyze { image_path: PathBuf },
    /// Recover slack/hidden data from damaged video files reachable from IMAGE_PATH.
    Extract {
        image_path: PathBuf,
        mode: ExtractMode,
        download_dir: PathBuf,
        /// Optional JSON array of file names to restrict extraction to.
        selected_json: Option<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = EngineConfig::load(std::env::current_exe().ok().and_then(|p| p.parent().map(|p| p.to_path_buf())).as_deref());
    let cancel = CancelToken::new();

    let result = match cli.command {
        Commands::Analyze { image_path } => run_analyze(&image_path, &cfg, &cancel),
        Commands::Extract { image_path, mode, download_dir, selected_json } => {
            run_extract(&image_path, mode, &download_dir, selected_json.as_deref(), &cfg, &cancel)
        }
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run_analyze(image_path: &std::path::Path, cfg: &EngineConfig, cancel: &CancelToken) -> Result<(), virex::EngineError> {
    let (analysis_dir, records) = if image_path.is_dir() {
        let records = orchestrator::analyze_directory(image_path, cfg, cancel)?;
        (image_path.to_path_buf(), records)
    } else {
        orchestrator::analyze_image(image_path, cfg, cancel)?
    };

    let analysis_path = analysis_dir.join("analysis.json");
    if image_path.is_dir() {
        orchestrator::write_json_atomic(&analysis_path, &records)?;
    }
    if let Ok(line) = serde_json::to_string(&serde_json::json!({ "analysisPath": analysis_path })) {
        println!("{line}");
    }
    Ok(())
}

fn run_extract(
    image_path: &std::path::Path,
    mode: ExtractMode,
    download_dir: &std::path::Path,
    selected_json: Option<&std::path::Path>,
    cfg: &EngineConfig,
    cancel: &CancelToken,
) -> Result<(), virex::EngineError> {
    let selected: Option<Vec<String>> = selected_json
        .and_then(|p| std::fs::read_to_string(p).ok())
        .and_then(|text| serde_json::from_str(&text).ok());

    let mut records = if image_path.is_dir() {
        orchestrator::extract_directory(image_path, mode, download_dir, cfg, cancel)?
    } else {
        orchestrator::extract_image(image_path, mode, download_dir, cfg, cancel)?
    };
    if let Some(names) = selected {
        records.retain(|r| names.contains(&r.name));
    }
    orchestrator::write_json_atomic(&download_dir.join("analysis.json"), &records)?;
    Ok(())
}

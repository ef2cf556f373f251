mod cli;

use anyhow::{Context, Result};
use blanklogo::{Capabilities, Pipeline, ProcessingMode, ProgressSink};
use cli::{Args, Command, ProcessArgs};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();
    let models = args.models.config();

    match args.command {
        Command::Capabilities => {
            let caps = Capabilities::load(&models);
            println!("{}", serde_json::to_string_pretty(&caps.report())?);
        }
        Command::Process(process) => {
            let mode = process.mode()?;
            // Crop never touches a model.
            let caps = match mode {
                ProcessingMode::Crop { .. } => Capabilities::from_parts(None, None),
                _ => Capabilities::load(&models),
            };
            run_process(&process, mode, Arc::new(caps))?;
        }
    }

    Ok(())
}

fn run_process(args: &ProcessArgs, mode: ProcessingMode, caps: Arc<Capabilities>) -> Result<()> {
    let options = args.options()?;

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}%")?
            .progress_chars("#>-"),
    );
    let bar = pb.clone();
    let sink: Arc<dyn ProgressSink> = Arc::new(move |percent: u8| bar.set_position(percent as u64));

    let pipeline = Pipeline::new(options, caps).with_progress_sink(sink);
    let outcome = pipeline.process(&args.input, &args.output, &mode);
    pb.finish_and_clear();

    match outcome {
        Ok(result) => {
            if let Some(path) = &args.summary_json {
                write_json(path, &result)?;
            }
            if let Some(path) = &args.detections_json {
                write_json(path, &result.detections)?;
            }
            println!(
                "{} -> {:?} ({}x{} -> {}x{}, {:.2}s)",
                result.mode,
                args.output,
                result.original_size.0,
                result.original_size.1,
                result.output_size.0,
                result.output_size.1,
                result.elapsed_secs
            );
            for warning in &result.warnings {
                println!("warning: {}", warning);
            }
            Ok(())
        }
        Err(failure) => {
            if let Some(path) = &args.summary_json {
                let report = serde_json::json!({
                    "job_id": failure.job_id,
                    "stage": failure.stage,
                    "progress": failure.progress,
                    "error": failure.source.to_string(),
                });
                write_json(path, &report)?;
            }
            Err(failure.into())
        }
    }
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::{command, Parser};
use colored::Colorize;

use presetconv::dtype::{Cancellation, ConsoleNotifier, Context, MapSettings};
use presetconv::fileutils::VERSION;
use presetconv::pipeline::{self, FormatId, PipelineOptions};

#[derive(Parser)]
#[command(version = VERSION, about = "Converts multi-sample instrument presets between sampler formats", long_about = None)]
struct Cli {
    /// Folder scanned recursively for source presets
    #[arg(value_name = "SOURCE-DIR")]
    source_dir: PathBuf,

    /// Folder the converted presets are written to
    #[arg(value_name = "DEST-DIR")]
    dest_dir: PathBuf,

    /// Parse only, write nothing
    #[arg(long)]
    analyze: bool,

    /// Source format to look for; repeatable, all formats when omitted
    #[arg(long = "source", value_name = "FORMAT")]
    source_formats: Vec<String>,

    /// Destination format
    #[arg(long = "target", value_name = "FORMAT", default_value = "bitwig")]
    target_format: String,

    /// Preset rename mapping file (rows: old,new or old;new)
    #[arg(long = "rename-file", value_name = "PATH")]
    rename_file: Option<PathBuf>,

    /// Mirror the source folder layout below the destination
    #[arg(long = "create-folder-structure")]
    create_folder_structure: bool,

    /// Skip presets whose output already exists
    #[arg(long = "add-new-files")]
    add_new_files: bool,

    /// Codec option as key=value; repeatable
    #[arg(long = "output-format-option", value_name = "KEY=VALUE")]
    format_options: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut options = PipelineOptions {
        analyze_only: cli.analyze,
        create_folder_structure: cli.create_folder_structure,
        add_new_files: cli.add_new_files,
        ..Default::default()
    };

    match FormatId::from_str(&cli.target_format) {
        Ok(format) => options.target_format = format,
        Err(_) => {
            eprintln!("{}Unknown target format '{}'.", "Error: ".red(), cli.target_format);
            return ExitCode::from(1);
        }
    }
    if !cli.source_formats.is_empty() {
        options.source_formats.clear();
        for name in &cli.source_formats {
            match FormatId::from_str(name) {
                Ok(format) => options.source_formats.push(format),
                Err(_) => {
                    eprintln!("{}Unknown source format '{}'.", "Error: ".red(), name);
                    return ExitCode::from(1);
                }
            }
        }
    }
    if !cli.source_dir.is_dir() {
        eprintln!("{}'{}' is not a folder.", "Error: ".red(), cli.source_dir.display());
        return ExitCode::from(1);
    }

    let mut settings = MapSettings::new();
    for pair in &cli.format_options {
        if let Err(e) = settings.set_pair(pair) {
            eprintln!("{}{}", "Error: ".red(), e);
            return ExitCode::from(1);
        }
    }
    // Cross-cutting transforms ride on the same option channel.
    {
        use presetconv::dtype::Settings as _;
        options.inject_key_crossfade = settings.get_u32("injectKeyCrossfade", 0);
        options.inject_velocity_crossfade = settings.get_u32("injectVelocityCrossfade", 0);
    }

    if let Some(rename_path) = &cli.rename_file {
        match pipeline::load_rename_file(rename_path) {
            Ok(pairs) => options.renames = pairs,
            Err(e) => {
                eprintln!("{}{}", "Error: ".red(), e);
                return ExitCode::from(1);
            }
        }
    }

    let notifier = ConsoleNotifier::new();
    let cancellation = Cancellation::new();
    let ctx = Context::new(&notifier, cancellation, &settings);

    let report = pipeline::run(&ctx, &cli.source_dir, &cli.dest_dir, &options);
    println!(
        "\n{} preset(s) processed, {} error(s).",
        report.converted, report.errors
    );
    if report.cancelled {
        ExitCode::from(3)
    } else if report.errors > 0 {
        ExitCode::from(2)
    } else {
        ExitCode::from(0)
    }
}

//! Command-line argument definitions.

use std::path::PathBuf;

use cgm_core::RecordKind;
use clap::{Args, Parser, Subcommand};

use crate::config::StoreKind;

/// CGM export converter.
///
/// Reads continuous glucose monitor receiver exports and writes windowed
/// batches of glucose reads, calibrations, injections, meals, and exercises.
#[derive(Debug, Parser)]
#[command(name = "cgm", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Convert a directory of receiver exports into batch artifacts.
    Convert(ConvertArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ConvertArgs {
    /// Directory of exports to read.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Directory artifacts are written to (overrides `output_dir`).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Window length in days (overrides `window_days`).
    #[arg(short, long)]
    pub window_days: Option<u32>,

    /// Persistence backend (overrides `store`).
    #[arg(long, value_enum)]
    pub store: Option<StoreKind>,

    /// Convert only this record kind; repeat for several (overrides `record_types`).
    ///
    /// One of glucose, calibration, injection, meal (or carb), exercise.
    #[arg(short, long = "record-type", value_name = "KIND")]
    pub record_types: Vec<RecordKind>,

    /// Print the run report as JSON.
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn convert_flags_parse() {
        let cli = Cli::try_parse_from([
            "cgm", "-v", "convert", "-i", "in", "-o", "out", "-w", "3", "--store", "sqlite",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Some(Commands::Convert(args)) = cli.command else {
            panic!("expected convert");
        };
        assert_eq!(args.input, PathBuf::from("in"));
        assert_eq!(args.output, Some(PathBuf::from("out")));
        assert_eq!(args.window_days, Some(3));
        assert_eq!(args.store, Some(StoreKind::Sqlite));
        assert!(args.record_types.is_empty());
        assert!(!args.json);
    }

    #[test]
    fn record_type_repeats_and_accepts_carb() {
        let cli = Cli::try_parse_from([
            "cgm", "convert", "-i", "in", "-r", "glucose", "--record-type", "carb",
        ])
        .unwrap();
        let Some(Commands::Convert(args)) = cli.command else {
            panic!("expected convert");
        };
        assert_eq!(
            args.record_types,
            vec![RecordKind::GlucoseRead, RecordKind::Meal]
        );

        assert!(Cli::try_parse_from(["cgm", "convert", "-i", "in", "-r", "insulin"]).is_err());
    }
}

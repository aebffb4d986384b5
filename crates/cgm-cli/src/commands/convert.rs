//! Convert command: receiver exports in, batch artifacts out.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cgm_core::{
    BatchPersister, ConvertOptions, ConvertReport, Converter, IngestError, SharedSink, TracingSink,
};
use cgm_dexcom::DexcomXmlDecoder;
use cgm_store::{JsonDirectoryPersister, SqlitePersister};
use fs2::FileExt;

use crate::cli::ConvertArgs;
use crate::config::{Config, StoreKind};

/// Lock file guarding an output directory during a run.
pub const LOCK_FILE: &str = ".cgm.lock";

/// Runs a conversion and writes its report to `writer`.
///
/// A run that fails to persist some stream still prints what it wrote before
/// returning the error.
pub fn run<W: Write>(writer: &mut W, config: &Config, args: &ConvertArgs) -> Result<()> {
    let output_dir = resolve_output_dir(config, args)?;
    let mut options = config.convert_options(args.window_days.unwrap_or(config.window_days))?;
    if !args.record_types.is_empty() {
        options.kinds = Some(args.record_types.clone());
    }
    let naming = config.naming()?;
    let store = args.store.unwrap_or(config.store);

    fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let lock_file =
        File::create(output_dir.join(LOCK_FILE)).context("failed to create lock file")?;
    lock_file
        .lock_exclusive()
        .context("failed to acquire lock")?;

    tracing::info!(
        input = %args.input.display(),
        output = %output_dir.display(),
        ?store,
        "starting conversion"
    );

    let sink: SharedSink = Arc::new(TracingSink);
    let result = match store {
        StoreKind::Json => {
            let persister = JsonDirectoryPersister::new(&output_dir)
                .with_naming(naming)
                .with_sink(sink.clone());
            convert(&args.input, &persister, options, sink)
        }
        StoreKind::Sqlite => {
            let path = config.sqlite_path_for(&output_dir);
            let persister = SqlitePersister::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?
                .with_naming(naming)
                .with_sink(sink.clone());
            convert(&args.input, &persister, options, sink)
        }
    };

    match result {
        Ok(report) => write_report(writer, &report, args.json),
        Err(IngestError::Flush { failures, report }) => {
            write_report(writer, &report, args.json)?;
            for failure in &failures {
                tracing::error!(error = %failure, "stream failed to persist");
            }
            let first = failures
                .first()
                .map(ToString::to_string)
                .unwrap_or_default();
            anyhow::bail!(
                "{} record stream(s) failed to persist: {first}",
                failures.len()
            )
        }
        Err(err) => Err(err).context("conversion failed"),
    }
}

fn resolve_output_dir(config: &Config, args: &ConvertArgs) -> Result<PathBuf> {
    args.output
        .clone()
        .or_else(|| config.output_dir.clone())
        .context("no output directory: pass --output or set output_dir")
}

fn convert<P: BatchPersister>(
    input: &Path,
    persister: &P,
    options: ConvertOptions,
    sink: SharedSink,
) -> Result<ConvertReport, IngestError> {
    let decoder = DexcomXmlDecoder::new();
    Converter::new(&decoder, persister, options, sink).run(input)
}

/// Writes `report` as a summary, or as pretty JSON when `json` is set.
pub fn write_report<W: Write>(writer: &mut W, report: &ConvertReport, json: bool) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *writer, report).context("failed to write report")?;
        writeln!(writer)?;
        return Ok(());
    }

    writeln!(
        writer,
        "Files: {} read, {} skipped",
        report.files_read, report.files_skipped
    )?;
    writeln!(
        writer,
        "Events: {} read, {} skipped, {} ignored",
        report.events_read, report.events_skipped, report.events_ignored
    )?;
    if report.records_dropped > 0 {
        writeln!(
            writer,
            "Records dropped after failed writes: {}",
            report.records_dropped
        )?;
    }
    if report.artifacts.is_empty() {
        writeln!(writer, "No artifacts written.")?;
        return Ok(());
    }
    writeln!(writer, "Artifacts:")?;
    for artifact in &report.artifacts {
        writeln!(
            writer,
            "- {} ({} {} records)",
            artifact.name, artifact.records, artifact.kind
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use cgm_core::RecordKind;
    use insta::assert_snapshot;

    use super::*;

    const EXPORT: &str = r#"<Patient SerialNumber="SM40170636">
  <GlucoseReadings>
    <Glucose InternalTime="2014-02-20 14:06:03" DisplayTime="2014-02-20 06:06:48" Value="108" />
    <Glucose InternalTime="2014-02-20 14:11:03" DisplayTime="2014-02-20 06:11:48" Value="Low" />
    <Glucose InternalTime="2014-02-21 15:00:10" DisplayTime="2014-02-21 07:00:00" Value="131" />
  </GlucoseReadings>
  <MeterReadings>
    <Meter InternalTime="2014-02-20 14:10:00" DisplayTime="2014-02-20 06:10:45" Value="121" />
  </MeterReadings>
  <EventMarkers>
    <Event InternalTime="2014-01-31 16:39:46" DisplayTime="2014-01-31 08:39:59" EventTime="2014-01-31 08:39:00" EventType="Carbs" Decription="Carbs 45 grams" />
    <Event InternalTime="2014-01-31 17:00:00" DisplayTime="2014-01-31 09:00:13" EventTime="2014-01-31 08:55:00" EventType="Health" Decription="Illness" />
  </EventMarkers>
</Patient>
"#;

    fn args(input: &Path, output: &Path) -> ConvertArgs {
        ConvertArgs {
            input: input.to_path_buf(),
            output: Some(output.to_path_buf()),
            window_days: None,
            store: None,
            record_types: Vec::new(),
            json: false,
        }
    }

    fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("in");
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("export.xml"), EXPORT).unwrap();
        let output = temp.path().join("out");
        (temp, input, output)
    }

    #[test]
    fn convert_command_prints_summary() {
        let (_temp, input, output) = fixture();
        let mut out = Vec::new();
        run(&mut out, &Config::default(), &args(&input, &output)).unwrap();

        assert_snapshot!(String::from_utf8(out).unwrap(), @r"
        Files: 1 read, 0 skipped
        Events: 6 read, 1 skipped, 1 ignored
        Artifacts:
        - glucoseReads-20140220T140648Z_20140221T150000Z.json (2 glucose records)
        - calibrations-20140220T141045Z.json (1 calibration records)
        - meals-20140131T163900Z.json (1 meal records)
        ");
        assert!(output.join("meals-20140131T163900Z.json").is_file());
        assert!(output.join(LOCK_FILE).is_file());
    }

    #[test]
    fn window_override_splits_artifacts() {
        let (_temp, input, output) = fixture();
        let mut convert_args = args(&input, &output);
        convert_args.window_days = Some(1);
        convert_args.json = true;
        let mut out = Vec::new();
        run(&mut out, &Config::default(), &convert_args).unwrap();

        let report: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let names: Vec<&str> = report["artifacts"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|a| a["name"].as_str())
            .filter(|name| name.starts_with("glucoseReads"))
            .collect();
        assert_eq!(
            names,
            vec![
                "glucoseReads-20140220T140648Z.json",
                "glucoseReads-20140221T150000Z.json"
            ]
        );
    }

    #[test]
    fn sqlite_store_writes_database() {
        let (_temp, input, output) = fixture();
        let mut convert_args = args(&input, &output);
        convert_args.store = Some(StoreKind::Sqlite);
        let mut out = Vec::new();
        run(&mut out, &Config::default(), &convert_args).unwrap();

        let store = SqlitePersister::open(&output.join("cgm.sqlite")).unwrap();
        let artifacts = store.list_artifacts().unwrap();
        assert_eq!(artifacts.len(), 3);
        assert!(!output.join("meals-20140131T163900Z.json").exists());
    }

    #[test]
    fn record_type_limits_artifacts() {
        let (_temp, input, output) = fixture();
        let mut convert_args = args(&input, &output);
        convert_args.record_types = vec![RecordKind::Meal];
        let mut out = Vec::new();
        run(&mut out, &Config::default(), &convert_args).unwrap();

        assert_snapshot!(String::from_utf8(out).unwrap(), @r"
        Files: 1 read, 0 skipped
        Events: 6 read, 1 skipped, 4 ignored
        Artifacts:
        - meals-20140131T163900Z.json (1 meal records)
        ");
    }

    #[test]
    fn invalid_filename_format_fails_before_writing() {
        let (_temp, input, output) = fixture();
        let config = Config {
            filename_time_format: "%Q".to_string(),
            ..Config::default()
        };
        let err = run(&mut Vec::new(), &config, &args(&input, &output)).unwrap_err();
        assert!(format!("{err:#}").contains("invalid filename_time_format"));
        assert!(!output.exists());
    }

    #[test]
    fn dropped_records_are_summarised() {
        let report = ConvertReport {
            files_read: 1,
            events_read: 3,
            records_dropped: 2,
            ..ConvertReport::default()
        };
        let mut out = Vec::new();
        write_report(&mut out, &report, false).unwrap();
        assert_snapshot!(String::from_utf8(out).unwrap(), @r"
        Files: 1 read, 0 skipped
        Events: 3 read, 0 skipped, 0 ignored
        Records dropped after failed writes: 2
        No artifacts written.
        ");
    }

    #[test]
    fn missing_output_is_an_error() {
        let (_temp, input, _output) = fixture();
        let mut convert_args = args(&input, Path::new("unused"));
        convert_args.output = None;
        let err = run(&mut Vec::new(), &Config::default(), &convert_args).unwrap_err();
        assert!(err.to_string().contains("no output directory"));
    }

    #[test]
    fn missing_input_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = run(
            &mut Vec::new(),
            &Config::default(),
            &args(&temp.path().join("absent"), &temp.path().join("out")),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("cannot read input directory"));
    }
}

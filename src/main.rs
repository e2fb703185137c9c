use clap::{Parser, Subcommand};
use popout::{
    app_dirs::AppDirs,
    config::{ConfigStore, FileConfigStore},
    event::{Metadata, Position, META_FIELD_NAME, META_PAGE, META_PRODUCT_NAME},
    EmptyExport, EngineConfig, ExperimentEngine, ExportError, LazySink, Sink, SqliteSink,
    SqliteSnapshotStore, StatsSnapshot, TrialMode, TrialTargets,
};
use std::{error::Error, path::PathBuf};

/// record and export click sessions of a visual search experiment
#[derive(Parser, Debug, Clone)]
#[clap(
    version,
    about,
    long_about = "Drives a persisted experiment session from the command line: every invocation restores the session, applies one operation and saves it again."
)]
pub struct Cli {
    /// config file to read engine settings from
    #[clap(long)]
    config: Option<PathBuf>,

    /// sqlite file holding the persisted session
    #[clap(long)]
    store: Option<PathBuf>,

    /// trial semantics (overrides config)
    #[clap(short = 'm', long, value_enum)]
    mode: Option<TrialMode>,

    /// persistence slot name (overrides config)
    #[clap(short = 'k', long)]
    key: Option<String>,

    /// mirror rows into a sqlite telemetry log next to the store
    #[clap(long)]
    telemetry: bool,

    /// spell correctness as SIM/NÃO in exports
    #[clap(long)]
    portuguese: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// start the session clock
    Start,
    /// start a trial; in batch mode the targets form a sweep, in single mode
    /// a correct click on any of them completes the trial
    Trial {
        #[clap(required = true)]
        targets: Vec<String>,
        /// number of items on screen
        #[clap(short = 'n', long, default_value_t = 0)]
        items: usize,
    },
    /// register a click on a target
    Click {
        target: String,
        /// the click hit a correct target
        #[clap(short = 'c', long)]
        correct: bool,
        #[clap(short = 'x', long, default_value_t = 0.0)]
        x: f64,
        #[clap(short = 'y', long, default_value_t = 0.0)]
        y: f64,
        #[clap(long)]
        product_name: Option<String>,
        #[clap(long)]
        field_name: Option<String>,
        #[clap(long)]
        page: Option<String>,
    },
    /// print session statistics
    Stats {
        #[clap(long)]
        json: bool,
    },
    /// write the csv export
    Export {
        /// output directory
        #[clap(short = 'o', long)]
        out: Option<PathBuf>,
        /// print the csv instead of writing a file
        #[clap(long)]
        stdout: bool,
        /// what to do when no clicks were recorded
        #[clap(long, value_enum)]
        on_empty: Option<EmptyExport>,
    },
    /// discard the session and start over
    Reset,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let store = match &self.config {
            Some(path) => FileConfigStore::with_path(path),
            None => FileConfigStore::new(),
        };
        let mut config = store.load();
        // sessions begin on `start` or on the first trial or click
        config.auto_start = false;
        config.persist = true;
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(key) = &self.key {
            config.persist_key = key.clone();
        }
        if self.portuguese {
            config.labels = popout::CorrectnessLabels::portuguese();
        }
        if let Command::Export {
            on_empty: Some(on_empty),
            ..
        } = &self.command
        {
            config.empty_export = Some(*on_empty);
        }
        config
    }

    fn store_path(&self) -> PathBuf {
        self.store
            .clone()
            .or_else(AppDirs::snapshot_db_path)
            .unwrap_or_else(|| PathBuf::from("popout_snapshots.db"))
    }

    fn telemetry_sink(&self) -> LazySink {
        if !self.telemetry {
            return LazySink::none();
        }
        let path = match &self.store {
            Some(store) => store.with_file_name("telemetry.db"),
            None => AppDirs::telemetry_db_path().unwrap_or_else(|| PathBuf::from("popout_telemetry.db")),
        };
        LazySink::from_factory(move || Ok(Box::new(SqliteSink::open(path)?) as Box<dyn Sink>))
    }
}

fn metadata(product_name: &Option<String>, field_name: &Option<String>, page: &Option<String>) -> Option<Metadata> {
    let meta: Metadata = [
        (META_PRODUCT_NAME, product_name),
        (META_FIELD_NAME, field_name),
        (META_PAGE, page),
    ]
    .into_iter()
    .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
    .collect();
    (!meta.is_empty()).then_some(meta)
}

fn print_stats(engine: &ExperimentEngine, stats: &StatsSnapshot) {
    println!("session           {}", engine.session_id());
    println!("mode              {}", engine.mode());
    println!("active            {}", engine.is_active());
    println!("clicks            {}", stats.total_clicks);
    println!("correct           {}", stats.total_correct);
    println!("incorrect         {}", stats.total_incorrect);
    println!("accuracy          {:.1}%", stats.accuracy_percent);
    println!("avg reaction      {:.0} ms", stats.average_reaction_ms);
    println!("reaction std dev  {:.0} ms", stats.reaction_std_dev_ms);
    println!("completed trials  {}", stats.completed_trials);
    println!("first interaction {:.0} ms", stats.first_interaction_ms);
    println!("duration          {:.0} ms", stats.session_duration_ms);
    for t in &stats.per_trial {
        println!(
            "  trial {:>3}: {} clicks, {} correct, {:.0} ms mean reaction",
            t.trial, t.clicks, t.correct, t.mean_reaction_ms
        );
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = cli.engine_config();
    let store = SqliteSnapshotStore::open(cli.store_path())?;
    let sink = cli.telemetry_sink();
    // short-lived process: wait for the sink so no row is dropped
    sink.load();

    let mut engine = ExperimentEngine::builder(config)
        .snapshot_store(store)
        .sink(sink)
        .build();

    match &cli.command {
        Command::Start => {
            if engine.start_session() {
                println!("started session {}", engine.session_id());
            } else {
                println!("session {} already running", engine.session_id());
            }
        }
        Command::Trial { targets, items } => {
            let targets = match engine.mode() {
                TrialMode::Single if targets.len() == 1 => TrialTargets::single(targets[0].clone()),
                _ => TrialTargets::sweep(targets.iter().cloned()),
            };
            let id = engine.start_trial(targets, *items);
            println!("{}", id);
        }
        Command::Click {
            target,
            correct,
            x,
            y,
            product_name,
            field_name,
            page,
        } => {
            let event = engine.register_interaction(
                target.clone(),
                *correct,
                Position::new(*x, *y),
                metadata(product_name, field_name, page),
            );
            println!(
                "click {} on {} (trial {}): reaction {:.0} ms, accumulated {:.0} ms",
                event.index, event.target_id, event.trial, event.reaction_ms, event.accumulated_ms
            );
        }
        Command::Stats { json } => {
            let stats = engine.stats();
            if *json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&engine, &stats);
            }
        }
        Command::Export { out, stdout, .. } => match engine.export_records() {
            Ok(artifact) if *stdout => println!("{}", artifact.contents),
            Ok(artifact) => {
                let dir = out
                    .clone()
                    .or_else(AppDirs::export_dir)
                    .unwrap_or_else(|| PathBuf::from("."));
                let path = artifact.write_to(&dir)?;
                println!("wrote {} rows to {}", artifact.rows, path.display());
            }
            Err(ExportError::NothingToExport) => {
                eprintln!("no clicks recorded, nothing to export");
            }
            Err(e) => return Err(e.into()),
        },
        Command::Reset => {
            engine.reset();
            println!("new session {}", engine.session_id());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_click_parsing() {
        let cli = Cli::parse_from([
            "popout", "--mode", "batch", "click", "product-4", "--correct", "-x", "12.5", "--product-name", "Tea",
        ]);
        assert_eq!(cli.mode, Some(TrialMode::Batch));
        match cli.command {
            Command::Click {
                target,
                correct,
                x,
                product_name,
                ..
            } => {
                assert_eq!(target, "product-4");
                assert!(correct);
                assert_eq!(x, 12.5);
                assert_eq!(product_name.as_deref(), Some("Tea"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let cli = Cli::parse_from([
            "popout",
            "--config",
            config_path.to_str().unwrap(),
            "--key",
            "fastmart",
            "--portuguese",
            "export",
            "--on-empty",
            "refuse",
        ]);
        let config = cli.engine_config();
        assert!(config.persist);
        assert!(!config.auto_start);
        assert_eq!(config.persist_key, "fastmart");
        assert_eq!(config.labels.yes, "SIM");
        assert_eq!(config.empty_export, Some(EmptyExport::Refuse));
    }

    #[test]
    fn test_metadata_skips_missing_labels() {
        assert_eq!(metadata(&None, &None, &None), None);
        let meta = metadata(&Some("Tea".into()), &None, &Some("list".into())).unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.get(META_PAGE).map(String::as_str), Some("list"));
    }

    #[test]
    fn test_trial_requires_targets() {
        assert!(Cli::try_parse_from(["popout", "trial"]).is_err());
    }
}

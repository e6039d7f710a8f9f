use std::{env, fs, process::ExitCode, time::Instant};

use smile::{EvalResult, LimitedTracker, NoLimitTracker, ResourceLimits, SymbolTable, eval_source_with_evaluator};
use tracing_subscriber::EnvFilter;

/// `Smile.toml`'s `[run]` table (design note §D). Absent file or absent
/// keys fall back to the interpreter's built-in defaults.
#[derive(Debug, Default, serde::Deserialize)]
struct Config {
    #[serde(default)]
    run: RunConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
struct RunConfig {
    stack_limit: Option<usize>,
    #[serde(default)]
    trace: bool,
}

fn main() -> ExitCode {
    let config = read_config("Smile.toml");
    let default_level = if config.run.trace { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("SMILE_LOG").unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(?config, "loaded configuration");

    let args: Vec<String> = env::args().collect();
    let file_path = if args.len() > 1 { &args[1] } else { "example.sm" };
    let code = match read_file(file_path) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let start = Instant::now();
    let symbols = SymbolTable::new();
    let (result, evaluator) = match config.run.stack_limit {
        Some(limit) => {
            let tracker = LimitedTracker::new(ResourceLimits::new().max_recursion_depth(limit));
            eval_source_with_evaluator(&code, file_path, symbols, tracker)
        }
        None => eval_source_with_evaluator(&code, file_path, symbols, NoLimitTracker),
    };
    let elapsed = start.elapsed();

    match result {
        EvalResult::Ok { value } => {
            let rendered = evaluator.map_or_else(|| format!("{value:?}"), |e| e.display_value(value));
            eprintln!("success after: {elapsed:?}\n{rendered}");
            ExitCode::SUCCESS
        }
        EvalResult::ParseErrors(messages) => {
            eprintln!("parse errors after: {elapsed:?}");
            for message in &messages {
                eprintln!("  {:?}: {}", message.severity, message.error);
            }
            ExitCode::FAILURE
        }
        EvalResult::RuntimeError(exception) => {
            eprintln!("uncaught exception after: {elapsed:?}\n{exception}");
            ExitCode::FAILURE
        }
    }
}

fn read_config(path: &str) -> Config {
    match fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text).unwrap_or_else(|err| {
            eprintln!("warning: ignoring malformed {path}: {err}");
            Config::default()
        }),
        Err(_) => Config::default(),
    }
}

fn read_file(file_path: &str) -> Result<String, String> {
    tracing::debug!(file_path, "reading source file");
    match fs::metadata(file_path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("{file_path} is not a file"));
            }
        }
        Err(err) => {
            return Err(format!("reading {file_path}: {err}"));
        }
    }
    fs::read_to_string(file_path).map_err(|err| format!("reading {file_path}: {err}"))
}

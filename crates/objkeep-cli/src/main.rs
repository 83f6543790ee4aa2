use std::env;
use std::io;

use atty::Stream;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use objkeep_core::{
    download_object, run_maintenance, watch, DownloadRequest, ExecutionOutcome,
    MaintenanceRequest, Session,
};
use serde_json::{json, Value};

mod cli;
mod style;

use cli::{CommandCli, ObjkeepCli};
use style::Style;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = ObjkeepCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let root = match &cli.enlistment {
        Some(path) => path.clone(),
        None => env::current_dir()?,
    };
    let session = Session::open(&root).map_err(|err| eyre!("{err:?}"))?;
    let outcome = dispatch(&session, &cli.command).map_err(|err| eyre!("{err:?}"))?;
    let code = emit_output(&cli, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("objkeep_core={level},objkeep_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn dispatch(session: &Session, command: &CommandCli) -> anyhow::Result<ExecutionOutcome> {
    match command {
        CommandCli::Run(args) => run_maintenance(
            session,
            &MaintenanceRequest {
                task: args.task,
                force: args.force,
            },
        ),
        CommandCli::Download(args) => download_object(
            session,
            &DownloadRequest {
                object_id: args.object_id.clone(),
                source: args.source.into(),
            },
        ),
        CommandCli::Watch => watch(session, io::stdin().lock()),
    }
}

fn emit_output(cli: &ObjkeepCli, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.exit_code();
    let style = Style::new(cli.no_color, atty::is(Stream::Stdout));

    if cli.json {
        let payload = to_json_response(cli.command.name(), outcome);
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if !cli.quiet {
        let message = format!("objkeep {}: {}", cli.command.name(), outcome.message);
        println!("{}", style.status(outcome.status, &message));
        if let Some(hint) = hint_from_details(&outcome.details) {
            println!("{}", style.info(&format!("Hint: {hint}")));
        }
    }

    Ok(code)
}

fn to_json_response(command: &str, outcome: &ExecutionOutcome) -> Value {
    let details = match &outcome.details {
        Value::Object(_) => outcome.details.clone(),
        Value::Null => json!({}),
        other => json!({ "value": other }),
    };
    json!({
        "command": command,
        "status": outcome.status.as_str(),
        "message": outcome.message,
        "details": details,
    })
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details
        .as_object()
        .and_then(|map| map.get("hint"))
        .and_then(Value::as_str)
}

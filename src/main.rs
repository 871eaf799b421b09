use clap::{Arg, ArgMatches, Command};
use colored::*;
use log::{error, info};
use std::path::Path;

mod cli;
mod compiler;
mod driver;
mod engine;
mod error;
mod graph;
mod handoff;
mod netlist;
mod waveform;

use crate::cli::CliArgs;
use crate::graph::CircuitDescription;
use crate::netlist::Netlist;
use crate::waveform::WaveformTable;

fn main() {
    env_logger::init();

    let matches = create_cli().get_matches();

    if let Err(e) = run_application(&matches) {
        error!("{}", format!("Error: {}", e).red());
        std::process::exit(1);
    }
}

fn create_cli() -> Command {
    Command::new("lpnsim")
        .version("0.1.0")
        .about("Lumped-parameter network circuit compiler and simulation driver")
        .arg(
            Arg::new("input")
                .help("Input circuit file (.json diagram or .cir netlist)")
                .index(1),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Write the compiled netlist to FILE instead of stdout"),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .value_name("TITLE")
                .help("Title line for the compiled netlist"),
        )
        .arg(
            Arg::new("tran")
                .long("tran")
                .value_names(["STEP", "DURATION"])
                .num_args(2)
                .help("Transient analysis: time step and duration"),
        )
        .arg(
            Arg::new("uic")
                .long("uic")
                .action(clap::ArgAction::SetTrue)
                .help("Use the supplied initial conditions for --tran"),
        )
        .arg(
            Arg::new("dc")
                .long("dc")
                .value_names(["SOURCE", "START", "STOP"])
                .num_args(3)
                .help("DC sweep analysis"),
        )
        .arg(
            Arg::new("bc")
                .long("bc")
                .value_name("NAME=FILE")
                .action(clap::ArgAction::Append)
                .help("Boundary-condition waveform file for an external element"),
        )
        .arg(
            Arg::new("period")
                .long("period")
                .value_name("SECONDS")
                .help("Override the period inferred from waveform files"),
        )
        .arg(
            Arg::new("ic")
                .long("ic")
                .value_name("NODE=VALUE")
                .action(clap::ArgAction::Append)
                .help("Initial condition for an electrical node"),
        )
        .arg(
            Arg::new("check")
                .long("check-bc")
                .value_name("FILE")
                .action(clap::ArgAction::Append)
                .help("Validate waveform files and exit"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("Increase verbosity level"),
        )
}

fn run_application(matches: &ArgMatches) -> anyhow::Result<()> {
    let args = CliArgs::from_matches(matches)?;

    if !args.check_files.is_empty() {
        return check_waveforms(&args.check_files);
    }

    // from_matches guarantees an input when no check files were given
    let input = args.input_file.clone().unwrap_or_default();
    info!("{}", "Starting lpnsim".green().bold());
    info!("Input file: {}", input.bright_blue());

    if !Path::new(&input).exists() {
        return Err(anyhow::anyhow!("Input file '{}' not found", input));
    }

    let mut netlist = if input.ends_with(".json") {
        let text = std::fs::read_to_string(&input)?;
        let description: CircuitDescription = serde_json::from_str(&text)?;
        let graph = description.build_graph()?;
        let name = args.circuit_name.unwrap_or_else(|| description.name.clone());
        compiler::compile(&graph, &name, args.period)?
    } else {
        Netlist::load_from_file(&input, &args.bc_files, args.period)?
    };

    for (node, value) in &args.initial_conditions {
        netlist.add_initial_condition(node, *value);
    }
    if let Some(analysis) = args.analysis {
        netlist.set_analysis(analysis);
    }

    if let Some(output_file) = args.output_file {
        netlist.write_to_file(&output_file)?;
        info!("Netlist written to: {}", output_file.bright_green());
    } else {
        for line in netlist.to_lines() {
            println!("{}", line);
        }
    }

    if netlist.is_complete() {
        info!("{}", "Netlist is complete and executable".green().bold());
    } else {
        info!("Netlist has no analysis directive yet");
    }
    Ok(())
}

fn check_waveforms(files: &[std::path::PathBuf]) -> anyhow::Result<()> {
    let mut failures = 0;
    for file in files {
        if WaveformTable::check_file(file) {
            println!("{} {}", "ok:".green(), file.display());
        } else {
            println!("{} {}", "invalid:".red().bold(), file.display());
            failures += 1;
        }
    }
    if failures > 0 {
        return Err(anyhow::anyhow!("{} waveform file(s) failed validation", failures));
    }
    Ok(())
}

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::ArgMatches;

use crate::netlist::{parse_quantity, Analysis};

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub input_file: Option<String>,
    pub output_file: Option<String>,
    pub circuit_name: Option<String>,
    pub analysis: Option<Analysis>,
    pub bc_files: HashMap<String, PathBuf>,
    pub period: Option<f64>,
    pub initial_conditions: Vec<(String, f64)>,
    pub check_files: Vec<PathBuf>,
    pub verbose_level: u8,
}

impl CliArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let check_files: Vec<PathBuf> = matches
            .get_many::<String>("check")
            .map(|v| v.map(PathBuf::from).collect())
            .unwrap_or_default();

        let input_file = matches.get_one::<String>("input").cloned();
        if input_file.is_none() && check_files.is_empty() {
            return Err(anyhow!("An input circuit file is required"));
        }

        let output_file = matches.get_one::<String>("output").cloned();
        let circuit_name = matches.get_one::<String>("name").cloned();
        let verbose_level = matches.get_count("verbose");

        let period = matches
            .get_one::<String>("period")
            .map(|p| parse_quantity_arg(p))
            .transpose()?;

        let mut bc_files = HashMap::new();
        if let Some(specs) = matches.get_many::<String>("bc") {
            for spec in specs {
                let (name, file) = parse_assignment(spec)?;
                bc_files.insert(name, PathBuf::from(file));
            }
        }

        let mut initial_conditions = Vec::new();
        if let Some(specs) = matches.get_many::<String>("ic") {
            for spec in specs {
                let (node, value) = parse_assignment(spec)?;
                initial_conditions.push((node, parse_quantity_arg(&value)?));
            }
        }

        let analysis = if let Some(tran_values) = matches.get_many::<String>("tran") {
            if matches.contains_id("dc") {
                return Err(anyhow!("Choose either --tran or --dc, not both"));
            }
            let values: Vec<&String> = tran_values.collect();
            let step = parse_quantity_arg(values[0])?;
            let duration = parse_quantity_arg(values[1])?;

            if step <= 0.0 || duration <= 0.0 || step >= duration {
                return Err(anyhow!(
                    "Invalid time parameters: step must be positive and less than the duration"
                ));
            }

            Some(Analysis::Tran {
                step,
                duration,
                uic: matches.get_flag("uic"),
            })
        } else if let Some(dc_values) = matches.get_many::<String>("dc") {
            let values: Vec<&String> = dc_values.collect();
            Some(Analysis::Dc {
                source: values[0].clone(),
                start: parse_quantity_arg(values[1])?,
                stop: parse_quantity_arg(values[2])?,
            })
        } else {
            None
        };

        Ok(CliArgs {
            input_file,
            output_file,
            circuit_name,
            analysis,
            bc_files,
            period,
            initial_conditions,
            check_files,
            verbose_level,
        })
    }
}

/// Parse a quantity with an optional unit modifier (e.g., "1m", "2.5u")
fn parse_quantity_arg(text: &str) -> Result<f64> {
    parse_quantity(text).ok_or_else(|| anyhow!("Invalid quantity '{}'", text))
}

/// Split a "NAME=VALUE" argument (e.g., "Vin=pulse.txt", "2=0.5")
fn parse_assignment(spec: &str) -> Result<(String, String)> {
    let (name, value) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected NAME=VALUE, got '{}'", spec))?;
    if name.is_empty() || value.is_empty() {
        return Err(anyhow!("Expected NAME=VALUE, got '{}'", spec));
    }
    Ok((name.to_string(), value.to_string()))
}

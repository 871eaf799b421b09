use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::NetlistError;
use crate::waveform::WaveformTable;

lazy_static! {
    /// `<name> <node> <node> <value|external>`
    static ref ELEMENT_LINE_PATTERN: Regex =
        Regex::new(r"^(\w+)\s+(\w+)\s+(\w+)\s+(\S+)\s*$").unwrap();
    static ref ANALYSIS_PATTERN: Regex = Regex::new(r"^\.(tran|dc)\s+(.+)$").unwrap();
    static ref QUANTITY_PATTERN: Regex =
        Regex::new(r"^(-?[0-9]+\.?[0-9]*(?:[eE]-?[0-9]+)?)\s*([TGMKmuµnpf]?)$").unwrap();
}

/// SI unit modifier attached to an element value or analysis time.
/// The micro prefix accepts `µ` on input but is always serialized as
/// the ASCII letter `u`, which is what the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnitPrefix {
    Tera,
    Giga,
    Mega,
    Kilo,
    #[default]
    None,
    Milli,
    Micro,
    Nano,
    Pico,
    Femto,
}

impl UnitPrefix {
    pub const ALL: [UnitPrefix; 10] = [
        UnitPrefix::Tera,
        UnitPrefix::Giga,
        UnitPrefix::Mega,
        UnitPrefix::Kilo,
        UnitPrefix::None,
        UnitPrefix::Milli,
        UnitPrefix::Micro,
        UnitPrefix::Nano,
        UnitPrefix::Pico,
        UnitPrefix::Femto,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            UnitPrefix::Tera => "T",
            UnitPrefix::Giga => "G",
            UnitPrefix::Mega => "M",
            UnitPrefix::Kilo => "K",
            UnitPrefix::None => "",
            UnitPrefix::Milli => "m",
            UnitPrefix::Micro => "u",
            UnitPrefix::Nano => "n",
            UnitPrefix::Pico => "p",
            UnitPrefix::Femto => "f",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "T" => Some(UnitPrefix::Tera),
            "G" => Some(UnitPrefix::Giga),
            "M" => Some(UnitPrefix::Mega),
            "K" => Some(UnitPrefix::Kilo),
            "" => Some(UnitPrefix::None),
            "m" => Some(UnitPrefix::Milli),
            "u" | "µ" => Some(UnitPrefix::Micro),
            "n" => Some(UnitPrefix::Nano),
            "p" => Some(UnitPrefix::Pico),
            "f" => Some(UnitPrefix::Femto),
            _ => None,
        }
    }

    pub fn scale(self) -> f64 {
        match self {
            UnitPrefix::Tera => 1e12,
            UnitPrefix::Giga => 1e9,
            UnitPrefix::Mega => 1e6,
            UnitPrefix::Kilo => 1e3,
            UnitPrefix::None => 1.0,
            UnitPrefix::Milli => 1e-3,
            UnitPrefix::Micro => 1e-6,
            UnitPrefix::Nano => 1e-9,
            UnitPrefix::Pico => 1e-12,
            UnitPrefix::Femto => 1e-15,
        }
    }

    /// For sub-unity prefixes, the exactly-representable positive power
    /// to divide by; multiplying by `scale()` can be off by one ulp
    /// (e.g. `2.5 * 1e-6 != 2.5e-6`).
    pub fn divisor(self) -> Option<f64> {
        match self {
            UnitPrefix::Milli => Some(1e3),
            UnitPrefix::Micro => Some(1e6),
            UnitPrefix::Nano => Some(1e9),
            UnitPrefix::Pico => Some(1e12),
            UnitPrefix::Femto => Some(1e15),
            _ => None,
        }
    }
}

/// Parse a quantity such as `2.5u` or `10K` into its value in base units.
pub fn parse_quantity(text: &str) -> Option<f64> {
    let caps = QUANTITY_PATTERN.captures(text.trim())?;
    let magnitude = caps.get(1)?.as_str().parse::<f64>().ok()?;
    let prefix = UnitPrefix::from_symbol(caps.get(2)?.as_str())?;
    Some(match prefix.divisor() {
        Some(divisor) => magnitude / divisor,
        None => magnitude * prefix.scale(),
    })
}

/// Render a quantity in base units with the largest prefix that keeps
/// the mantissa at or above one, e.g. `0.0025` -> `2.5m`.
pub fn format_quantity(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    for prefix in UnitPrefix::ALL {
        let mantissa = value / prefix.scale();
        if mantissa.abs() >= 1.0 {
            return format!("{}{}", mantissa, prefix.symbol());
        }
    }
    // below femto, give up on prefixes
    format!("{}", value)
}

/// The single analysis directive a netlist may carry. Times and sweep
/// bounds are stored in base units and rendered with unit modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Analysis {
    Tran { step: f64, duration: f64, uic: bool },
    Dc { source: String, start: f64, stop: f64 },
}

impl Analysis {
    /// Parse a `.tran`/`.dc` line from an externally supplied netlist.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = ANALYSIS_PATTERN.captures(line.trim())?;
        let args: Vec<&str> = caps.get(2)?.as_str().split_whitespace().collect();
        match caps.get(1)?.as_str() {
            "tran" => {
                let step = parse_quantity(args.first()?)?;
                let duration = parse_quantity(args.get(1)?)?;
                let uic = args.get(2).map(|s| *s == "uic").unwrap_or(false);
                Some(Analysis::Tran {
                    step,
                    duration,
                    uic,
                })
            }
            "dc" => Some(Analysis::Dc {
                source: args.first()?.to_string(),
                start: parse_quantity(args.get(1)?)?,
                stop: parse_quantity(args.get(2)?)?,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Analysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Analysis::Tran {
                step,
                duration,
                uic,
            } => {
                write!(f, ".tran {} {}", format_quantity(*step), format_quantity(*duration))?;
                if *uic {
                    write!(f, " uic")?;
                }
                Ok(())
            }
            Analysis::Dc {
                source,
                start,
                stop,
            } => write!(
                f,
                ".dc {} {} {}",
                source,
                format_quantity(*start),
                format_quantity(*stop)
            ),
        }
    }
}

/// An ordered textual circuit description ready for the engine.
///
/// Structure of the serialized form:
///
/// ```text
/// <name>
/// <element> <node> <node> <value|external>    (one per element)
/// .ic <node>=<value>                          (zero or more)
/// .tran <step> <duration> uic | .dc <source> <start> <stop>
/// .end
/// ```
///
/// Elements serialized as `external` have a waveform table registered
/// under their lower-cased name; the simulation driver answers the
/// engine's boundary-value callbacks from that map.
#[derive(Debug, Clone, Default)]
pub struct Netlist {
    name: String,
    elements: Vec<String>,
    element_names: BTreeSet<String>,
    node_names: BTreeSet<String>,
    initial_conditions: Vec<String>,
    analysis: Option<Analysis>,
    boundary_conditions: HashMap<String, WaveformTable>,
    filename: Option<PathBuf>,
}

impl Netlist {
    pub fn new(name: &str) -> Self {
        Netlist {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Append an element line with a literal value. Name uniqueness and
    /// value presence are the compiler's responsibility; this is the
    /// raw assembly step.
    pub fn add_element(&mut self, name: &str, node_in: usize, node_out: usize, value: &str) {
        self.push_line(name, node_in, node_out, value);
    }

    /// Append an element line serialized as `external` and register its
    /// waveform table under the lower-cased element name.
    pub fn add_external_element(
        &mut self,
        name: &str,
        node_in: usize,
        node_out: usize,
        table: WaveformTable,
    ) {
        self.push_line(name, node_in, node_out, "external");
        self.boundary_conditions.insert(name.to_lowercase(), table);
    }

    fn push_line(&mut self, name: &str, node_in: usize, node_out: usize, value: &str) {
        self.elements
            .push(format!("{} {} {} {}", name, node_in, node_out, value));
        self.element_names.insert(name.to_string());
        self.node_names.insert(node_in.to_string());
        self.node_names.insert(node_out.to_string());
    }

    pub fn add_initial_condition(&mut self, node: &str, value: f64) {
        self.initial_conditions
            .push(format!(".ic {}={}", node, value));
    }

    pub fn set_analysis(&mut self, analysis: Analysis) {
        self.analysis = Some(analysis);
    }

    /// A netlist is executable once it carries an analysis directive
    /// (the `.end` terminator is emitted together with it).
    pub fn is_complete(&self) -> bool {
        self.analysis.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_names(&self) -> &BTreeSet<String> {
        &self.element_names
    }

    pub fn node_names(&self) -> &BTreeSet<String> {
        &self.node_names
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn boundary_conditions(&self) -> &HashMap<String, WaveformTable> {
        &self.boundary_conditions
    }

    /// Boundary value for the engine's data-request callback. The name
    /// arrives in whatever case the engine stores it; keys are
    /// lower-cased at registration.
    pub fn boundary_value(&self, name: &str, t: f64) -> Option<f64> {
        self.boundary_conditions
            .get(&name.to_lowercase())
            .map(|table| table.lookup(t))
    }

    /// The full textual form, in execution order.
    pub fn to_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.elements.len() + 4);
        lines.push(self.name.clone());
        lines.extend(self.elements.iter().cloned());
        lines.extend(self.initial_conditions.iter().cloned());
        if let Some(analysis) = &self.analysis {
            lines.push(analysis.to_string());
            lines.push(".end".to_string());
        }
        lines
    }

    pub fn write_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), NetlistError> {
        let path = path.as_ref();
        let text = self.to_lines().join("\n") + "\n";
        fs::write(path, text).map_err(|source| NetlistError::Io {
            path: path.display().to_string(),
            source,
        })?;
        info!("netlist '{}' written to {}", self.name, path.display());
        self.filename = Some(path.to_path_buf());
        Ok(())
    }

    /// Append initial conditions, the analysis directive and the
    /// terminator to a file that already holds the name and element
    /// lines (the save-then-simulate-later workflow).
    pub fn append_run_controls<P: AsRef<Path>>(&mut self, path: P) -> Result<(), NetlistError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|source| NetlistError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let mut tail = String::new();
        for ic in &self.initial_conditions {
            tail.push_str(ic);
            tail.push('\n');
        }
        if let Some(analysis) = &self.analysis {
            tail.push_str(&analysis.to_string());
            tail.push_str("\n.end\n");
        }
        file.write_all(tail.as_bytes())
            .map_err(|source| NetlistError::Io {
                path: path.display().to_string(),
                source,
            })?;
        self.filename = Some(path.to_path_buf());
        Ok(())
    }

    /// Load an externally supplied netlist file.
    ///
    /// Element lines carrying `external` resolve their waveform table
    /// from `bc_files` by element name; `period` applies to every
    /// resolved table (absent, the period is inferred from the file).
    pub fn load_from_file<P: AsRef<Path>>(
        path: P,
        bc_files: &HashMap<String, PathBuf>,
        period: Option<f64>,
    ) -> Result<Self, NetlistError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| NetlistError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut lines = content.lines().enumerate();
        let name = lines
            .next()
            .map(|(_, l)| l.trim().to_string())
            .unwrap_or_default();
        let mut netlist = Netlist::new(&name);

        for (lineno, raw) in lines {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('*') || line == ".end" {
                continue;
            }
            if line.starts_with('.') {
                if line.starts_with(".ic") {
                    netlist.initial_conditions.push(line.to_string());
                } else if let Some(analysis) = Analysis::parse(line) {
                    netlist.analysis = Some(analysis);
                } else {
                    return Err(NetlistError::Format {
                        line: lineno + 1,
                        reason: format!("unrecognized directive '{}'", line),
                    });
                }
                continue;
            }

            let caps = ELEMENT_LINE_PATTERN.captures(line).ok_or_else(|| {
                NetlistError::Format {
                    line: lineno + 1,
                    reason: "expected '<name> <node> <node> <value>'".to_string(),
                }
            })?;
            let elem_name = &caps[1];
            netlist.elements.push(line.to_string());
            netlist.element_names.insert(elem_name.to_string());
            netlist.node_names.insert(caps[2].to_string());
            netlist.node_names.insert(caps[3].to_string());

            if &caps[4] == "external" {
                let file = bc_files.get(elem_name).ok_or_else(|| {
                    NetlistError::MissingBoundaryCondition(elem_name.to_string())
                })?;
                let table = match period {
                    Some(p) => WaveformTable::from_file_with_period(file, p)?,
                    None => WaveformTable::from_file(file)?,
                };
                debug!("boundary condition for '{}' from {}", elem_name, file.display());
                netlist
                    .boundary_conditions
                    .insert(elem_name.to_lowercase(), table);
            }
        }

        netlist.filename = Some(path.to_path_buf());
        Ok(netlist)
    }

    /// Scan a netlist file for the node names its element lines
    /// reference, skipping the title, comments and directives. Used to
    /// offer initial-condition targets for an external netlist.
    pub fn parse_nodes_from_file<P: AsRef<Path>>(
        path: P,
    ) -> Result<BTreeSet<String>, NetlistError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| NetlistError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut nodes = BTreeSet::new();
        for line in content.lines().skip(1) {
            let line = line.trim();
            if line.starts_with('.') || line.starts_with('*') {
                continue;
            }
            if let Some(caps) = ELEMENT_LINE_PATTERN.captures(line) {
                nodes.insert(caps[2].to_string());
                nodes.insert(caps[3].to_string());
            }
        }
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    #[test]
    fn test_unit_prefix_roundtrip() {
        assert_eq!(UnitPrefix::from_symbol("µ"), Some(UnitPrefix::Micro));
        assert_eq!(UnitPrefix::from_symbol("u"), Some(UnitPrefix::Micro));
        // micro always serializes as ASCII
        assert_eq!(UnitPrefix::Micro.symbol(), "u");
        assert_eq!(UnitPrefix::Kilo.scale(), 1e3);
    }

    #[test]
    fn test_parse_and_format_quantity() {
        assert_eq!(parse_quantity("2.5u").unwrap(), 2.5e-6);
        assert_eq!(parse_quantity("10K").unwrap(), 1e4);
        assert_eq!(parse_quantity("3"), Some(3.0));
        assert_eq!(parse_quantity("1µ").unwrap(), 1e-6);
        assert!(parse_quantity("abc").is_none());

        assert_eq!(format_quantity(0.0025), "2.5m");
        assert_eq!(format_quantity(1e-6), "1u");
        assert_eq!(format_quantity(0.0), "0");
        assert_eq!(format_quantity(1500.0), "1.5K");
    }

    #[test]
    fn test_analysis_display() {
        let tran = Analysis::Tran {
            step: 1e-3,
            duration: 10.0,
            uic: true,
        };
        assert_eq!(tran.to_string(), ".tran 1m 10 uic");

        let dc = Analysis::Dc {
            source: "V1".to_string(),
            start: 0.0,
            stop: 5.0,
        };
        assert_eq!(dc.to_string(), ".dc V1 0 5");
    }

    #[test]
    fn test_analysis_parse() {
        assert_eq!(
            Analysis::parse(".tran 1m 10 uic"),
            Some(Analysis::Tran {
                step: 1e-3,
                duration: 10.0,
                uic: true
            })
        );
        assert_eq!(
            Analysis::parse(".dc V1 0 5"),
            Some(Analysis::Dc {
                source: "V1".to_string(),
                start: 0.0,
                stop: 5.0
            })
        );
        assert!(Analysis::parse(".op").is_none());
    }

    #[test]
    fn test_netlist_text_layout() {
        let mut netlist = Netlist::new("heart model");
        netlist.add_element("R1", 1, 2, "100");
        netlist.add_element("C1", 2, 0, "2.5u");
        netlist.add_initial_condition("2", 0.5);
        assert!(!netlist.is_complete());
        netlist.set_analysis(Analysis::Tran {
            step: 1e-3,
            duration: 2.0,
            uic: true,
        });
        assert!(netlist.is_complete());

        let lines = netlist.to_lines();
        assert_eq!(
            lines,
            vec![
                "heart model",
                "R1 1 2 100",
                "C1 2 0 2.5u",
                ".ic 2=0.5",
                ".tran 1m 2 uic",
                ".end",
            ]
        );
    }

    #[test]
    fn test_incomplete_netlist_has_no_terminator() {
        let mut netlist = Netlist::new("partial");
        netlist.add_element("R1", 1, 0, "10");
        let lines = netlist.to_lines();
        assert!(!lines.contains(&".end".to_string()));
    }

    #[test]
    fn test_load_from_file_with_external_element() {
        let mut bc = NamedTempFile::new().unwrap();
        writeln!(bc, "0.0 0.0").unwrap();
        writeln!(bc, "0.5 1.0").unwrap();
        writeln!(bc, "1.0 0.0").unwrap();

        let mut cir = NamedTempFile::new().unwrap();
        writeln!(cir, "aorta").unwrap();
        writeln!(cir, "V1 1 0 external").unwrap();
        writeln!(cir, "R1 1 2 100").unwrap();
        writeln!(cir, "C1 2 0 2.5u").unwrap();
        writeln!(cir, ".tran 1m 10 uic").unwrap();
        writeln!(cir, ".end").unwrap();

        let mut bc_files = HashMap::new();
        bc_files.insert("V1".to_string(), bc.path().to_path_buf());

        let netlist = Netlist::load_from_file(cir.path(), &bc_files, Some(1.0)).unwrap();
        assert!(netlist.is_complete());
        assert_eq!(netlist.element_names().len(), 3);
        assert!(netlist.boundary_value("v1", 0.25).is_some());
        assert_eq!(netlist.boundary_value("v1", 0.5), Some(1.0));
    }

    #[test]
    fn test_load_from_file_missing_bc() {
        let mut cir = NamedTempFile::new().unwrap();
        writeln!(cir, "aorta").unwrap();
        writeln!(cir, "V1 1 0 external").unwrap();
        let err = Netlist::load_from_file(cir.path(), &HashMap::new(), None).unwrap_err();
        assert!(matches!(err, NetlistError::MissingBoundaryCondition(name) if name == "V1"));
    }

    #[test]
    fn test_load_from_file_malformed_element() {
        let mut cir = NamedTempFile::new().unwrap();
        writeln!(cir, "bad").unwrap();
        writeln!(cir, "R1 1").unwrap();
        let err = Netlist::load_from_file(cir.path(), &HashMap::new(), None).unwrap_err();
        assert!(matches!(err, NetlistError::Format { line: 2, .. }));
    }

    #[test]
    fn test_parse_nodes_from_file() {
        let mut cir = NamedTempFile::new().unwrap();
        writeln!(cir, "title line").unwrap();
        writeln!(cir, "R1 1 2 100").unwrap();
        writeln!(cir, "C1 2 0 1u").unwrap();
        writeln!(cir, ".tran 1m 1 uic").unwrap();
        let nodes = Netlist::parse_nodes_from_file(cir.path()).unwrap();
        assert_eq!(
            nodes,
            BTreeSet::from(["0".to_string(), "1".to_string(), "2".to_string()])
        );
    }

    #[test]
    fn test_write_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.cir");

        let mut netlist = Netlist::new("staged");
        netlist.add_element("R1", 1, 0, "50");
        netlist.write_to_file(&path).unwrap();

        netlist.set_analysis(Analysis::Dc {
            source: "V1".to_string(),
            start: 0.0,
            stop: 1.0,
        });
        netlist.append_run_controls(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("staged\nR1 1 0 50\n"));
        assert!(text.contains(".dc V1 0 1"));
        assert!(text.trim_end().ends_with(".end"));
    }
}

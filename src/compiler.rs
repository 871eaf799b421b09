use std::collections::{BTreeSet, HashMap, VecDeque};

use log::{debug, info};

use crate::error::CompileError;
use crate::graph::{Element, ElementId, ElementKind, ElementValue, NodeId, TopologyGraph};
use crate::netlist::Netlist;
use crate::waveform::WaveformTable;

/// Compile a topology graph into an ordered netlist.
///
/// Numbering starts at ground: every ground terminal and everything
/// wired to it becomes electrical node 0, then a breadth-first walk
/// through the elements assigns 1, 2, ... to each electrical node in
/// discovery order. The walk doubles as the reachability check, so a
/// fixed diagram always produces the same numbering.
///
/// Elements carrying an external time series have their waveform table
/// loaded here and registered on the netlist; `period` overrides the
/// period inferred from each file.
pub fn compile(
    graph: &TopologyGraph,
    name: &str,
    period: Option<f64>,
) -> Result<Netlist, CompileError> {
    check_elements(graph)?;

    let grounds: Vec<NodeId> = graph
        .elements()
        .filter(|e| e.kind() == ElementKind::Ground)
        .map(|e| e.terminals()[0])
        .collect();
    if grounds.is_empty() {
        return Err(CompileError::NoStart);
    }

    // Electrical node numbers per graph node. Ground terminals and
    // everything transitively wired to them are node 0.
    let mut numbers: HashMap<NodeId, usize> = HashMap::new();
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    for g in grounds {
        if assign(graph, &mut numbers, g, 0) {
            queue.push_back(g);
        }
    }

    let mut next = 1;
    let mut visited: BTreeSet<ElementId> = BTreeSet::new();
    let mut emit_order: Vec<ElementId> = Vec::new();
    while let Some(seed) = queue.pop_front() {
        for member in electrical_node(graph, seed) {
            let Some(elem) = graph.node(member).and_then(|n| n.element()) else {
                continue;
            };
            let Some(elem) = graph.element(elem) else {
                continue;
            };
            if elem.kind() == ElementKind::Ground || !visited.insert(elem.id()) {
                continue;
            }
            emit_order.push(elem.id());
            if let Some(other) = elem.other_terminal(member) {
                if assign(graph, &mut numbers, other, next) {
                    queue.push_back(other);
                    next += 1;
                }
            }
        }
    }

    // Anything placed but never reached cannot be numbered.
    for elem in graph.elements() {
        if elem.kind() != ElementKind::Ground && !visited.contains(&elem.id()) {
            return Err(CompileError::Incomplete(elem.name()));
        }
    }
    for node in graph.nodes() {
        if node.element().is_none() && !numbers.contains_key(&node.id()) {
            return Err(CompileError::Incomplete("a free junction".to_string()));
        }
    }

    let mut netlist = Netlist::new(name);
    for id in emit_order {
        let elem = graph.element(id).unwrap();
        let (node_in, node_out) = terminal_numbers(elem, &numbers);
        emit(&mut netlist, elem, node_in, node_out, period)?;
    }
    info!(
        "compiled '{}': {} elements, {} electrical nodes",
        name,
        netlist.element_names().len(),
        next
    );
    Ok(netlist)
}

/// Pre-pass over every placed element: names present and unique, values
/// assigned. Runs before traversal so a diagram with several problems
/// reports the naming ones first.
fn check_elements(graph: &TopologyGraph) -> Result<(), CompileError> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for elem in graph.elements() {
        if elem.kind() == ElementKind::Ground {
            continue;
        }
        if elem.label().is_empty() {
            return Err(CompileError::NoName(elem.kind().describe().to_string()));
        }
        if !elem.value().is_set() {
            return Err(CompileError::NoValue(elem.name()));
        }
        if !seen.insert(elem.name().to_lowercase()) {
            return Err(CompileError::DuplicateName(elem.name()));
        }
    }
    Ok(())
}

/// Number `seed` and its whole electrical node. Returns false if the
/// node was numbered already.
fn assign(
    graph: &TopologyGraph,
    numbers: &mut HashMap<NodeId, usize>,
    seed: NodeId,
    number: usize,
) -> bool {
    if numbers.contains_key(&seed) {
        return false;
    }
    for member in electrical_node(graph, seed) {
        numbers.insert(member, number);
    }
    debug!("electrical node {} seeded at {:?}", number, seed);
    true
}

/// The full electrical node containing `seed`: the seed plus its
/// transitive wire connectivity, in handle order.
fn electrical_node(graph: &TopologyGraph, seed: NodeId) -> Vec<NodeId> {
    let mut members = vec![seed];
    if let Some(component) = graph.connected_component(seed) {
        members.extend(component.iter().copied());
    }
    members.sort();
    members
}

fn terminal_numbers(elem: &Element, numbers: &HashMap<NodeId, usize>) -> (usize, usize) {
    let terminals = elem.terminals();
    let node_in = numbers.get(&terminals[0]).copied().unwrap_or(0);
    let node_out = numbers.get(&terminals[1]).copied().unwrap_or(0);
    // The engine expects a pressure source's reference terminal on the
    // ground side, so a source wired ground-first is flipped.
    if elem.kind() == ElementKind::PressureSource && node_in == 0 {
        (node_out, node_in)
    } else {
        (node_in, node_out)
    }
}

fn emit(
    netlist: &mut Netlist,
    elem: &Element,
    node_in: usize,
    node_out: usize,
    period: Option<f64>,
) -> Result<(), CompileError> {
    match elem.value() {
        ElementValue::Literal { .. } => {
            // literal_text is always Some for a Literal
            let text = elem.value().literal_text().unwrap_or_default();
            netlist.add_element(&elem.name(), node_in, node_out, &text);
        }
        ElementValue::External(path) => {
            let table = match period {
                Some(p) => WaveformTable::from_file_with_period(path, p)?,
                None => WaveformTable::from_file(path)?,
            };
            netlist.add_external_element(&elem.name(), node_in, node_out, table);
        }
        // check_elements rejected unset values already
        ElementValue::Unset => {}
    }
    Ok(())
}

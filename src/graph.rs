use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::netlist::UnitPrefix;

/// Horizontal distance from an element's center to each of its
/// terminals, in scene units. Matches the editor's element footprint.
const TERMINAL_OFFSET: f64 = 30.0;

/// Stable handle into the graph's node arena. Handles are never reused
/// within one graph, so a stale handle after removal can only miss, not
/// alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(usize);

/// Stable handle into the graph's element arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId(usize);

/// The closed set of component kinds the editor can place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Resistor,
    Capacitor,
    Inductor,
    Ground,
    PressureSource,
    FlowSource,
}

impl ElementKind {
    /// The engine's prefix character for serialized element names.
    /// Pressure and flow sources map onto the engine's voltage/current
    /// source prefixes.
    pub fn prefix(self) -> char {
        match self {
            ElementKind::Resistor => 'R',
            ElementKind::Capacitor => 'C',
            ElementKind::Inductor => 'L',
            ElementKind::Ground => 'G',
            ElementKind::PressureSource => 'V',
            ElementKind::FlowSource => 'I',
        }
    }

    /// Ground is a labeled single-terminal reference; everything else
    /// is a two-terminal component.
    pub fn terminal_count(self) -> usize {
        match self {
            ElementKind::Ground => 1,
            _ => 2,
        }
    }

    /// Kinds whose value may be a time series from an external file.
    pub fn accepts_external(self) -> bool {
        matches!(
            self,
            ElementKind::Resistor
                | ElementKind::Capacitor
                | ElementKind::PressureSource
                | ElementKind::FlowSource
        )
    }

    pub fn is_source(self) -> bool {
        matches!(self, ElementKind::PressureSource | ElementKind::FlowSource)
    }

    pub fn describe(self) -> &'static str {
        match self {
            ElementKind::Resistor => "resistor",
            ElementKind::Capacitor => "capacitor",
            ElementKind::Inductor => "inductor",
            ElementKind::Ground => "ground",
            ElementKind::PressureSource => "pressure source",
            ElementKind::FlowSource => "flow source",
        }
    }
}

/// An element's value: a literal magnitude with unit prefix, a
/// reference to an external time-series file, or not yet assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementValue {
    Unset,
    Literal { magnitude: f64, prefix: UnitPrefix },
    External(PathBuf),
}

impl ElementValue {
    /// Parse a literal such as `100`, `2.5u` or `10K`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let last = text.chars().last()?;
        if !last.is_ascii_digit() {
            let (num, suffix) = text.split_at(text.len() - last.len_utf8());
            let prefix = UnitPrefix::from_symbol(suffix)?;
            let magnitude = num.trim().parse().ok()?;
            return Some(ElementValue::Literal { magnitude, prefix });
        }
        text.parse()
            .ok()
            .map(|magnitude| ElementValue::Literal {
                magnitude,
                prefix: UnitPrefix::None,
            })
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, ElementValue::Unset)
    }

    /// Netlist text for a literal value, e.g. `2.5u`.
    pub fn literal_text(&self) -> Option<String> {
        match self {
            ElementValue::Literal { magnitude, prefix } => {
                Some(format!("{}{}", magnitude, prefix.symbol()))
            }
            _ => None,
        }
    }
}

/// A placed component: kind, user label, value and terminal nodes.
#[derive(Debug, Clone)]
pub struct Element {
    id: ElementId,
    kind: ElementKind,
    label: String,
    value: ElementValue,
    terminals: Vec<NodeId>,
}

impl Element {
    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The serialized name: prefix character plus user label.
    pub fn name(&self) -> String {
        format!("{}{}", self.kind.prefix(), self.label)
    }

    pub fn value(&self) -> &ElementValue {
        &self.value
    }

    pub fn terminals(&self) -> &[NodeId] {
        &self.terminals
    }

    /// The terminal opposite the given one, if the node belongs to this
    /// element.
    pub fn other_terminal(&self, node: NodeId) -> Option<NodeId> {
        match self.terminals.as_slice() {
            [a, b] if *a == node => Some(*b),
            [a, b] if *b == node => Some(*a),
            _ => None,
        }
    }
}

/// An electrical connection point: an element terminal or a free wire
/// junction.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    element: Option<ElementId>,
    pos: (f64, f64),
    direct: BTreeSet<NodeId>,
    reachable: BTreeSet<NodeId>,
    // Wire legs this node is responsible for drawing, split by
    // orientation. Irrelevant to simulation, but the ownership decision
    // must be deterministic and symmetric.
    horizontal_legs: BTreeSet<NodeId>,
    vertical_legs: BTreeSet<NodeId>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn element(&self) -> Option<ElementId> {
        self.element
    }

    pub fn pos(&self) -> (f64, f64) {
        self.pos
    }

    pub fn direct_links(&self) -> &BTreeSet<NodeId> {
        &self.direct
    }

    pub fn owns_horizontal_leg_to(&self, other: NodeId) -> bool {
        self.horizontal_legs.contains(&other)
    }

    pub fn owns_vertical_leg_to(&self, other: NodeId) -> bool {
        self.vertical_legs.contains(&other)
    }
}

/// The freely-drawn circuit: node and element arenas plus connectivity.
///
/// Adjacency is stored as handle sets, so removing a node is "erase the
/// handle from every neighbor set" rather than chasing live references.
/// Each node additionally carries its transitive connectivity set,
/// maintained eagerly on every link add/remove; `connected_component`
/// is therefore O(1).
#[derive(Debug, Default)]
pub struct TopologyGraph {
    nodes: Vec<Option<Node>>,
    elements: Vec<Option<Element>>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        TopologyGraph::default()
    }

    /// Place an element at `pos`. Its terminal nodes are created with
    /// it, spread horizontally around the center.
    pub fn add_element(
        &mut self,
        kind: ElementKind,
        label: &str,
        value: ElementValue,
        pos: (f64, f64),
    ) -> ElementId {
        let id = ElementId(self.elements.len());
        self.elements.push(None);
        let terminals = self.alloc_terminals(id, kind, pos);
        self.elements[id.0] = Some(Element {
            id,
            kind,
            label: label.to_string(),
            value,
            terminals,
        });
        debug!("placed {} '{}'", kind.describe(), label);
        id
    }

    fn alloc_terminals(
        &mut self,
        owner: ElementId,
        kind: ElementKind,
        pos: (f64, f64),
    ) -> Vec<NodeId> {
        match kind.terminal_count() {
            1 => vec![self.alloc_node(Some(owner), pos)],
            _ => vec![
                self.alloc_node(Some(owner), (pos.0 - TERMINAL_OFFSET, pos.1)),
                self.alloc_node(Some(owner), (pos.0 + TERMINAL_OFFSET, pos.1)),
            ],
        }
    }

    /// Place a free wire junction.
    pub fn add_junction(&mut self, pos: (f64, f64)) -> NodeId {
        self.alloc_node(None, pos)
    }

    fn alloc_node(&mut self, element: Option<ElementId>, pos: (f64, f64)) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(Node {
            id,
            element,
            pos,
            direct: BTreeSet::new(),
            reachable: BTreeSet::new(),
            horizontal_legs: BTreeSet::new(),
            vertical_legs: BTreeSet::new(),
        }));
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(id.0).and_then(Option::as_ref)
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().flatten()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    pub fn element_count(&self) -> usize {
        self.elements.iter().flatten().count()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn set_value(&mut self, id: ElementId, value: ElementValue) {
        if let Some(elem) = self.elements.get_mut(id.0).and_then(Option::as_mut) {
            elem.value = value;
        }
    }

    fn node_ref(&self, id: NodeId) -> &Node {
        self.nodes[id.0].as_ref().unwrap()
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0].as_mut().unwrap()
    }

    /// Draw a wire between two nodes.
    ///
    /// One side of the pair owns the horizontal leg of the rendered
    /// wire and the other the vertical leg: the node further left owns
    /// the horizontal leg, ties broken by the upper node, then by the
    /// older handle. The rule carries no simulation meaning but must be
    /// deterministic and symmetric.
    ///
    /// Both transitive sets are unioned across the merged component.
    /// Connecting two nodes already in one component just records a
    /// redundant direct edge.
    pub fn connect(&mut self, a: NodeId, b: NodeId) {
        if a == b || self.node(a).is_none() || self.node(b).is_none() {
            return;
        }

        let pa = self.node_ref(a).pos;
        let pb = self.node_ref(b).pos;
        let a_owns_horizontal = (pa.0, pa.1, a) < (pb.0, pb.1, b);

        {
            let node_a = self.node_mut(a);
            node_a.direct.insert(b);
            if a_owns_horizontal {
                node_a.horizontal_legs.insert(b);
            } else {
                node_a.vertical_legs.insert(b);
            }
        }
        {
            let node_b = self.node_mut(b);
            node_b.direct.insert(a);
            if a_owns_horizontal {
                node_b.vertical_legs.insert(a);
            } else {
                node_b.horizontal_legs.insert(a);
            }
        }

        // Union the two transitive sets onto every member of the merged
        // component. A node never appears in its own set.
        let mut merged: BTreeSet<NodeId> = self.node_ref(a).reachable.clone();
        merged.extend(self.node_ref(b).reachable.iter().copied());
        merged.insert(a);
        merged.insert(b);
        for member in merged.clone() {
            let mut set = merged.clone();
            set.remove(&member);
            self.node_mut(member).reachable = set;
        }
    }

    /// Remove the direct wire between two nodes. Must be called for
    /// every wire before either endpoint is destroyed. Splits the
    /// transitive component if no alternate path remains.
    pub fn disconnect(&mut self, a: NodeId, b: NodeId) {
        if self.node(a).is_none() || self.node(b).is_none() {
            return;
        }
        {
            let node_a = self.node_mut(a);
            node_a.direct.remove(&b);
            node_a.horizontal_legs.remove(&b);
            node_a.vertical_legs.remove(&b);
        }
        {
            let node_b = self.node_mut(b);
            node_b.direct.remove(&a);
            node_b.horizontal_legs.remove(&a);
            node_b.vertical_legs.remove(&a);
        }

        self.rebuild_component(a);
        if !self.node_ref(a).reachable.contains(&b) {
            self.rebuild_component(b);
        }
    }

    /// The transitive connectivity set of `n`: every node reachable
    /// through any chain of direct links, excluding `n` itself.
    /// Precomputed, so this is a plain lookup.
    pub fn connected_component(&self, n: NodeId) -> Option<&BTreeSet<NodeId>> {
        self.node(n).map(|node| &node.reachable)
    }

    /// Destroy a node, detaching it from every partner's direct and
    /// transitive sets first so no dangling handle survives.
    pub fn remove_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        for peer in &node.direct {
            let peer_node = self.node_mut(*peer);
            peer_node.direct.remove(&id);
            peer_node.horizontal_legs.remove(&id);
            peer_node.vertical_legs.remove(&id);
        }
        // The former neighbors may now fall into separate components.
        let mut seen: BTreeSet<NodeId> = BTreeSet::new();
        for peer in &node.direct {
            if !seen.contains(peer) {
                seen.extend(self.rebuild_component(*peer));
            }
        }
    }

    /// Destroy an element and both of its terminal nodes.
    pub fn remove_element(&mut self, id: ElementId) {
        let Some(elem) = self.elements.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        for terminal in elem.terminals {
            self.remove_node(terminal);
        }
        debug!("removed {} '{}'", elem.kind.describe(), elem.label);
    }

    /// Rotate an element. Rotation tears down the terminal nodes and
    /// recreates them at swapped positions, so any wires attached to
    /// the old terminals are gone afterwards, exactly as when the
    /// element is deleted and re-placed.
    pub fn rotate_element(&mut self, id: ElementId) {
        let Some(elem) = self.element(id) else {
            return;
        };
        let kind = elem.kind;
        let old: Vec<NodeId> = elem.terminals.to_vec();
        let mut positions: Vec<(f64, f64)> = old.iter().map(|n| self.node_ref(*n).pos).collect();
        positions.reverse();

        for terminal in &old {
            self.remove_node(*terminal);
        }
        let fresh: Vec<NodeId> = positions
            .into_iter()
            .map(|pos| self.alloc_node(Some(id), pos))
            .collect();
        if let Some(elem) = self.elements.get_mut(id.0).and_then(Option::as_mut) {
            elem.terminals = fresh;
        }
        debug!("rotated {} terminals", kind.describe());
    }

    /// Flood the direct-link relation from `seed` and install the
    /// resulting set (minus each member) as every member's transitive
    /// set. Returns the component.
    fn rebuild_component(&mut self, seed: NodeId) -> BTreeSet<NodeId> {
        let mut component = BTreeSet::new();
        let mut queue = VecDeque::from([seed]);
        while let Some(n) = queue.pop_front() {
            if !component.insert(n) {
                continue;
            }
            for peer in &self.node_ref(n).direct {
                if !component.contains(peer) {
                    queue.push_back(*peer);
                }
            }
        }
        for member in component.clone() {
            let mut set = component.clone();
            set.remove(&member);
            self.node_mut(member).reachable = set;
        }
        component
    }
}

/// The plain-data circuit handed over by the editor layer: elements,
/// free junctions and wires between them, with no widget state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitDescription {
    pub name: String,
    #[serde(default)]
    pub elements: Vec<ElementSpec>,
    #[serde(default)]
    pub junctions: Vec<JunctionSpec>,
    #[serde(default)]
    pub wires: Vec<(WireEnd, WireEnd)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementSpec {
    pub kind: ElementKind,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub external: Option<PathBuf>,
    #[serde(default)]
    pub pos: (f64, f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JunctionSpec {
    pub pos: (f64, f64),
}

/// One end of a wire in the plain-data form: an element terminal or a
/// free junction, by index into the respective list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireEnd {
    Terminal { element: usize, terminal: usize },
    Junction { junction: usize },
}

impl CircuitDescription {
    /// Lower the plain-data description into a live topology graph.
    pub fn build_graph(&self) -> Result<TopologyGraph> {
        let mut graph = TopologyGraph::new();

        let mut element_ids = Vec::with_capacity(self.elements.len());
        for spec in &self.elements {
            let value = match (&spec.external, &spec.value) {
                (Some(path), _) => {
                    if !spec.kind.accepts_external() {
                        return Err(anyhow!(
                            "a {} cannot take external input",
                            spec.kind.describe()
                        ));
                    }
                    ElementValue::External(path.clone())
                }
                (None, Some(text)) => ElementValue::parse(text)
                    .ok_or_else(|| anyhow!("bad value '{}' for '{}'", text, spec.label))?,
                (None, None) => ElementValue::Unset,
            };
            element_ids.push(graph.add_element(spec.kind, &spec.label, value, spec.pos));
        }

        let junction_ids: Vec<NodeId> = self
            .junctions
            .iter()
            .map(|j| graph.add_junction(j.pos))
            .collect();

        for (from, to) in &self.wires {
            let a = self.resolve_end(&graph, &element_ids, &junction_ids, *from)?;
            let b = self.resolve_end(&graph, &element_ids, &junction_ids, *to)?;
            graph.connect(a, b);
        }
        Ok(graph)
    }

    fn resolve_end(
        &self,
        graph: &TopologyGraph,
        elements: &[ElementId],
        junctions: &[NodeId],
        end: WireEnd,
    ) -> Result<NodeId> {
        match end {
            WireEnd::Terminal { element, terminal } => {
                let id = elements
                    .get(element)
                    .ok_or_else(|| anyhow!("wire references element {}", element))?;
                graph
                    .element(*id)
                    .and_then(|e| e.terminals().get(terminal).copied())
                    .ok_or_else(|| anyhow!("element {} has no terminal {}", element, terminal))
            }
            WireEnd::Junction { junction } => junctions
                .get(junction)
                .copied()
                .ok_or_else(|| anyhow!("wire references junction {}", junction)),
        }
    }
}

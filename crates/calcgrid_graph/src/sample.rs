//! Small reference graphs.
//!
//! Used by the command line `sample` subcommand and throughout the test
//! suites. Source nodes invoke `seed`; every other node invokes `sum`.

use crate::builder::GraphBuilder;
use crate::graph::Graph;
use calcgrid_core::ValueId;

const NO_INPUTS: [&str; 0] = [];

/// Five nodes where N2 fans out to N0, N1 and N4, and N3 also feeds N4.
///
/// ```text
///  N2 ──a──▶ N0
///   ├──b──▶ N1
///   └──c──▶ N4 ◀── N3
/// ```
///
/// Terminal outputs are `N0.out`, `N1.out` and `N4.out`.
#[must_use]
pub fn fan_out_graph() -> Graph {
    let mut b = GraphBuilder::new("fan-out");
    b.add_node("sum", ["N2.a"], ["N0.out"]);
    b.add_node("sum", ["N2.b"], ["N1.out"]);
    b.add_node("seed", NO_INPUTS, ["N2.a", "N2.b", "N2.c"]);
    b.add_node("seed", NO_INPUTS, ["N3.out"]);
    b.add_node("sum", ["N2.c", "N3.out"], ["N4.out"]);
    b.add_terminal_output("R0", "N0.out");
    b.add_terminal_output("R1", "N1.out");
    b.add_terminal_output("R4", "N4.out");
    finish(b)
}

/// One ancestor feeding three chains of length 2, 2 and 3.
///
/// ```text
///      ┌─▶ B1 ─▶ C1
///  A ──┼─▶ B2 ─▶ C2
///      └─▶ B3 ─▶ C3 ─▶ D3
/// ```
///
/// Node ids: A=N0, B1=N1, C1=N2, B2=N3, C2=N4, B3=N5, C3=N6, D3=N7.
#[must_use]
pub fn chains_graph() -> Graph {
    let mut b = GraphBuilder::new("chains");
    b.add_node("seed", NO_INPUTS, ["A"]);
    b.add_node("sum", ["A"], ["B1"]);
    b.add_node("sum", ["B1"], ["C1"]);
    b.add_node("sum", ["A"], ["B2"]);
    b.add_node("sum", ["B2"], ["C2"]);
    b.add_node("sum", ["A"], ["B3"]);
    b.add_node("sum", ["B3"], ["C3"]);
    b.add_node("sum", ["C3"], ["D3"]);
    for value in ["C1", "C2", "D3"] {
        b.add_terminal_output(value, ValueId::from(value));
    }
    finish(b)
}

/// Look up a sample graph by name
#[must_use]
pub fn by_name(name: &str) -> Option<Graph> {
    match name {
        "fan-out" => Some(fan_out_graph()),
        "chains" => Some(chains_graph()),
        _ => None,
    }
}

/// Names accepted by [`by_name`]
pub const NAMES: [&str; 2] = ["fan-out", "chains"];

fn finish(builder: GraphBuilder) -> Graph {
    match builder.build() {
        Ok(graph) => graph,
        Err(e) => unreachable!("sample graph is well formed: {e}"),
    }
}

// Stage tracing and counters. Every method compilation owns its trace privately, so no
// locking is involved; the assembly driver collects traces at commit time. Dumps use the
// "Block #<n>" / "L_XXXX" framing that the explorer UI slices on.

use std::collections::HashMap;
use std::fmt;

use crate::core::graph::{BlockId, InstrGraph};
use crate::core::operand::VirtualRegisters;

/// Selects which stages produce IR dumps.
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    /// None captures nothing; an empty set captures every stage.
    stages: Option<Vec<String>>,
}

impl TraceFilter {
    pub fn none() -> Self {
        Self { stages: None }
    }

    pub fn all() -> Self {
        Self {
            stages: Some(Vec::new()),
        }
    }

    pub fn only<I: IntoIterator<Item = S>, S: Into<String>>(stages: I) -> Self {
        Self {
            stages: Some(stages.into_iter().map(Into::into).collect()),
        }
    }

    pub fn captures(&self, stage: &str) -> bool {
        match &self.stages {
            None => false,
            Some(list) => list.is_empty() || list.iter().any(|s| s == stage),
        }
    }
}

/// Per-method log of stage dumps, keyed by stage name in pipeline order.
#[derive(Debug, Default)]
pub struct MethodTrace {
    pub method: String,
    dumps: Vec<(String, String)>,
}

impl MethodTrace {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            dumps: Vec::new(),
        }
    }

    pub fn record(&mut self, stage: &str, dump: String) {
        self.dumps.push((stage.to_string(), dump));
    }

    pub fn stage_dump(&self, stage: &str) -> Option<&str> {
        self.dumps
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, dump)| dump.as_str())
    }

    pub fn dumps(&self) -> impl Iterator<Item = (&str, &str)> {
        self.dumps.iter().map(|(n, d)| (n.as_str(), d.as_str()))
    }
}

/// Render the block label for dumps.
pub fn block_label(block: BlockId) -> String {
    format!("L_{:04X}", block.0)
}

/// Render the whole graph as a stage dump.
pub fn dump_graph(graph: &InstrGraph, _vregs: &VirtualRegisters) -> String {
    let mut out = String::new();
    for block in graph.block_ids() {
        out.push_str(&format!("Block #{}\n", block.0));
        out.push_str(&format!("{}:\n", block_label(block)));
        for id in graph.block_nodes(block) {
            let node = graph.node(id);
            out.push_str("  ");
            out.push_str(node.opcode.name());
            if let Some(cond) = node.cond {
                out.push_str(&format!(" [{}]", cond.name()));
            }
            for (i, r) in node.results.iter().enumerate() {
                out.push_str(if i == 0 { " " } else { ", " });
                out.push_str(&r.to_string());
            }
            if !node.results.is_empty() && !node.operands.is_empty() {
                out.push_str(" <-");
            }
            for (i, op) in node.operands.iter().enumerate() {
                out.push_str(if i == 0 { " " } else { ", " });
                out.push_str(&op.to_string());
            }
            if let Some(blocks) = &node.phi_blocks {
                out.push_str(" from");
                for (i, b) in blocks.iter().enumerate() {
                    out.push_str(if i == 0 { " " } else { ", " });
                    out.push_str(&block_label(*b));
                }
            }
            for target in &node.targets {
                out.push_str(&format!(" -> {}", block_label(*target)));
            }
            out.push('\n');
        }
    }
    out
}

/// Keyed counter registry, published per stage and merged per assembly.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    values: HashMap<String, i64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, name: &str, count: i64) {
        *self.values.entry(name.to_string()).or_insert(0) += count;
    }

    pub fn get(&self, name: &str) -> i64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &Counters) {
        for (name, count) in &other.values {
            *self.values.entry(name.clone()).or_insert(0) += count;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sorted: Vec<_> = self.values.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (name, count) in sorted {
            writeln!(f, "{name}: {count}")?;
        }
        Ok(())
    }
}

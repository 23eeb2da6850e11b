use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use iced_x86::Mnemonic;
use tracing::trace;

use crate::flo::Flo;
use crate::Address;

/// One decision on an enumerated path: at the jump instruction `jump`,
/// whether the branch is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    pub jump: Address,
    pub take: bool,
}

pub type Path = Vec<PathStep>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Edge {
    src: Address,
    dst: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchKind {
    /// Fallthrough past the last conditional of the group.
    Next,
    Conditional,
    Unconditional,
}

#[derive(Debug, Clone, Copy)]
struct Branch {
    source: Address,
    dst: Address,
    kind: BranchKind,
}

#[derive(Debug)]
struct Node {
    source: Address,
    // branches[0] is the head (Next or Unconditional); the rest are the
    // group's conditionals in source order.
    branches: Vec<Branch>,
}

/// Reduces a flo to its branching skeleton and enumerates a minimal set of
/// paths covering every non-redundant edge at least once, with each loop
/// entered exactly once per path.
pub struct OptimalCoverage {
    nodes: BTreeMap<Address, Node>,
    ends: BTreeSet<Address>,
    order: HashMap<Address, usize>,
    loops: HashSet<Edge>,
    useless: HashSet<Edge>,
    paths: Vec<Path>,
}

impl OptimalCoverage {
    /// `None` when the flo's branch structure cannot be reduced.
    pub fn analyze(flo: &Flo) -> Option<Self> {
        let mut coverage = Self {
            nodes: BTreeMap::new(),
            ends: BTreeSet::new(),
            order: HashMap::new(),
            loops: HashSet::new(),
            useless: HashSet::new(),
            paths: Vec::new(),
        };
        coverage.build_nodes(flo)?;
        coverage.normalize_nodes();
        coverage.top_sort(flo.entry_point);
        coverage.find_loops();
        coverage.find_useless_edges();
        coverage.build_paths(flo.entry_point);
        trace!(
            "coverage for {:#x}: {} nodes, {} loops, {} useless edges, {} paths",
            flo.entry_point,
            coverage.nodes.len(),
            coverage.loops.len(),
            coverage.useless.len(),
            coverage.paths.len()
        );
        Some(coverage)
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    /// Back edges, as (jump source, destination) pairs.
    pub fn loops(&self) -> impl Iterator<Item = (Address, Address)> + '_ {
        self.loops.iter().map(|edge| (edge.src, edge.dst))
    }

    /// Collapses each run of contiguous conditional jumps (optionally closed
    /// by a JMP) into a single node; RETs and jumps out of the flo become
    /// terminal nodes.
    fn build_nodes(&mut self, flo: &Flo) -> Option<()> {
        let disassembly: Vec<(Address, &iced_x86::Instruction)> = flo
            .disassembly()
            .iter()
            .map(|(&address, instruction)| (address, instruction))
            .collect();
        let mut i = 0;
        while i < disassembly.len() {
            let (address, instruction) = disassembly[i];
            if instruction.mnemonic() == Mnemonic::Ret {
                self.nodes.insert(
                    address,
                    Node {
                        source: address,
                        branches: Vec::new(),
                    },
                );
                self.ends.insert(address);
                i += 1;
                continue;
            }
            if !Flo::is_any_jump(instruction) {
                i += 1;
                continue;
            }
            let target = Flo::jump_target(instruction);
            let inside = target.is_some_and(|dst| flo.is_inside(dst));
            if !inside {
                if target.is_none() && Flo::is_conditional_jump(instruction) {
                    // A conditional jump always has a direct target.
                    return None;
                }
                self.nodes.insert(
                    address,
                    Node {
                        source: address,
                        branches: Vec::new(),
                    },
                );
                self.ends.insert(address);
                i += 1;
                continue;
            }

            // Group of contiguous conditional jumps, head prepended last.
            let group_source = address;
            let mut branches = Vec::new();
            let mut next = None;
            while i < disassembly.len() && Flo::is_conditional_jump(disassembly[i].1) {
                let (source, instruction) = disassembly[i];
                let dst = Flo::jump_target(instruction)?;
                if !flo.is_inside(dst) {
                    break;
                }
                branches.push(Branch {
                    source,
                    dst,
                    kind: BranchKind::Conditional,
                });
                next = Some(source + instruction.len());
                i += 1;
            }
            if i < disassembly.len() {
                let (source, instruction) = disassembly[i];
                if instruction.mnemonic() == Mnemonic::Jmp {
                    let head = match Flo::jump_target(instruction) {
                        Some(dst) if flo.is_inside(dst) => Some(Branch {
                            source,
                            dst,
                            kind: BranchKind::Unconditional,
                        }),
                        // The group falls through onto an outgoing jump.
                        _ => next.map(|dst| Branch {
                            source: disassembly[i - 1].0,
                            dst,
                            kind: BranchKind::Next,
                        }),
                    };
                    if let Some(head) = head {
                        branches.insert(0, head);
                    }
                    i += 1;
                } else if let Some(dst) = next {
                    branches.insert(
                        0,
                        Branch {
                            source: disassembly[i - 1].0,
                            dst,
                            kind: BranchKind::Next,
                        },
                    );
                }
            }
            if !branches.is_empty() {
                self.nodes.insert(
                    group_source,
                    Node {
                        source: group_source,
                        branches,
                    },
                );
            }
        }
        Some(())
    }

    /// Snaps every branch destination falling between two nodes onto the
    /// next node at or above it.
    fn normalize_nodes(&mut self) {
        let starts: Vec<Address> = self.nodes.keys().copied().collect();
        for node in self.nodes.values_mut() {
            for branch in &mut node.branches {
                let at = starts.partition_point(|&start| start < branch.dst);
                if at < starts.len() {
                    branch.dst = starts[at];
                }
            }
        }
    }

    /// DFS post-order reversed; nodes unreachable from the entry stay
    /// unordered and are ignored downstream.
    fn top_sort(&mut self, entry_point: Address) {
        if self.nodes.is_empty() {
            return;
        }
        fn dfs(
            nodes: &BTreeMap<Address, Node>,
            visited: &mut HashSet<Address>,
            out: &mut Vec<Address>,
            address: Address,
        ) {
            let node = nodes.range(address..).next().map(|(_, node)| node);
            let address = node.map_or(address, |node| node.source);
            if !visited.insert(address) {
                return;
            }
            if let Some(node) = node {
                for branch in &node.branches {
                    dfs(nodes, visited, out, branch.dst);
                }
            }
            out.push(address);
        }
        let mut visited = HashSet::new();
        let mut post_order = Vec::new();
        dfs(&self.nodes, &mut visited, &mut post_order, entry_point);
        for (index, address) in post_order.into_iter().rev().enumerate() {
            self.order.insert(address, index);
        }
    }

    /// An edge is a back edge iff it does not advance the topological order.
    fn find_loops(&mut self) {
        for node in self.nodes.values() {
            let Some(&src_order) = self.order.get(&node.source) else {
                continue;
            };
            for branch in &node.branches {
                if let Some(&dst_order) = self.order.get(&branch.dst) {
                    if dst_order <= src_order {
                        self.loops.insert(Edge {
                            src: node.source,
                            dst: branch.dst,
                        });
                    }
                }
            }
        }
    }

    /// An edge is useless iff its destination stays reachable from its
    /// source with the edge blocked and all loops ignored.
    fn find_useless_edges(&mut self) {
        let mut useless = HashSet::new();
        for node in self.nodes.values() {
            for branch in &node.branches {
                let edge = Edge {
                    src: node.source,
                    dst: branch.dst,
                };
                if self.reaches_without(edge, node.source, branch.dst) {
                    useless.insert(edge);
                }
            }
        }
        self.useless = useless;
    }

    fn reaches_without(&self, blocked: Edge, start: Address, end: Address) -> bool {
        let Some(&end_order) = self.order.get(&end) else {
            return false;
        };
        fn dfs(
            coverage: &OptimalCoverage,
            blocked: Edge,
            end: Address,
            end_order: usize,
            visited: &mut HashSet<Address>,
            address: Address,
        ) -> bool {
            match coverage.order.get(&address) {
                None => return false,
                Some(&order) if order > end_order => return false,
                Some(_) => {}
            }
            visited.insert(address);
            if let Some(node) = coverage.nodes.get(&address) {
                for branch in &node.branches {
                    let edge = Edge {
                        src: node.source,
                        dst: branch.dst,
                    };
                    if edge == blocked || coverage.loops.contains(&edge) {
                        continue;
                    }
                    if edge.dst == end {
                        return true;
                    }
                    if !visited.contains(&edge.dst)
                        && dfs(coverage, blocked, end, end_order, visited, edge.dst)
                    {
                        return true;
                    }
                }
            }
            false
        }
        let mut visited = HashSet::new();
        dfs(self, blocked, end, end_order, &mut visited, start)
    }

    /// DFS that snapshots the decision list at every terminal. Branches are
    /// visited head-last; when the head branch follows recorded conditionals
    /// the last decision flips to fallthrough, with an extra taken step for
    /// an unconditional head.
    fn build_paths(&mut self, entry_point: Address) {
        if self.nodes.is_empty() {
            self.paths.push(Path::new());
            return;
        }
        fn dfs(
            coverage: &OptimalCoverage,
            visited_loops: &mut HashSet<Edge>,
            path: &mut Path,
            out: &mut Vec<Path>,
            address: Address,
        ) {
            if coverage.ends.contains(&address) || !coverage.nodes.contains_key(&address) {
                out.push(path.clone());
                return;
            }
            let node = &coverage.nodes[&address];
            let mut steps_added = 0usize;
            let branch_order = (1..node.branches.len()).chain(std::iter::once(0));
            for index in branch_order {
                let branch = &node.branches[index];
                if index != 0 || steps_added == 0 {
                    let is_jump = matches!(
                        branch.kind,
                        BranchKind::Conditional | BranchKind::Unconditional
                    );
                    path.push(PathStep {
                        jump: branch.source,
                        take: is_jump,
                    });
                    steps_added += 1;
                } else {
                    if let Some(last) = path.last_mut() {
                        last.take = false;
                    }
                    if branch.kind == BranchKind::Unconditional {
                        path.push(PathStep {
                            jump: branch.source,
                            take: true,
                        });
                        steps_added += 1;
                    }
                }
                let edge = Edge {
                    src: node.source,
                    dst: branch.dst,
                };
                let mut entered_loop = false;
                if coverage.loops.contains(&edge) {
                    if !visited_loops.insert(edge) {
                        continue;
                    }
                    entered_loop = true;
                }
                if !coverage.useless.contains(&edge) {
                    dfs(coverage, visited_loops, path, out, edge.dst);
                }
                if entered_loop {
                    visited_loops.remove(&edge);
                }
            }
            path.truncate(path.len() - steps_added);
        }
        let Some((&start, _)) = self.nodes.range(entry_point..).next() else {
            self.paths.push(Path::new());
            return;
        };
        let mut visited_loops = HashSet::new();
        let mut path = Path::new();
        let mut paths = Vec::new();
        dfs(self, &mut visited_loops, &mut path, &mut paths, start);
        self.paths = paths;
    }
}

// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Workload descriptions.
//!
//! A workload is a line-oriented text file. Lines that are empty, start with
//! `#` or mention `stat` are ignored. A line starting with `phase` opens a
//! new phase; the value of the first phase marker is a start offset in
//! microseconds. Every other line is one flow, given as seven `label value`
//! pairs in a fixed order:
//!
//! ```text
//! phase 3000
//! type rdma_write src 0 sport 100 dst 9 dport 1 prio 3 size 3000
//! phase:0
//! type rdma_write src 9 sport 100 dst 0 dport 1 prio 3 size 1448
//! ```
//!
//! Labels are positional and their text is not checked. The destination
//! port of every flow is replaced by its phase index plus one.
//!
//! ```rust
//! use lockstep_phases::workload::WorkloadPlan;
//!
//! let plan: WorkloadPlan = "phase 2000\ntype t src 0 sport 1 dst 9 dport 7 prio 0 size 10\n"
//!     .parse()
//!     .unwrap();
//! assert_eq!(plan.num_phases(), 1);
//! assert_eq!(plan.phases()[0].flows[0].dst_port, 1);
//! assert_eq!(plan.start_offset_s(), 0.002);
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use lockstep_engine::types::SimError;

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("unable to open workload {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read workload line {line}: {source}")]
    Read {
        line: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("line {line}: flow record before the first phase marker")]
    FlowBeforePhase { line: usize },

    #[error("line {line}: priority {value} does not fit in 0-255")]
    PriorityRange { line: usize, value: u64 },

    #[error("phase {phase} flow {flow}: node {node} is outside a topology of {servers} servers")]
    NodeOutOfRange {
        phase: usize,
        flow: usize,
        node: u32,
        servers: u32,
    },
}

impl From<WorkloadError> for SimError {
    fn from(e: WorkloadError) -> Self {
        SimError(e.to_string())
    }
}

/// One flow of a phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowDescriptor {
    /// Type tag, carried for reporting only.
    pub kind: String,
    pub src_node: u32,
    pub src_port: u16,
    pub dst_node: u32,
    /// Always the index of the phase plus one.
    pub dst_port: u16,
    pub priority: u8,
    pub payload_len: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Phase {
    pub index: usize,
    pub flows: Vec<FlowDescriptor>,
}

/// The ordered phases of a workload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkloadPlan {
    phases: Vec<Phase>,
    start_offset_s: f64,
}

const FLOW_FIELDS: usize = 7;

impl WorkloadPlan {
    pub fn from_file(path: &Path) -> Result<Self, WorkloadError> {
        let file = File::open(path).map_err(|source| WorkloadError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(BufReader::new(file))
    }

    pub fn parse(reader: impl BufRead) -> Result<Self, WorkloadError> {
        let mut plan = Self::default();
        for (i, line) in reader.lines().enumerate() {
            let number = i + 1;
            let line = line.map_err(|source| WorkloadError::Read {
                line: number,
                source,
            })?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.contains("stat") {
                continue;
            }
            if is_phase_marker(line) {
                plan.open_phase(number, line)?;
            } else {
                plan.add_flow(number, line)?;
            }
        }
        Ok(plan)
    }

    fn open_phase(&mut self, number: usize, line: &str) -> Result<(), WorkloadError> {
        let mut tokens = line
            .split(|c: char| c.is_whitespace() || c == ':')
            .filter(|t| !t.is_empty())
            .skip(1);
        let offset_us: f64 = parse_value(number, "phase start", tokens.next())?;
        if tokens.next().is_some() {
            return Err(malformed(number, "unexpected tokens after phase marker"));
        }
        if self.phases.is_empty() {
            self.start_offset_s += offset_us / 1e6;
        }
        if self.phases.len() >= usize::from(u16::MAX) {
            return Err(malformed(number, "too many phases to number their ports"));
        }
        self.phases.push(Phase {
            index: self.phases.len(),
            flows: Vec::new(),
        });
        Ok(())
    }

    fn add_flow(&mut self, number: usize, line: &str) -> Result<(), WorkloadError> {
        let Some(phase) = self.phases.last_mut() else {
            return Err(WorkloadError::FlowBeforePhase { line: number });
        };

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 2 * FLOW_FIELDS {
            return Err(malformed(
                number,
                &format!(
                    "expected {} label/value tokens, found {}",
                    2 * FLOW_FIELDS,
                    tokens.len()
                ),
            ));
        }
        let values: Vec<&str> = tokens.chunks(2).map(|pair| pair[1]).collect();

        let priority: u64 = parse_value(number, "priority", Some(values[5]))?;
        let priority = u8::try_from(priority).map_err(|_| WorkloadError::PriorityRange {
            line: number,
            value: priority,
        })?;

        // The parsed destination port must be well formed but is not used
        let _: u16 = parse_value(number, "destination port", Some(values[4]))?;

        phase.flows.push(FlowDescriptor {
            kind: values[0].to_string(),
            src_node: parse_value(number, "source node", Some(values[1]))?,
            src_port: parse_value(number, "source port", Some(values[2]))?,
            dst_node: parse_value(number, "destination node", Some(values[3]))?,
            dst_port: (phase.index + 1) as u16,
            priority,
            payload_len: parse_value(number, "size", Some(values[6]))?,
        });
        Ok(())
    }

    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    #[must_use]
    pub fn phase(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }

    #[must_use]
    pub fn num_phases(&self) -> usize {
        self.phases.len()
    }

    #[must_use]
    pub fn num_flows(&self) -> usize {
        self.phases.iter().map(|p| p.flows.len()).sum()
    }

    /// Offset given by the first phase marker, in seconds.
    #[must_use]
    pub fn start_offset_s(&self) -> f64 {
        self.start_offset_s
    }

    /// Check that every node id names one of `servers` servers.
    pub fn validate_nodes(&self, servers: u32) -> Result<(), WorkloadError> {
        for phase in &self.phases {
            for (flow, descriptor) in phase.flows.iter().enumerate() {
                for node in [descriptor.src_node, descriptor.dst_node] {
                    if node >= servers {
                        return Err(WorkloadError::NodeOutOfRange {
                            phase: phase.index,
                            flow,
                            node,
                            servers,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl FromStr for WorkloadPlan {
    type Err = WorkloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

fn is_phase_marker(line: &str) -> bool {
    line.split(|c: char| c.is_whitespace() || c == ':')
        .next()
        .is_some_and(|first| first.eq_ignore_ascii_case("phase"))
}

fn malformed(line: usize, reason: &str) -> WorkloadError {
    WorkloadError::Malformed {
        line,
        reason: reason.to_string(),
    }
}

fn parse_value<T: FromStr>(line: usize, what: &str, token: Option<&str>) -> Result<T, WorkloadError> {
    let Some(token) = token else {
        return Err(malformed(line, &format!("missing {what}")));
    };
    token
        .parse()
        .map_err(|_| malformed(line, &format!("invalid {what} '{token}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKLOAD: &str = "\
# generated
phase 3000
type rdma_write src 0 sport 100 dst 9 dport 1 prio 3 size 3000
Type rdma_read src_node 9 src_port 100 dst_node 0 dst_port 55 priority 0 msg_len 1448

stat 1 2 3
phase:500
type rdma_write src 1 sport 100 dst 2 dport 1 prio 255 size 1
phase 0
";

    #[test]
    fn phases_and_flows_in_order() {
        let plan: WorkloadPlan = WORKLOAD.parse().unwrap();
        assert_eq!(plan.num_phases(), 3);
        assert_eq!(plan.num_flows(), 3);
        assert_eq!(plan.start_offset_s(), 0.003);

        let flows = &plan.phases()[0].flows;
        assert_eq!(
            flows[0],
            FlowDescriptor {
                kind: "rdma_write".to_string(),
                src_node: 0,
                src_port: 100,
                dst_node: 9,
                dst_port: 1,
                priority: 3,
                payload_len: 3000,
            }
        );
        assert_eq!(flows[1].kind, "rdma_read");
        assert_eq!(plan.phases()[1].flows[0].priority, 255);
        assert!(plan.phases()[2].flows.is_empty());
    }

    #[test]
    fn destination_port_is_the_phase_number() {
        let plan: WorkloadPlan = WORKLOAD.parse().unwrap();
        for phase in plan.phases() {
            for flow in &phase.flows {
                assert_eq!(usize::from(flow.dst_port), phase.index + 1);
            }
        }
    }

    #[test]
    fn phase_count_matches_markers() {
        for markers in 0..5 {
            let mut text = String::new();
            for i in 0..markers {
                text.push_str(&format!("phase {i}\n"));
                for _ in 0..i {
                    text.push_str("type t src 0 sport 0 dst 1 dport 0 prio 0 size 1\n");
                }
            }
            let plan: WorkloadPlan = text.parse().unwrap();
            assert_eq!(plan.num_phases(), markers);
            for (i, phase) in plan.phases().iter().enumerate() {
                assert_eq!(phase.index, i);
                assert_eq!(phase.flows.len(), i);
            }
        }
    }

    #[test]
    fn format_errors_name_the_line() {
        let cases = [
            ("type t src 0 sport 0 dst 1 dport 0 prio 0 size 1", 1),
            ("phase 0\ntype t src 0 sport 0 dst 1 dport 0 prio 0", 2),
            ("phase 0\n\ntype t src x sport 0 dst 1 dport 0 prio 0 size 1", 3),
            ("phase 0\ntype t src 0 sport 0 dst 1 dport 0 prio 300 size 1", 2),
            ("phase zero", 1),
            ("phase", 1),
        ];
        for (text, line) in cases {
            let err = text.parse::<WorkloadPlan>().unwrap_err();
            let reported = match err {
                WorkloadError::Malformed { line, .. }
                | WorkloadError::FlowBeforePhase { line }
                | WorkloadError::PriorityRange { line, .. } => line,
                other => panic!("unexpected {other}"),
            };
            assert_eq!(reported, line, "{text}");
        }
    }

    #[test]
    fn node_bounds() {
        let plan: WorkloadPlan = WORKLOAD.parse().unwrap();
        assert!(plan.validate_nodes(10).is_ok());
        match plan.validate_nodes(9) {
            Err(WorkloadError::NodeOutOfRange {
                phase: 0,
                flow: 0,
                node: 9,
                servers: 9,
            }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = WorkloadPlan::from_file(Path::new("no/such/workload.txt")).unwrap_err();
        assert!(matches!(err, WorkloadError::Open { .. }));
        assert!(SimError::from(err).0.contains("no/such/workload.txt"));
    }
}

//! Built-in optimization steps.
//!
//! Both steps realize a partition decided elsewhere. They never choose how to
//! split a rule set; they only build the pipeline for a given split and splice
//! it in place of the source table.
//!
//! | Step | Arguments |
//! |------|-----------|
//! | `partition` | `<table> <group>...`, each group `indices[:bits[:kind]]` |
//! | `rekey` | `<table> <bits> [kind]` |
//!
//! Index and bit lists are comma separated; `a-b` is an inclusive range.

use std::str::FromStr;

use log::{info, warn};

use crate::rewrite::{chain_tables, redirect};
use crate::{
    Classifier, CompileError, MatchKind, MultiGroupClassifier, NodeId, ProgramGraph, Result,
    Session, Vmr,
};

/// One group of a partition: which entries, and optionally which key bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionGroup {
    /// Source entry indices, in order.
    pub indices: Vec<usize>,
    /// Key bits of the re-keyed table, or `None` to keep the source key.
    pub bits: Option<Vec<usize>>,
    /// Match kind of the re-keyed table's key.
    pub kind: MatchKind,
}

impl FromStr for PartitionGroup {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let indices = parse_list(parts.next().unwrap_or_default())?;
        let bits = parts.next().map(parse_list).transpose()?;
        let kind = parts
            .next()
            .map(str::parse::<MatchKind>)
            .transpose()?
            .unwrap_or(MatchKind::Ternary);
        if parts.next().is_some() {
            return Err(CompileError::invalid_argument(format!(
                "group {s:?} has more than three parts, expected indices[:bits[:kind]]"
            )));
        }
        Ok(Self {
            indices,
            bits,
            kind,
        })
    }
}

/// Parse `"0,2,4-7"` into `[0, 2, 4, 5, 6, 7]`.
fn parse_list(s: &str) -> Result<Vec<usize>> {
    let number = |t: &str| {
        t.trim()
            .parse::<usize>()
            .map_err(|e| CompileError::invalid_argument(format!("bad index {t:?} in {s:?}: {e}")))
    };
    let mut out = Vec::new();
    for token in s.split(',') {
        match token.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (number(lo)?, number(hi)?);
                if lo > hi {
                    return Err(CompileError::invalid_argument(format!(
                        "empty range {token:?} in {s:?}"
                    )));
                }
                out.extend(lo..=hi);
            }
            None => out.push(number(token)?),
        }
    }
    Ok(out)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Steps
// ═══════════════════════════════════════════════════════════════════════════════

/// `partition <table> <group>...`: split a table's rule set into groups.
///
/// One group yields a single classifier. Several groups are merged by a
/// [`MultiGroupClassifier`], and then every group must be re-keyed.
///
/// # Errors
///
/// [`CompileError::InvalidArgument`] for malformed arguments; any error from
/// [`Classifier::subset`], [`Classifier::reorder`] or
/// [`MultiGroupClassifier::new`].
pub fn partition(graph: ProgramGraph, args: &[String]) -> Result<ProgramGraph> {
    let Some((table, groups)) = args.split_first() else {
        return Err(CompileError::invalid_argument(
            "partition expects <table> <group>...",
        ));
    };
    if groups.is_empty() {
        return Err(CompileError::invalid_argument(format!(
            "partition of {table} needs at least one group"
        )));
    }
    let groups = groups
        .iter()
        .map(|g| g.parse())
        .collect::<Result<Vec<PartitionGroup>>>()?;
    realize(graph, table, &groups)
}

/// `rekey <table> <bits> [kind]`: move a whole table onto a narrower key.
///
/// # Errors
///
/// [`CompileError::InvalidArgument`] for malformed arguments; any error from
/// [`Classifier::reorder`].
pub fn rekey(graph: ProgramGraph, args: &[String]) -> Result<ProgramGraph> {
    let (table, bits, kind) = match args {
        [table, bits] => (table, bits, MatchKind::Ternary),
        [table, bits, kind] => (table, bits, kind.parse::<MatchKind>()?),
        _ => {
            return Err(CompileError::invalid_argument(
                "rekey expects <table> <bits> [kind]",
            ))
        }
    };
    let id = graph.program.table_by_name(table)?;
    let len = graph.vmr(id).map_or(0, Vmr::len);
    let group = PartitionGroup {
        indices: (0..len).collect(),
        bits: Some(parse_list(bits)?),
        kind,
    };
    realize(graph, table, &[group])
}

fn realize(
    mut graph: ProgramGraph,
    table_name: &str,
    groups: &[PartitionGroup],
) -> Result<ProgramGraph> {
    let ProgramGraph {
        program,
        vmrs,
        config,
    } = &mut graph;
    let table = program.table_by_name(table_name)?;
    let source_vmr = match vmrs.remove(&table) {
        Some(vmr) => vmr,
        None => Vmr::new(program, table),
    };
    check_coverage(table_name, source_vmr.len(), groups);
    if groups.len() > 1 {
        if let Some(i) = groups.iter().position(|g| g.bits.is_none()) {
            return Err(CompileError::invalid_argument(format!(
                "group {i} of {table_name} must be re-keyed to be merged with other groups"
            )));
        }
    }

    let source_len = source_vmr.len();
    let source = Classifier::new(program, table, source_vmr, None)?;
    let mut session = Session::new(program, config.clone())?;
    let mut classifiers = Vec::with_capacity(groups.len());
    for group in groups {
        let subset = source.subset(program, &group.indices)?;
        classifiers.push(match &group.bits {
            Some(bits) => subset.reorder(program, &mut session, bits, group.kind)?,
            None => subset,
        });
    }

    let (entry, setup, compiled) = match classifiers.len() {
        1 => {
            let classifier = classifiers.remove(0);
            (
                classifier.table(),
                classifier.setup_action(),
                classifier.collect_vmrs(),
            )
        }
        _ => {
            let merged = MultiGroupClassifier::new(program, &mut session, table_name, classifiers)?;
            let first = merged.members()[0].table();
            (first, Some(merged.setup_action()), merged.collect_vmrs())
        }
    };

    let head = match setup {
        Some(setup) => {
            let setup_table = program.add_action_table(setup)?;
            chain_tables(program, &[setup_table, entry]);
            setup_table
        }
        None => entry,
    };
    if head != table {
        redirect(program, NodeId::Table(table), NodeId::Table(head));
    }

    let tables = compiled.len();
    let entries: usize = compiled.values().map(Vmr::len).sum();
    vmrs.extend(compiled);
    info!(
        "{table_name}: {source_len} entries in {} groups became {entries} entries over {tables} tables",
        groups.len()
    );
    Ok(graph)
}

/// Warn when a partition does not use every source entry exactly once.
fn check_coverage(table: &str, len: usize, groups: &[PartitionGroup]) {
    let mut seen = vec![0usize; len];
    for &i in groups.iter().flat_map(|g| &g.indices) {
        if let Some(count) = seen.get_mut(i) {
            *count += 1;
        }
    }
    let missing: Vec<_> = (0..len).filter(|&i| seen[i] == 0).collect();
    let repeated: Vec<_> = (0..len).filter(|&i| seen[i] > 1).collect();
    if !missing.is_empty() {
        warn!("partition of {table} drops entries {missing:?}");
    }
    if !repeated.is_empty() {
        warn!("partition of {table} repeats entries {repeated:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CompilerConfig, MatchField, Program, TableId, VmrAction, VmrEntry};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    /// `pre -> acl -> post` with four entries on an 8-bit ternary key.
    fn graph() -> (ProgramGraph, TableId) {
        let mut program = Program::new();
        let header = program.add_header("m_t").unwrap();
        program.add_header_field(header, "a", 4).unwrap();
        program.add_header_field(header, "b", 4).unwrap();
        let m = program.add_instance(header, "m", true).unwrap();
        let no_op = program.action_by_name("no_op").unwrap();
        let drop = program.action_by_name("drop").unwrap();
        let reads = ["a", "b"]
            .iter()
            .map(|f| MatchField::new(program.instance_field(m, f).unwrap(), MatchKind::Ternary))
            .collect();
        let acl = program.add_table("acl", reads, vec![no_op, drop], None).unwrap();
        let pre = program.add_table("pre", vec![], vec![no_op], None).unwrap();
        let post = program.add_table("post", vec![], vec![no_op], None).unwrap();
        chain_tables(&mut program, &[pre, acl, post]);
        program.set_ingress(Some(NodeId::Table(pre)));

        let mut vmr = Vmr::new(&program, acl);
        for (pattern, action, prio) in [
            ("1*******", drop, 40),
            ("01******", no_op, 30),
            ("****1***", drop, 20),
            ("*****1**", no_op, 10),
        ] {
            vmr.push(VmrEntry::ternary(pattern, VmrAction::Unbound(action), prio).unwrap())
                .unwrap();
        }
        vmr.set_default_action(Some(VmrAction::Unbound(no_op)));
        let mut graph = ProgramGraph::new(program, CompilerConfig::default());
        graph.insert_vmr(vmr).unwrap();
        (graph, acl)
    }

    #[test]
    fn group_syntax() {
        let g: PartitionGroup = "0,1,3-5:7,2:lpm".parse().unwrap();
        assert_eq!(g.indices, vec![0, 1, 3, 4, 5]);
        assert_eq!(g.bits, Some(vec![7, 2]));
        assert_eq!(g.kind, MatchKind::Lpm);

        let g: PartitionGroup = "2".parse().unwrap();
        assert_eq!(g.bits, None);
        assert_eq!(g.kind, MatchKind::Ternary);

        assert!("1,x".parse::<PartitionGroup>().is_err());
        assert!("3-1".parse::<PartitionGroup>().is_err());
        assert!("0:1:exact:more".parse::<PartitionGroup>().is_err());
    }

    #[test]
    fn rekey_splices_setup_before_new_table() {
        let (graph, acl) = graph();
        let graph = rekey(graph, &args(&["acl", "0-1,4-5"])).unwrap();
        graph.validate().unwrap();

        let program = &graph.program;
        assert!(graph.vmr(acl).is_none());
        let narrow = program.table_by_name("p4t_acl_r").unwrap();
        let setup = program.table_by_name("p4t_compress_p4t_acl_r").unwrap();
        let pre = program.table_by_name("pre").unwrap();
        assert_eq!(program.table(pre).default_next(), Some(NodeId::Table(setup)));
        assert_eq!(program.table(setup).default_next(), Some(NodeId::Table(narrow)));

        let vmr = graph.vmr(narrow).unwrap();
        assert_eq!(vmr.bit_width(), 4);
        let patterns: Vec<_> = vmr.iter().map(|e| e.pattern()).collect();
        assert_eq!(patterns, vec!["1***", "01**", "**1*", "***1"]);
    }

    #[test]
    fn partition_merges_groups() {
        let (graph, acl) = graph();
        let graph = partition(graph, &args(&["acl", "0,1:0,1", "2,3:4,5"])).unwrap();
        graph.validate().unwrap();

        let program = &graph.program;
        let dispatcher = program.table_by_name("p4t_acl_dispatcher").unwrap();
        assert_eq!(graph.vmr(dispatcher).map(Vmr::len), Some(4));
        // dispatcher + two members
        assert_eq!(graph.vmrs.len(), 3);
        assert!(graph.vmr(acl).is_none());

        let post = program.table_by_name("post").unwrap();
        assert_eq!(program.table(dispatcher).default_next(), Some(NodeId::Table(post)));
        let pre = program.table_by_name("pre").unwrap();
        assert_ne!(program.table(pre).default_next(), Some(NodeId::Table(acl)));
    }

    #[test]
    fn merging_requires_rekeyed_groups() {
        let (graph, _) = graph();
        let err = partition(graph, &args(&["acl", "0,1", "2,3:4,5"])).unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[test]
    fn single_subset_keeps_table() {
        let (graph, acl) = graph();
        let graph = partition(graph, &args(&["acl", "3,0"])).unwrap();
        let vmr = graph.vmr(acl).unwrap();
        assert_eq!(vmr.len(), 2);
        assert_eq!(vmr[0].priority, 10);
        let pre = graph.program.table_by_name("pre").unwrap();
        assert_eq!(graph.program.table(pre).default_next(), Some(NodeId::Table(acl)));
    }

    #[test]
    fn malformed_arguments() {
        let (graph, _) = graph();
        assert!(partition(graph.clone(), &[]).is_err());
        assert!(partition(graph.clone(), &args(&["acl"])).is_err());
        assert!(rekey(graph.clone(), &args(&["acl"])).is_err());
        let err = rekey(graph, &args(&["nope", "0"])).unwrap_err();
        assert_eq!(err.kind(), "UnknownName");
    }
}
